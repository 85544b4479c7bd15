//! FoE — file transfer over the mailbox (spec §4.9). Read and write with a
//! per-packet number handshake and an optional password; the slave must
//! already be in BOOT with SM0/SM1 reprogrammed from the EEPROM boot-mailbox
//! fields.

use heapless::Vec;

use crate::error::Error;
use crate::link::RawEthernetPort;
use crate::osal::Osal;
use crate::port::Port;
use crate::slave::Slave;

use super::{mbx_receive, mbx_send, MailboxHeader, MAILBOX_HEADER_LEN, MBX_TYPE_FOE};

const FOE_OPCODE_READ_REQUEST: u8 = 1;
const FOE_OPCODE_WRITE_REQUEST: u8 = 2;
const FOE_OPCODE_DATA: u8 = 3;
const FOE_OPCODE_ACK: u8 = 4;
const FOE_OPCODE_ERROR: u8 = 5;
const FOE_OPCODE_BUSY: u8 = 6;

pub const FOE_DATA_CHUNK_BYTES: usize = 512;
const MAX_FOE_FRAME: usize = MAILBOX_HEADER_LEN + 6 + FOE_DATA_CHUNK_BYTES;

fn build_header(buf: &mut [u8], counter: u8, length: u16) {
    let mut mbx = MailboxHeader(&mut buf[..MAILBOX_HEADER_LEN]);
    mbx.set_length(length);
    mbx.set_address(0);
    mbx.set_channel(0);
    mbx.set_priority(0);
    mbx.set_mailbox_type(MBX_TYPE_FOE);
    mbx.set_counter(counter);
}

/// Opens a file for reading and accumulates every data packet into `out`
/// until the slave sends a packet shorter than the chunk size (the EOF
/// marker, spec §4.9 "per-packet number handshake").
pub fn read_file<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    filename: &[u8],
    password: Option<&str>,
    out: &mut Vec<u8, 65536>,
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_FOE_FRAME];
    let password_value = password.map(|p| p.len() as u32).unwrap_or(0);
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, (6 + filename.len()) as u16);
    buf[MAILBOX_HEADER_LEN] = FOE_OPCODE_READ_REQUEST;
    buf[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 6].copy_from_slice(&password_value.to_le_bytes());
    buf[MAILBOX_HEADER_LEN + 6..MAILBOX_HEADER_LEN + 6 + filename.len()].copy_from_slice(filename);
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 6 + filename.len()], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    let mut expected_packet = 0u32;
    loop {
        let mut reply = [0u8; MAX_FOE_FRAME];
        let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
        let opcode = reply[MAILBOX_HEADER_LEN];
        if opcode == FOE_OPCODE_ERROR {
            return Err(Error::UnexpectedMailbox);
        }
        if opcode != FOE_OPCODE_DATA {
            return Err(Error::UnexpectedMailbox);
        }
        let packet_no = u32::from_le_bytes([
            reply[MAILBOX_HEADER_LEN + 2],
            reply[MAILBOX_HEADER_LEN + 3],
            reply[MAILBOX_HEADER_LEN + 4],
            reply[MAILBOX_HEADER_LEN + 5],
        ]);
        if packet_no != expected_packet {
            return Err(Error::UnexpectedMailbox);
        }
        let data = &reply[MAILBOX_HEADER_LEN + 6..n];
        out.extend_from_slice(data).map_err(|_| Error::Capacity)?;

        ack_packet(port, osal, slave, packet_no, timeout_ns)?;
        expected_packet = expected_packet.wrapping_add(1);
        if data.len() < FOE_DATA_CHUNK_BYTES {
            return Ok(());
        }
    }
}

fn ack_packet<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    packet_no: u32,
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAILBOX_HEADER_LEN + 6];
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, 6);
    buf[MAILBOX_HEADER_LEN] = FOE_OPCODE_ACK;
    buf[MAILBOX_HEADER_LEN + 2..].copy_from_slice(&packet_no.to_le_bytes());
    mbx_send(port, osal, slave, &buf, timeout_ns)
}

/// Writes a file in `FOE_DATA_CHUNK_BYTES`-sized packets, waiting for each
/// ACK before sending the next (spec §4.9).
pub fn write_file<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    filename: &[u8],
    password: Option<&str>,
    data: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_FOE_FRAME];
    let password_value = password.map(|p| p.len() as u32).unwrap_or(0);
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, (6 + filename.len()) as u16);
    buf[MAILBOX_HEADER_LEN] = FOE_OPCODE_WRITE_REQUEST;
    buf[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 6].copy_from_slice(&password_value.to_le_bytes());
    buf[MAILBOX_HEADER_LEN + 6..MAILBOX_HEADER_LEN + 6 + filename.len()].copy_from_slice(filename);
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 6 + filename.len()], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    await_ack_or_busy(port, osal, slave, &mut error_ring, timeout_ns)?;

    let mut packet_no = 0u32;
    for chunk in data.chunks(FOE_DATA_CHUNK_BYTES) {
        let mut frame = [0u8; MAX_FOE_FRAME];
        let counter = slave.mailbox.next_counter();
        build_header(&mut frame, counter, (6 + chunk.len()) as u16);
        frame[MAILBOX_HEADER_LEN] = FOE_OPCODE_DATA;
        frame[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 6].copy_from_slice(&packet_no.to_le_bytes());
        frame[MAILBOX_HEADER_LEN + 6..MAILBOX_HEADER_LEN + 6 + chunk.len()].copy_from_slice(chunk);
        mbx_send(port, osal, slave, &frame[..MAILBOX_HEADER_LEN + 6 + chunk.len()], timeout_ns)?;
        await_ack_or_busy(port, osal, slave, &mut error_ring, timeout_ns)?;
        packet_no = packet_no.wrapping_add(1);
    }
    Ok(())
}

fn await_ack_or_busy<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    error_ring: &mut crate::error::ErrorRing,
    timeout_ns: u64,
) -> Result<(), Error> {
    loop {
        let mut reply = [0u8; MAX_FOE_FRAME];
        let n = mbx_receive(port, osal, slave, error_ring, &mut reply, timeout_ns)?;
        let _ = n;
        match reply[MAILBOX_HEADER_LEN] {
            FOE_OPCODE_ACK => return Ok(()),
            FOE_OPCODE_BUSY => continue,
            FOE_OPCODE_ERROR => return Err(Error::UnexpectedMailbox),
            _ => return Err(Error::UnexpectedMailbox),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_512_bytes() {
        assert_eq!(FOE_DATA_CHUNK_BYTES, 512);
    }
}
