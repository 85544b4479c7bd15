//! SoE — Servo-profile over EtherCAT (spec §4.11). IDN read/write with a
//! bitmap selecting which elements {data-state, name, attribute, unit, min,
//! max, value, default} are transferred, and list/array transport carrying
//! current/max length alongside the element data.

use heapless::Vec;

use crate::error::Error;
use crate::link::RawEthernetPort;
use crate::osal::Osal;
use crate::port::Port;
use crate::slave::Slave;

use super::{mbx_receive, mbx_send, MailboxHeader, MAILBOX_HEADER_LEN, MBX_TYPE_SOE};

const SOE_OPCODE_READ_REQUEST: u8 = 1;
const SOE_OPCODE_READ_RESPONSE: u8 = 2;
const SOE_OPCODE_WRITE_REQUEST: u8 = 3;
const SOE_OPCODE_WRITE_RESPONSE: u8 = 4;

pub const MAX_SOE_DATA: usize = 1024;
const MAX_SOE_FRAME: usize = MAILBOX_HEADER_LEN + 4 + MAX_SOE_DATA;

/// Element selection bitmap (spec §4.11 "bitmap-selected elements").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementFlags(pub u8);

impl ElementFlags {
    pub const DATA_STATE: u8 = 1 << 0;
    pub const NAME: u8 = 1 << 1;
    pub const ATTRIBUTE: u8 = 1 << 2;
    pub const UNIT: u8 = 1 << 3;
    pub const MIN: u8 = 1 << 4;
    pub const MAX: u8 = 1 << 5;
    pub const VALUE: u8 = 1 << 6;
    pub const DEFAULT: u8 = 1 << 7;

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Which IDN block the request addresses (spec §4.11: drive numbers 0..7,
/// IDN 0..0x7FFF for standard parameters, 0x8000.. for product-specific).
#[derive(Debug, Clone, Copy)]
pub struct IdnAddress {
    pub drive_no: u8,
    pub idn: u16,
}

fn build_header(buf: &mut [u8], counter: u8, length: u16) {
    let mut mbx = MailboxHeader(&mut buf[..MAILBOX_HEADER_LEN]);
    mbx.set_length(length);
    mbx.set_address(0);
    mbx.set_channel(0);
    mbx.set_priority(0);
    mbx.set_mailbox_type(MBX_TYPE_SOE);
    mbx.set_counter(counter);
}

fn build_soe_request_header(buf: &mut [u8], opcode: u8, incomplete: bool, addr: IdnAddress, elements: ElementFlags) {
    buf[0] = opcode | ((incomplete as u8) << 3) | ((addr.drive_no & 0x07) << 4);
    buf[1] = elements.0;
    buf[2..4].copy_from_slice(&addr.idn.to_le_bytes());
}

/// Reads one IDN's selected elements (spec §4.11 "IDN read"). Segmented
/// transfer (the "incomplete" flag) is followed until the slave clears it.
pub fn read_idn<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    addr: IdnAddress,
    elements: ElementFlags,
    out: &mut Vec<u8, MAX_SOE_DATA>,
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_SOE_FRAME];
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, 4);
    build_soe_request_header(&mut buf[MAILBOX_HEADER_LEN..], SOE_OPCODE_READ_REQUEST, false, addr, elements);
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 4], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    loop {
        let mut reply = [0u8; MAX_SOE_FRAME];
        let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
        if n < MAILBOX_HEADER_LEN + 4 {
            return Err(Error::UnexpectedMailbox);
        }
        let header_byte = reply[MAILBOX_HEADER_LEN];
        let opcode = header_byte & 0x07;
        let incomplete = header_byte & 0x08 != 0;
        if opcode != SOE_OPCODE_READ_RESPONSE {
            return Err(Error::UnexpectedMailbox);
        }
        let data = &reply[MAILBOX_HEADER_LEN + 4..n];
        out.extend_from_slice(data).map_err(|_| Error::Capacity)?;
        if !incomplete {
            return Ok(());
        }
    }
}

/// Writes one IDN's selected elements (spec §4.11 "IDN write"). Data longer
/// than one mailbox frame is segmented with the "incomplete" flag.
pub fn write_idn<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    addr: IdnAddress,
    elements: ElementFlags,
    data: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    let max_segment = MAX_SOE_DATA;
    let mut sent = 0usize;
    loop {
        let remaining = &data[sent..];
        let segment_len = remaining.len().min(max_segment);
        let segment = &remaining[..segment_len];
        let incomplete = sent + segment_len < data.len();

        let mut buf = [0u8; MAX_SOE_FRAME];
        let counter = slave.mailbox.next_counter();
        build_header(&mut buf, counter, (4 + segment_len) as u16);
        build_soe_request_header(&mut buf[MAILBOX_HEADER_LEN..], SOE_OPCODE_WRITE_REQUEST, incomplete, addr, elements);
        buf[MAILBOX_HEADER_LEN + 4..MAILBOX_HEADER_LEN + 4 + segment_len].copy_from_slice(segment);
        mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 4 + segment_len], timeout_ns)?;

        let mut error_ring = crate::error::ErrorRing::new();
        let mut reply = [0u8; MAX_SOE_FRAME];
        let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
        if n < MAILBOX_HEADER_LEN + 1 || reply[MAILBOX_HEADER_LEN] & 0x07 != SOE_OPCODE_WRITE_RESPONSE {
            return Err(Error::UnexpectedMailbox);
        }

        sent += segment_len;
        if !incomplete {
            return Ok(());
        }
    }
}

/// A list/array IDN's transport header (spec §4.11: "current/max length").
#[derive(Debug, Clone, Copy, Default)]
pub struct ListHeader {
    pub current_length: u16,
    pub max_length: u16,
}

impl ListHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(Self {
            current_length: u16::from_le_bytes([data[0], data[1]]),
            max_length: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_encodes_drive_and_idn() {
        let mut buf = [0u8; 4];
        build_soe_request_header(
            &mut buf,
            SOE_OPCODE_READ_REQUEST,
            false,
            IdnAddress { drive_no: 2, idn: 0x0024 },
            ElementFlags(ElementFlags::VALUE),
        );
        assert_eq!(buf[0] & 0x07, SOE_OPCODE_READ_REQUEST);
        assert_eq!((buf[0] >> 4) & 0x07, 2);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 0x0024);
    }

    #[test]
    fn list_header_parses_current_and_max_length() {
        let data = [4, 0, 16, 0];
        let header = ListHeader::parse(&data).unwrap();
        assert_eq!(header.current_length, 4);
        assert_eq!(header.max_length, 16);
    }
}
