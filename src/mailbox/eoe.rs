//! EoE — Ethernet-over-EtherCAT tunnelling (spec §4.10). Outbound frames are
//! chunked into 32-byte fragments behind a 4-byte fragment header; inbound
//! fragments are validated by fragment number and reassembled. Set-IP/Get-IP
//! use the same mailbox in a single request/response exchange.

use crate::error::Error;
use crate::link::RawEthernetPort;
use crate::osal::Osal;
use crate::port::Port;
use crate::slave::Slave;

use super::{mbx_receive, mbx_send, MailboxHeader, MAILBOX_HEADER_LEN, MBX_TYPE_EOE};

const EOE_FRAME_CHUNK_BYTES: usize = 32;
const EOE_FRAGMENT_HEADER_LEN: usize = 4;
const MAX_EOE_FRAME: usize = MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN + EOE_FRAME_CHUNK_BYTES;

const EOE_FRAME_TYPE_FRAME: u8 = 0x00;
const EOE_FRAME_TYPE_SET_IP: u8 = 0x02;
const EOE_FRAME_TYPE_GET_IP: u8 = 0x03;

/// Fragment header bits, little-endian over 4 bytes (spec §4.10):
/// word0: {frame-type:4, port:4, last-fragment:1, time-append:1, time-request:1}
/// word1 (fragment>0): {fragment-no:6, frame-offset-in-32-byte-units:6, frame-no:4}
/// word1 (fragment==0): {frame-length:11, frame-no:4, padding:1}
struct FragmentHeader([u8; EOE_FRAGMENT_HEADER_LEN]);

impl FragmentHeader {
    fn first(frame_no: u8, frame_length: u16, last_fragment: bool) -> Self {
        let mut bytes = [0u8; EOE_FRAGMENT_HEADER_LEN];
        let word0 = (EOE_FRAME_TYPE_FRAME as u16) | ((last_fragment as u16) << 8);
        bytes[0..2].copy_from_slice(&word0.to_le_bytes());
        let word1 = (frame_length & 0x07FF) | ((frame_no as u16 & 0x0F) << 11);
        bytes[2..4].copy_from_slice(&word1.to_le_bytes());
        Self(bytes)
    }

    fn continuation(frame_no: u8, fragment_no: u8, offset_units: u8, last_fragment: bool) -> Self {
        let mut bytes = [0u8; EOE_FRAGMENT_HEADER_LEN];
        let word0 = (EOE_FRAME_TYPE_FRAME as u16) | ((last_fragment as u16) << 8);
        bytes[0..2].copy_from_slice(&word0.to_le_bytes());
        let word1 = (fragment_no as u16 & 0x3F)
            | ((offset_units as u16 & 0x3F) << 6)
            | ((frame_no as u16 & 0x0F) << 12);
        bytes[2..4].copy_from_slice(&word1.to_le_bytes());
        Self(bytes)
    }

    fn parse(bytes: &[u8]) -> (u8, u8, bool) {
        let word0 = u16::from_le_bytes([bytes[0], bytes[1]]);
        let word1 = u16::from_le_bytes([bytes[2], bytes[3]]);
        let last_fragment = word0 & 0x0100 != 0;
        let fragment_no = (word1 & 0x3F) as u8;
        (fragment_no, (word1 >> 12) as u8 & 0x0F, last_fragment)
    }
}

fn build_mbx_header(buf: &mut [u8], counter: u8, length: u16) {
    let mut mbx = MailboxHeader(&mut buf[..MAILBOX_HEADER_LEN]);
    mbx.set_length(length);
    mbx.set_address(0);
    mbx.set_channel(0);
    mbx.set_priority(0);
    mbx.set_mailbox_type(MBX_TYPE_EOE);
    mbx.set_counter(counter);
}

/// Sends one Ethernet frame as a sequence of 32-byte fragments (spec §4.10
/// "outbound chunking").
pub fn send_frame<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    frame_no: u8,
    frame: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    let chunk_count = frame.chunks(EOE_FRAME_CHUNK_BYTES).count().max(1);
    for (i, chunk) in frame.chunks(EOE_FRAME_CHUNK_BYTES).enumerate() {
        let last = i + 1 == chunk_count;
        let header = if i == 0 {
            FragmentHeader::first(frame_no, frame.len() as u16, last)
        } else {
            FragmentHeader::continuation(frame_no, i as u8, (i * EOE_FRAME_CHUNK_BYTES / 32) as u8, last)
        };
        let mut buf = [0u8; MAX_EOE_FRAME];
        let counter = slave.mailbox.next_counter();
        let total = EOE_FRAGMENT_HEADER_LEN + chunk.len();
        build_mbx_header(&mut buf, counter, total as u16);
        buf[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN].copy_from_slice(&header.0);
        buf[MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN..MAILBOX_HEADER_LEN + total].copy_from_slice(chunk);
        mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + total], timeout_ns)?;
    }
    Ok(())
}

/// Intercepts fragment data before it enters the receive accumulator (spec
/// §4.10 "a hook may be registered to intercept fragment data").
pub type EoeHook = fn(&[u8]);

/// Receives one EoE fragment, validating its fragment number against
/// `expected_fragment` (spec §4.10 "inbound fragment-no validation"). Returns
/// `(data, last_fragment)`. `hook`, if set, sees the raw fragment payload
/// before it is copied into `out`.
pub fn receive_fragment<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    error_ring: &mut crate::error::ErrorRing,
    expected_fragment: u8,
    out: &mut [u8],
    hook: Option<EoeHook>,
    timeout_ns: u64,
) -> Result<(usize, bool), Error> {
    let mut buf = [0u8; MAX_EOE_FRAME];
    let n = mbx_receive(port, osal, slave, error_ring, &mut buf, timeout_ns)?;
    if n < MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN {
        return Err(Error::UnexpectedMailbox);
    }
    let (fragment_no, _frame_no, last) =
        FragmentHeader::parse(&buf[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN]);
    if fragment_no != expected_fragment {
        return Err(Error::UnexpectedMailbox);
    }
    let payload = &buf[MAILBOX_HEADER_LEN + EOE_FRAGMENT_HEADER_LEN..n];
    if let Some(hook) = hook {
        hook(payload);
    }
    let copy = out.len().min(payload.len());
    out[..copy].copy_from_slice(&payload[..copy]);
    Ok((copy, last))
}

/// Set-IP/Get-IP parameter presence flags (spec §4.10): which of
/// MAC/IPv4/subnet/gateway/DNS-ip/DNS-name are valid in the exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpParamFlags(pub u16);

impl IpParamFlags {
    pub const MAC: u16 = 1 << 0;
    pub const IPV4: u16 = 1 << 1;
    pub const SUBNET: u16 = 1 << 2;
    pub const GATEWAY: u16 = 1 << 3;
    pub const DNS_IP: u16 = 1 << 4;
    pub const DNS_NAME: u16 = 1 << 5;

    pub fn has(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpParams {
    pub flags: IpParamFlags,
    pub mac: [u8; 6],
    pub ipv4: [u8; 4],
    pub subnet: [u8; 4],
    pub gateway: [u8; 4],
    pub dns_ip: [u8; 4],
}

/// Single Set-IP exchange (spec §4.10: request carries the flag bitmap plus
/// whichever fields are set; slave replies with a result code in `data[0..2]`
/// of the response).
pub fn set_ip<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    params: &IpParams,
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_EOE_FRAME];
    let counter = slave.mailbox.next_counter();
    let body_len = 4 + 6 + 4 + 4 + 4 + 4;
    build_mbx_header(&mut buf, counter, body_len as u16);
    let body = &mut buf[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + body_len];
    body[0] = EOE_FRAME_TYPE_SET_IP;
    body[2..4].copy_from_slice(&params.flags.0.to_le_bytes());
    body[4..10].copy_from_slice(&params.mac);
    body[10..14].copy_from_slice(&params.ipv4);
    body[14..18].copy_from_slice(&params.subnet);
    body[18..22].copy_from_slice(&params.gateway);
    body[22..26].copy_from_slice(&params.dns_ip);
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + body_len], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    let mut reply = [0u8; MAX_EOE_FRAME];
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    if n < MAILBOX_HEADER_LEN + 4 {
        return Err(Error::UnexpectedMailbox);
    }
    let result = u16::from_le_bytes([reply[MAILBOX_HEADER_LEN + 2], reply[MAILBOX_HEADER_LEN + 3]]);
    if result == 0 {
        Ok(())
    } else {
        Err(Error::UnexpectedMailbox)
    }
}

/// Single Get-IP exchange (spec §4.10): an empty request, the slave's
/// response carries its current parameters in the same layout `set_ip`
/// sends.
pub fn get_ip<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    timeout_ns: u64,
) -> Result<IpParams, Error> {
    let mut buf = [0u8; MAX_EOE_FRAME];
    let counter = slave.mailbox.next_counter();
    build_mbx_header(&mut buf, counter, 4);
    buf[MAILBOX_HEADER_LEN] = EOE_FRAME_TYPE_GET_IP;
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 4], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    let mut reply = [0u8; MAX_EOE_FRAME];
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    let body_len = 4 + 6 + 4 + 4 + 4 + 4;
    if n < MAILBOX_HEADER_LEN + body_len {
        return Err(Error::UnexpectedMailbox);
    }
    let body = &reply[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + body_len];
    let flags = IpParamFlags(u16::from_le_bytes([body[2], body[3]]));
    let mut params = IpParams { flags, ..IpParams::default() };
    params.mac.copy_from_slice(&body[4..10]);
    params.ipv4.copy_from_slice(&body[10..14]);
    params.subnet.copy_from_slice(&body[14..18]);
    params.gateway.copy_from_slice(&body[18..22]);
    params.dns_ip.copy_from_slice(&body[22..26]);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fragment_header_encodes_length_and_frame_no() {
        let h = FragmentHeader::first(3, 96, true);
        let word1 = u16::from_le_bytes([h.0[2], h.0[3]]);
        assert_eq!(word1 & 0x07FF, 96);
        assert_eq!((word1 >> 11) & 0x0F, 3);
    }

    #[test]
    fn continuation_fragment_roundtrips_fragment_no() {
        let h = FragmentHeader::continuation(3, 5, 2, false);
        let (fragment_no, frame_no, last) = FragmentHeader::parse(&h.0);
        assert_eq!(fragment_no, 5);
        assert_eq!(frame_no, 3);
        assert!(!last);
    }
}
