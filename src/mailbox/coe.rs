//! CoE / SDO (spec §4.8): expedited and segmented SDO download/upload,
//! Complete-Access, SDO-Info object-dictionary enumeration, and the
//! PDO-mapping helper the mapping engine falls back to when SII is absent.

use bitfield::bitfield;
use heapless::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::osal::Osal;
use crate::link::RawEthernetPort;
use crate::port::Port;
use crate::slave::Slave;

use super::{mbx_receive, mbx_send, MailboxHeader, MBX_TYPE_COE, MAILBOX_HEADER_LEN};

pub const COE_SERVICE_EMERGENCY: u8 = 1;
pub const COE_SERVICE_SDO_REQUEST: u8 = 2;
pub const COE_SERVICE_SDO_RESPONSE: u8 = 3;
pub const COE_SERVICE_TXPDO: u8 = 4;
pub const COE_SERVICE_RXPDO: u8 = 5;
pub const COE_SERVICE_SDO_INFO: u8 = 8;

/// ENI-level command direction (spec §6: "client-command-specifier
/// (1=read, 2=write)") — distinct from the wire-level SDO command
/// specifier nibble below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ClientCommandSpecifier {
    Read = 1,
    Write = 2,
}

/// Wire-level SDO request command specifiers (CANopen DS301 / ETG.1000-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoCommand {
    DownloadSegmentRequest = 0,
    InitiateDownloadRequest = 1,
    InitiateUploadRequest = 2,
    UploadSegmentRequest = 3,
    AbortTransferRequest = 4,
}

/// SDO abort codes (ETG.1000-6 table), the subset the core surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    Timeout,
    UnknownCommandSpecifier,
    OutOfMemory,
    UnsupportedAccess,
    WriteOnlyObject,
    ReadOnlyObject,
    ObjectDoesNotExist,
    ObjectCannotBeMapped,
    TypeMismatch,
    SubindexDoesNotExist,
    ValueOutOfRange,
    GeneralError,
    Other(u32),
}

impl AbortCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0503_0000 => Self::ToggleBitNotAlternated,
            0x0504_0000 => Self::Timeout,
            0x0504_0001 => Self::UnknownCommandSpecifier,
            0x0504_0005 => Self::OutOfMemory,
            0x0601_0000 => Self::UnsupportedAccess,
            0x0601_0001 => Self::WriteOnlyObject,
            0x0601_0002 => Self::ReadOnlyObject,
            0x0602_0000 => Self::ObjectDoesNotExist,
            0x0604_0041 => Self::ObjectCannotBeMapped,
            0x0607_0010 => Self::TypeMismatch,
            0x0609_0011 => Self::SubindexDoesNotExist,
            0x0609_0030 => Self::ValueOutOfRange,
            0x0800_0000 => Self::GeneralError,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::ToggleBitNotAlternated => 0x0503_0000,
            Self::Timeout => 0x0504_0000,
            Self::UnknownCommandSpecifier => 0x0504_0001,
            Self::OutOfMemory => 0x0504_0005,
            Self::UnsupportedAccess => 0x0601_0000,
            Self::WriteOnlyObject => 0x0601_0001,
            Self::ReadOnlyObject => 0x0601_0002,
            Self::ObjectDoesNotExist => 0x0602_0000,
            Self::ObjectCannotBeMapped => 0x0604_0041,
            Self::TypeMismatch => 0x0607_0010,
            Self::SubindexDoesNotExist => 0x0609_0011,
            Self::ValueOutOfRange => 0x0609_0030,
            Self::GeneralError => 0x0800_0000,
            Self::Other(c) => *c,
        }
    }
}

bitfield! {
    /// 2-byte CoE service header (ETG.1000-6): object number + service code.
    #[derive(Clone)]
    pub struct CoeHeader([u8]);
    u16;
    pub number, set_number: 8, 0;
    u8;
    pub service, set_service: 15, 12;
}

bitfield! {
    /// 4-byte SDO header for expedited/segmented init transfers.
    #[derive(Clone)]
    pub struct SdoHeader([u8]);
    u8;
    pub size_indicator, set_size_indicator: 0;
    pub expedited, set_expedited: 1;
    pub data_set_size, set_data_set_size: 3, 2;
    pub complete_access, set_complete_access: 4;
    pub command, set_command: 7, 5;
    u16;
    pub index, set_index: 23, 8;
    u8;
    pub subindex, set_subindex: 31, 24;
}

const MAX_SDO_FRAME: usize = MAILBOX_HEADER_LEN + 2 + 4 + 4;

fn build_header(buf: &mut [u8], counter: u8, service: u8, length: u16) {
    let mut mbx = MailboxHeader(&mut buf[..MAILBOX_HEADER_LEN]);
    mbx.set_length(length);
    mbx.set_address(0);
    mbx.set_channel(0);
    mbx.set_priority(0);
    mbx.set_mailbox_type(MBX_TYPE_COE);
    mbx.set_counter(counter);
    let mut coe = CoeHeader(&mut buf[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + 2]);
    coe.set_number(0);
    coe.set_service(service);
}

/// Expedited SDO download (spec §4.8 "Download ... expedited (payload <= 4
/// bytes)"). `data` must be 1-4 bytes; segmented transfer is used above
/// that via [`download_segmented`].
pub fn download_expedited<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    index: u16,
    subindex: u8,
    complete_access: bool,
    data: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    debug_assert!(data.len() <= 4);
    let mut buf = [0u8; MAX_SDO_FRAME];
    let counter = slave.mailbox.next_counter();
    let total = MAILBOX_HEADER_LEN + 2 + 4 + data.len();
    build_header(&mut buf, counter, COE_SERVICE_SDO_REQUEST, (2 + 4 + data.len()) as u16);
    {
        let mut sdo = SdoHeader(&mut buf[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 2 + 4]);
        sdo.set_size_indicator(true);
        sdo.set_expedited(true);
        sdo.set_data_set_size((4 - data.len()) as u8);
        sdo.set_complete_access(complete_access);
        sdo.set_command(SdoCommand::InitiateDownloadRequest as u8);
        sdo.set_index(index);
        sdo.set_subindex(subindex);
    }
    buf[MAILBOX_HEADER_LEN + 2 + 4..total].copy_from_slice(data);

    mbx_send(port, osal, slave, &buf[..total], timeout_ns)?;
    let mut reply = [0u8; MAX_SDO_FRAME];
    let mut error_ring = crate::error::ErrorRing::new();
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    check_sdo_response(&reply[..n], index, subindex)
}

/// Segmented SDO download (spec §4.8 "segmented transfers ... layered on
/// the mailbox protocol"). Splits `data` into 7-byte segments, toggling
/// the toggle bit each frame.
pub fn download_segmented<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    index: u16,
    subindex: u8,
    complete_access: bool,
    data: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    let mut buf = [0u8; MAX_SDO_FRAME];
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, COE_SERVICE_SDO_REQUEST, 2 + 4);
    {
        let mut sdo = SdoHeader(&mut buf[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 2 + 4]);
        sdo.set_size_indicator(true);
        sdo.set_expedited(false);
        sdo.set_complete_access(complete_access);
        sdo.set_command(SdoCommand::InitiateDownloadRequest as u8);
        sdo.set_index(index);
        sdo.set_subindex(subindex);
    }
    buf[MAILBOX_HEADER_LEN + 2 + 4..MAILBOX_HEADER_LEN + 2 + 4 + 4]
        .copy_from_slice(&(data.len() as u32).to_le_bytes());
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 2 + 4 + 4], timeout_ns)?;
    let mut error_ring = crate::error::ErrorRing::new();
    let mut reply = [0u8; MAX_SDO_FRAME];
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    check_sdo_response(&reply[..n], index, subindex)?;

    let mut toggle = false;
    let chunk_count = data.chunks(7).count();
    for (i, chunk) in data.chunks(7).enumerate() {
        let last = i + 1 == chunk_count;
        let mut seg = [0u8; MAILBOX_HEADER_LEN + 1 + 7];
        let counter = slave.mailbox.next_counter();
        build_header(&mut seg, counter, COE_SERVICE_SDO_REQUEST, 1 + chunk.len() as u16);
        let cmd_byte = (SdoCommand::DownloadSegmentRequest as u8) << 5
            | (u8::from(toggle) << 4)
            | (((7 - chunk.len()) as u8) << 1)
            | u8::from(last);
        seg[MAILBOX_HEADER_LEN] = cmd_byte;
        seg[MAILBOX_HEADER_LEN + 1..MAILBOX_HEADER_LEN + 1 + chunk.len()].copy_from_slice(chunk);
        mbx_send(port, osal, slave, &seg[..MAILBOX_HEADER_LEN + 1 + chunk.len()], timeout_ns)?;
        let _ = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
        toggle = !toggle;
    }
    Ok(())
}

fn check_sdo_response(reply: &[u8], index: u16, subindex: u8) -> Result<(), Error> {
    if reply.len() < MAILBOX_HEADER_LEN + 2 + 4 {
        return Err(Error::UnexpectedMailbox);
    }
    let coe = CoeHeader(&reply[MAILBOX_HEADER_LEN..MAILBOX_HEADER_LEN + 2]);
    let sdo = SdoHeader(&reply[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 2 + 4]);
    if coe.service() == COE_SERVICE_SDO_REQUEST && sdo.command() == SdoCommand::AbortTransferRequest as u8 {
        let code = u32::from_le_bytes([
            reply[MAILBOX_HEADER_LEN + 6],
            reply.get(MAILBOX_HEADER_LEN + 7).copied().unwrap_or(0),
            reply.get(MAILBOX_HEADER_LEN + 8).copied().unwrap_or(0),
            reply.get(MAILBOX_HEADER_LEN + 9).copied().unwrap_or(0),
        ]);
        return Err(Error::MailboxAbort(AbortCode::from_code(code)));
    }
    let _ = (index, subindex);
    Ok(())
}

/// Expedited SDO upload (spec §4.8 "upload (server -> client)").
pub fn upload_expedited<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    index: u16,
    subindex: u8,
    complete_access: bool,
    timeout_ns: u64,
) -> Result<Vec<u8, 4>, Error> {
    let mut buf = [0u8; MAX_SDO_FRAME];
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, COE_SERVICE_SDO_REQUEST, 2 + 4);
    {
        let mut sdo = SdoHeader(&mut buf[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 2 + 4]);
        sdo.set_command(SdoCommand::InitiateUploadRequest as u8);
        sdo.set_complete_access(complete_access);
        sdo.set_index(index);
        sdo.set_subindex(subindex);
    }
    mbx_send(port, osal, slave, &buf[..MAILBOX_HEADER_LEN + 2 + 4], timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    let mut reply = [0u8; MAX_SDO_FRAME];
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    check_sdo_response(&reply[..n], index, subindex)?;

    let sdo = SdoHeader(&reply[MAILBOX_HEADER_LEN + 2..MAILBOX_HEADER_LEN + 2 + 4]);
    let size = if sdo.size_indicator() { 4 - sdo.data_set_size() as usize } else { 4 };
    let mut out = Vec::new();
    let _ = out.extend_from_slice(&reply[MAILBOX_HEADER_LEN + 6..MAILBOX_HEADER_LEN + 6 + size]);
    Ok(out)
}

/// SDO-Info OD-list request (spec §4.8 "enumerate the object dictionary
/// (OD-list ...)"), used by slave-info tooling.
pub fn sdo_info_od_list<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    timeout_ns: u64,
) -> Result<Vec<u8, 256>, Error> {
    let mut buf = [0u8; MAILBOX_HEADER_LEN + 4];
    let counter = slave.mailbox.next_counter();
    build_header(&mut buf, counter, COE_SERVICE_SDO_INFO, 4);
    buf[MAILBOX_HEADER_LEN] = 0x01; // OD list request opcode
    buf[MAILBOX_HEADER_LEN + 2] = 0x01; // list type: all objects
    mbx_send(port, osal, slave, &buf, timeout_ns)?;

    let mut error_ring = crate::error::ErrorRing::new();
    let mut reply = [0u8; 256];
    let n = mbx_receive(port, osal, slave, &mut error_ring, &mut reply, timeout_ns)?;
    let mut out = Vec::new();
    let _ = out.extend_from_slice(&reply[..n]);
    Ok(out)
}

/// Reads an SM's PDO assignment (0x1C1x) and the pointed 0x1600/0x1A00 map
/// objects to build the bit layout the Mapping engine consumes when SII is
/// silent (spec §4.8 "PDO-mapping helpers ... build the mapping the
/// Mapping engine consumes").
pub fn read_pdo_mapping<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    sm_assign_index: u16,
    timeout_ns: u64,
) -> Result<u32, Error> {
    let count = upload_expedited(port, osal, slave, sm_assign_index, 0, false, timeout_ns)?;
    let n_entries = count.first().copied().unwrap_or(0);
    let mut total_bits = 0u32;
    for sub in 1..=n_entries {
        let pdo_index = upload_expedited(port, osal, slave, sm_assign_index, sub, false, timeout_ns)?;
        if pdo_index.len() < 2 {
            continue;
        }
        let pdo_map_index = u16::from_le_bytes([pdo_index[0], pdo_index[1]]);
        let entry_count = upload_expedited(port, osal, slave, pdo_map_index, 0, false, timeout_ns)?;
        let entries = entry_count.first().copied().unwrap_or(0);
        for entry_sub in 1..=entries {
            let entry = upload_expedited(port, osal, slave, pdo_map_index, entry_sub, false, timeout_ns)?;
            if entry.len() >= 4 {
                total_bits += entry[0] as u32;
            }
        }
    }
    Ok(total_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_code_roundtrips_through_wire_value() {
        assert_eq!(AbortCode::from_code(0x0609_0011), AbortCode::SubindexDoesNotExist);
        assert_eq!(AbortCode::SubindexDoesNotExist.code(), 0x0609_0011);
    }

    #[test]
    fn sdo_header_encodes_expedited_download() {
        let mut buf = [0u8; 4];
        let mut sdo = SdoHeader(&mut buf[..]);
        sdo.set_size_indicator(true);
        sdo.set_expedited(true);
        sdo.set_data_set_size(2);
        sdo.set_command(SdoCommand::InitiateDownloadRequest as u8);
        sdo.set_index(0x6060);
        sdo.set_subindex(0);

        let sdo = SdoHeader(&buf[..]);
        assert!(sdo.expedited());
        assert_eq!(sdo.data_set_size(), 2);
        assert_eq!(sdo.index(), 0x6060);
    }
}
