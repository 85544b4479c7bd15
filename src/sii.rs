//! Slave Information Interface: the EEPROM read/write protocol (spec §6
//! "EEPROM read/write") and the byte-addressable cached view plus category
//! parsing the discovery/mapping engines consume (spec §3 "SII cache",
//! §4.3 step 7).

use heapless::{String, Vec};

use crate::datagram::Command;
use crate::error::Error;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{
    SiiControl, REG_SII_ADDRESS, REG_SII_CONTROL, REG_SII_DATA,
};
use crate::link::RawEthernetPort;

/// One-shot read chunk size the SII control register reports ("8-byte read
/// capability", spec §3).
pub const SII_READ_TIMEOUT_NS: u64 = 10_000_000;

/// Reads one SII word-address, returning up to 8 bytes (4 if the slave's
/// SII control reports a 4-byte read size).
pub fn eeprom_read<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    word_address: u16,
) -> Result<([u8; 8], usize), Error> {
    let deadline = Deadline::after(osal, SII_READ_TIMEOUT_NS);

    let mut addr_payload = [0u8; 4];
    addr_payload[0..2].copy_from_slice(&word_address.to_le_bytes());
    fpwr(port, osal, station_address, REG_SII_ADDRESS, &addr_payload, deadline)?;

    let mut ctrl_read = [0u8; 2];
    fprd(port, osal, station_address, REG_SII_CONTROL, &mut ctrl_read, deadline)?;
    let mut ctrl = SiiControl(ctrl_read);
    if ctrl.checksum_error() {
        return Err(Error::EepromChecksum);
    }
    ctrl.set_read_operation(true);
    let buf = ctrl.0;
    fpwr(port, osal, station_address, REG_SII_CONTROL, &buf, deadline)?;

    loop {
        let mut read = [0u8; 2];
        fprd(port, osal, station_address, REG_SII_CONTROL, &mut read, deadline)?;
        let status = SiiControl(read);
        if status.command_error() {
            return Err(Error::EepromBusy);
        }
        if !status.busy() && !status.read_operation() {
            let size = if status.read_size() != 0 { 8 } else { 4 };
            let mut data = [0u8; 8];
            fprd(port, osal, station_address, REG_SII_DATA, &mut data[..size], deadline)?;
            return Ok((data, size));
        }
        if deadline.expired(osal) {
            return Err(Error::EepromBusy);
        }
    }
}

/// Writes one SII word-address (spec §6 "EEPROM read/write").
pub fn eeprom_write<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    word_address: u16,
    data: u16,
) -> Result<(), Error> {
    let deadline = Deadline::after(osal, SII_READ_TIMEOUT_NS);

    let mut addr_payload = [0u8; 4];
    addr_payload[0..2].copy_from_slice(&word_address.to_le_bytes());
    fpwr(port, osal, station_address, REG_SII_ADDRESS, &addr_payload, deadline)?;

    let mut data_payload = [0u8; 8];
    data_payload[0..2].copy_from_slice(&data.to_le_bytes());
    fpwr(port, osal, station_address, REG_SII_DATA, &data_payload, deadline)?;

    let mut ctrl = [0u8; 2];
    let mut ctrl_view = SiiControl(&mut ctrl[..]);
    ctrl_view.set_write_access(true);
    ctrl_view.set_write_operation(true);
    fpwr(port, osal, station_address, REG_SII_CONTROL, &ctrl, deadline)?;

    loop {
        let mut read = [0u8; 2];
        fprd(port, osal, station_address, REG_SII_CONTROL, &mut read, deadline)?;
        let status = SiiControl(read);
        if status.command_error() {
            return Err(Error::EepromBusy);
        }
        if !status.busy() && !status.write_operation() {
            return Ok(());
        }
        if deadline.expired(osal) {
            return Err(Error::EepromBusy);
        }
    }
}

/// Issues an FPRD for `register` and copies the reply's data into `out`.
fn fprd<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    register: u16,
    out: &mut [u8],
    deadline: crate::osal::Deadline,
) -> Result<(), Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let zeros = [0u8; 8];
    {
        let mut b = crate::datagram::FrameBuilder::init(&mut buf, crate::ethernet::PRIMARY_MAC)?;
        b.push(idx, Command::Fprd { adp: station_address, ado: register }, &zeros[..out.len()])?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    let remaining = deadline.remaining_ns(osal);
    port.confirm(idx, osal, remaining.min(2_000_000), remaining)?;
    let payload = port.rx_payload(idx);
    if let Some(view) = crate::datagram::iter_datagrams(payload).next() {
        let data = view.data();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
    }
    Ok(())
}

fn fpwr<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    register: u16,
    data: &[u8],
    deadline: crate::osal::Deadline,
) -> Result<(), Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    {
        let mut b = crate::datagram::FrameBuilder::init(&mut buf, crate::ethernet::PRIMARY_MAC)?;
        b.push(idx, Command::Fpwr { adp: station_address, ado: register }, data)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    let remaining = deadline.remaining_ns(osal);
    port.confirm(idx, osal, remaining.min(2_000_000), remaining)?;
    Ok(())
}

/// Byte budget for the cached SII view (covers General/Strings/SM/FMMU/PDO
/// sections for one slave).
pub const SII_CACHE_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct SiiGeneral {
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,
    pub rx_mailbox_address: u16,
    pub rx_mailbox_length: u16,
    pub tx_mailbox_address: u16,
    pub tx_mailbox_length: u16,
    pub mailbox_protocols: u16,
    /// E-bus current draw, mA.
    pub ebus_current_ma: i16,
    /// LRW block bit: the slave cannot process LRW and needs LRD+LWR.
    pub lrw_blocked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SiiSyncManager {
    pub physical_start: u16,
    pub length: u16,
    pub control: u8,
    pub enable: bool,
    pub ty: crate::slave::SyncManagerType,
}

/// Decodes a SyncManager's role from its SII index and control byte. Index
/// 0/1 are conventionally mailbox-out/mailbox-in; index 2+ is process data,
/// direction taken from the control byte's bit 2 (ECAT read/write select).
fn decode_sm_type(index: usize, control: u8) -> crate::slave::SyncManagerType {
    use crate::slave::SyncManagerType;
    match index {
        0 => SyncManagerType::MbxWrite,
        1 => SyncManagerType::MbxRead,
        _ if control & 0b0000_0100 != 0 => SyncManagerType::Inputs,
        _ => SyncManagerType::Outputs,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SiiFmmuFunction {
    pub function: u8, // 0=unused,1=outputs,2=inputs,3=syncmanager status
}

#[derive(Debug, Clone, Copy)]
pub struct PdoEntry {
    pub index: u16,
    pub subindex: u8,
    pub bit_length: u8,
}

/// Parsed SII categories for one slave (spec §4.3 step 7).
#[derive(Debug, Clone, Default)]
pub struct SiiCache {
    pub general: SiiGeneral,
    pub name: String<64>,
    pub sync_managers: Vec<SiiSyncManager, 8>,
    pub fmmu_functions: Vec<SiiFmmuFunction, 4>,
    pub rx_pdo_bits: u32,
    pub tx_pdo_bits: u32,
    pub rx_pdos: Vec<PdoEntry, 32>,
    pub tx_pdos: Vec<PdoEntry, 32>,
}

const CAT_STRINGS: u16 = 10;
const CAT_GENERAL: u16 = 30;
const CAT_FMMU: u16 = 40;
const CAT_SYNCM: u16 = 41;
const CAT_TXPDO: u16 = 50;
const CAT_RXPDO: u16 = 51;
const CAT_END: u16 = 0xFFFF;

/// Parses the category list of a full raw SII dump (word-addressed, as read
/// via repeated [`eeprom_read`] calls). `words` starts at SII word address 0.
pub fn parse_categories(words: &[u8], quirks: &crate::quirks::Quirks) -> SiiCache {
    let mut cache = SiiCache::default();

    if words.len() >= 0x14 {
        cache.general.vendor_id = read_u32(words, 0x08 * 2);
        cache.general.product_code = read_u32(words, 0x0A * 2);
        cache.general.revision_number = read_u32(words, 0x0C * 2);
        cache.general.serial_number = read_u32(words, 0x0E * 2);
    }
    if words.len() >= 0x1A * 2 + 2 {
        cache.general.rx_mailbox_address = read_u16(words, 0x18 * 2);
        cache.general.rx_mailbox_length = read_u16(words, 0x19 * 2);
        cache.general.tx_mailbox_address = read_u16(words, 0x1A * 2);
        cache.general.tx_mailbox_length = read_u16(words, 0x1B * 2);
    }

    // Category list starts at word 0x40.
    let mut offset = 0x40 * 2;
    let mut strings: Vec<String<64>, 16> = Vec::new();

    while offset + 4 <= words.len() {
        let cat_type = read_u16(words, offset);
        if cat_type == CAT_END {
            break;
        }
        let cat_words = read_u16(words, offset + 2) as usize;
        let body_start = offset + 4;
        let body_end = (body_start + cat_words * 2).min(words.len());
        let body = &words[body_start..body_end];

        match cat_type {
            CAT_STRINGS => {
                strings = parse_strings(body);
            }
            CAT_GENERAL => {
                if body.len() >= 4 {
                    cache.general.mailbox_protocols = read_u16(body, 0x02);
                }
                if body.len() >= 0x0C {
                    cache.general.ebus_current_ma = read_u16(body, 0x0A) as i16;
                }
                if body.len() >= 0x0D {
                    cache.general.lrw_blocked = body[0x0C] & 0b0100_0000 != 0;
                }
                if let Some(idx) = body.get(0).copied() {
                    if idx != 0 {
                        if let Some(s) = strings.get(idx as usize - 1) {
                            let _ = cache.name.push_str(s.as_str());
                        }
                    }
                }
            }
            CAT_SYNCM => {
                let mut i = 0;
                let mut sm_index = 0usize;
                while i + 8 <= body.len() {
                    let control = body[i + 4];
                    let decoded = decode_sm_type(sm_index, control);
                    let sm = SiiSyncManager {
                        physical_start: read_u16(body, i),
                        length: read_u16(body, i + 2),
                        control,
                        enable: body[i + 6] & 0x01 != 0,
                        ty: quirks.apply_sm_type(sm_index, decoded),
                    };
                    let _ = cache.sync_managers.push(sm);
                    i += 8;
                    sm_index += 1;
                }
            }
            CAT_FMMU => {
                for &b in body.iter() {
                    let _ = cache.fmmu_functions.push(SiiFmmuFunction { function: b });
                }
            }
            CAT_RXPDO | CAT_TXPDO => {
                let (bits, pdos) = parse_pdo_section(body);
                if cat_type == CAT_RXPDO {
                    cache.rx_pdo_bits += bits;
                    for p in pdos {
                        let _ = cache.rx_pdos.push(p);
                    }
                } else {
                    cache.tx_pdo_bits += bits;
                    for p in pdos {
                        let _ = cache.tx_pdos.push(p);
                    }
                }
            }
            _ => {}
        }

        offset = body_end;
    }

    cache
}

fn parse_strings(body: &[u8]) -> Vec<String<64>, 16> {
    let mut out = Vec::new();
    if body.is_empty() {
        return out;
    }
    let count = body[0] as usize;
    let mut offset = 1;
    for _ in 0..count {
        if offset >= body.len() {
            break;
        }
        let len = body[offset] as usize;
        offset += 1;
        if offset + len > body.len() {
            break;
        }
        let mut s = String::new();
        if let Ok(text) = core::str::from_utf8(&body[offset..offset + len]) {
            let _ = s.push_str(text);
        }
        let _ = out.push(s);
        offset += len;
    }
    out
}

/// Parses a PDO mapping section (RxPDO/TxPDO category). Returns the total
/// bit width and the individual entries, including filler entries
/// (`0x0000:0x00`) which are counted but not surfaced as real objects
/// (spec §8 "PDO mapping with a filler entry").
fn parse_pdo_section(body: &[u8]) -> (u32, Vec<PdoEntry, 32>) {
    let mut bits = 0u32;
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 8 <= body.len() {
        let num_entries = body[offset + 6] as usize;
        offset += 8;
        for _ in 0..num_entries {
            if offset + 8 > body.len() {
                break;
            }
            let index = read_u16(body, offset);
            let subindex = body[offset + 2];
            let bit_length = body[offset + 5];
            bits += bit_length as u32;
            if index != 0 || subindex != 0 {
                let _ = entries.push(PdoEntry { index, subindex, bit_length });
            }
            offset += 8;
        }
    }
    (bits, entries)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    if offset + 2 > buf.len() {
        return 0;
    }
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    if offset + 4 > buf.len() {
        return 0;
    }
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_general_identity_fields() {
        let mut words = [0u8; 0x20 * 2];
        words[0x08 * 2..0x08 * 2 + 4].copy_from_slice(&0x0001_2233u32.to_le_bytes());
        words[0x0A * 2..0x0A * 2 + 4].copy_from_slice(&0x0044_5566u32.to_le_bytes());
        let cache = parse_categories(&words, &crate::quirks::Quirks::default());
        assert_eq!(cache.general.vendor_id, 0x0001_2233);
        assert_eq!(cache.general.product_code, 0x0044_5566);
    }

    #[test]
    fn pdo_section_counts_filler_entries() {
        // one SM-assign group header (8 bytes) with two entries: a filler
        // 0x0000:0x00 (8 bits) and a real entry (16 bits).
        let mut body = [0u8; 8 + 16];
        body[6] = 2; // num_entries
        // filler entry
        body[8 + 5] = 8;
        // real entry
        body[16] = 0x10;
        body[16 + 2] = 0x01;
        body[16 + 5] = 16;
        let (bits, entries) = parse_pdo_section(&body);
        assert_eq!(bits, 24);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bit_length, 16);
    }
}
