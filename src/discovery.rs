//! Discovery: the eight-step bring-up procedure that finds slaves on the
//! wire and populates their records (spec §4.3).

use heapless::Vec;

use crate::datagram::{split_logical, Command, FrameBuilder};
use crate::error::Error;
use crate::ethernet::PRIMARY_MAC;
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{
    DlStatus, REG_AL_CONTROL, REG_DL_STATUS, REG_FIXED_STATION_ADDRESS, REG_SII_ACCESS,
};
use crate::quirks::Quirks;
use crate::sii::{eeprom_read, parse_categories, SII_CACHE_BYTES};
use crate::slave::{AlState, Slave, SyncManagerConfig, SyncManagerType, STATION_ADDRESS_OFFSET};
use log::{debug, warn};

/// Depth of the slave table (SPEC_FULL §1, pinned from SOEM `EC_MAXSLAVE`).
pub const EC_MAXSLAVE: usize = 200;

const ALIAS_REGISTER: u16 = 0x0004;
const DISCOVERY_TIMEOUT_NS: u64 = 1_000_000_000;

/// Broadcast-count + per-slave configure pass (spec §4.3 steps 1-3, 6-8).
/// Returns the populated slave table in auto-increment position order.
pub fn config_init<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    auto_state_change: bool,
    quirks: &Quirks,
) -> Result<Vec<Slave, EC_MAXSLAVE>, Error> {
    // Step 1: benign broadcast write to force a known state, then INIT+ACK.
    bwr(port, osal, ALIAS_REGISTER, &[0u8; 2])?;
    bwr(port, osal, REG_AL_CONTROL, &[AlState::Init.to_code(true)])?;

    // Step 2: broadcast-read slave TYPE; the work counter is the slave count.
    let slave_count = brd_count(port, osal)?;
    debug!("discovery: {slave_count} slave(s) responded to broadcast count");

    let mut slaves: Vec<Slave, EC_MAXSLAVE> = Vec::new();
    let mut cache_by_id: Vec<(u32, u32, u32, crate::sii::SiiCache), 32> = Vec::new();

    for position in 0..slave_count {
        let adp = auto_increment_adp(position);
        let mut slave = Slave::new(position);

        // Step 3: per-slave bring-up: zero FMMU/SM, clear DC, INIT+ACK,
        // assign station address, force EEPROM to master control.
        for fmmu in 0..4u16 {
            fpwr(port, osal, adp, crate::register::REG_FMMU0 + fmmu * crate::register::FMMU_SIZE, &[0u8; 16])?;
        }
        for sm in 0..4u16 {
            fpwr(port, osal, adp, crate::register::REG_SM0 + sm * crate::register::SM_SIZE, &[0u8; 8])?;
        }
        fpwr(port, osal, adp, crate::register::REG_DC_CYCLIC_CONTROL, &[0u8])?;
        fpwr(port, osal, adp, crate::register::REG_DC_SYSTEM_TIME_OFFSET, &[0u8; 8])?;
        fpwr(port, osal, adp, REG_AL_CONTROL, &[AlState::Init.to_code(true)])?;
        fpwr(port, osal, adp, REG_FIXED_STATION_ADDRESS, &slave.station_address.to_le_bytes())?;
        fpwr(port, osal, adp, REG_SII_ACCESS, &[0u8, 0u8])?; // owner=master, pdi-accessed clear

        let mut alias = [0u8; 2];
        fprd(port, osal, adp, ALIAS_REGISTER, &mut alias)?;
        if u16::from_le_bytes(alias) != 0 {
            slave.alias = Some(u16::from_le_bytes(alias));
        }

        // Step 4: six one-register SII reads (word addresses per ETG.1000
        // EEPROM layout: 0x08 vendor, 0x0A product, 0x0C revision, 0x0E
        // serial, 0x18 rx-mailbox, 0x1A tx-mailbox).
        let (vendor, _) = eeprom_read(port, osal, slave.station_address, 0x08)?;
        let (product, _) = eeprom_read(port, osal, slave.station_address, 0x0A)?;
        let (revision, _) = eeprom_read(port, osal, slave.station_address, 0x0C)?;
        let (serial, _) = eeprom_read(port, osal, slave.station_address, 0x0E)?;
        let (rx_mbx, _) = eeprom_read(port, osal, slave.station_address, 0x18)?;
        let (tx_mbx, _) = eeprom_read(port, osal, slave.station_address, 0x1A)?;

        slave.vendor_id = u32::from_le_bytes([vendor[0], vendor[1], vendor[2], vendor[3]]);
        slave.product_code = u32::from_le_bytes([product[0], product[1], product[2], product[3]]);
        slave.revision_number = u32::from_le_bytes([revision[0], revision[1], revision[2], revision[3]]);
        slave.serial_number = u32::from_le_bytes([serial[0], serial[1], serial[2], serial[3]]);
        slave.mailbox_out_address = u16::from_le_bytes([rx_mbx[0], rx_mbx[1]]);
        slave.mailbox_out_length = u16::from_le_bytes([rx_mbx[2], rx_mbx[3]]);
        slave.mailbox_in_address = u16::from_le_bytes([tx_mbx[0], tx_mbx[1]]);
        slave.mailbox_in_length = u16::from_le_bytes([tx_mbx[2], tx_mbx[3]]);
        if !slave.has_mailbox() {
            warn!("slave {position}: no mailbox reported in EEPROM boot fields");
        }

        // Step 5: DL-status -> port-active bitmap and topology-derived parent.
        let mut dl = [0u8; 2];
        fprd(port, osal, adp, REG_DL_STATUS, &mut dl)?;
        let status = DlStatus(dl);
        let mut active = 0u8;
        let mut port_count = 0u8;
        for p in 0..4u8 {
            if status.port_active(p) {
                active |= 1 << p;
                port_count += 1;
            }
        }
        slave.topology.active_ports = active;
        slave.topology.port_count = port_count.max(1);
        derive_parent(&mut slaves, &mut slave, position);

        // Step 6: default mailbox SyncManagers from EEPROM boot fields.
        if slave.has_mailbox() {
            let _ = slave.sync_managers.push(SyncManagerConfig {
                start_address: slave.mailbox_out_address,
                length: slave.mailbox_out_length,
                control: 0x26,
                ty: SyncManagerType::MbxWrite,
                enabled: true,
            });
            let _ = slave.sync_managers.push(SyncManagerConfig {
                start_address: slave.mailbox_in_address,
                length: slave.mailbox_in_length,
                control: 0x22,
                ty: SyncManagerType::MbxRead,
                enabled: true,
            });
        }

        // Step 7: reuse an earlier slave's parsed SII if vendor+product+revision match.
        let id_key = (slave.vendor_id, slave.product_code, slave.revision_number);
        let reused = cache_by_id
            .iter()
            .find(|(v, p, r, _)| (*v, *p, *r) == id_key)
            .map(|(_, _, _, cache)| cache.clone());
        let sii = if let Some(cache) = reused {
            cache
        } else {
            let mut raw = [0u8; SII_CACHE_BYTES];
            let words = SII_CACHE_BYTES / 2;
            for w in 0..words {
                let (data, _) = eeprom_read(port, osal, slave.station_address, w as u16)?;
                raw[w * 2..w * 2 + 2].copy_from_slice(&data[0..2]);
            }
            let cache = parse_categories(&raw, quirks);
            let _ = cache_by_id.push((id_key.0, id_key.1, id_key.2, cache.clone()));
            cache
        };
        slave.name = sii.name.clone();
        slave.capabilities.coe.sdo = sii.general.mailbox_protocols & 0x04 != 0;
        slave.capabilities.protocols.0 = sii.general.mailbox_protocols;
        slave.capabilities.eeprom_8byte_read = false;

        // Step 7b: process-data SyncManagers (index 2+) from the SII's
        // SM category; mailbox SMs (0/1) stay sourced from the EEPROM boot
        // fields read in step 4, not this category.
        for sm in sii.sync_managers.iter() {
            if matches!(sm.ty, SyncManagerType::Outputs | SyncManagerType::Inputs) && sm.enable {
                let _ = slave.sync_managers.push(SyncManagerConfig {
                    start_address: sm.physical_start,
                    length: sm.length,
                    control: sm.control,
                    ty: sm.ty,
                    enabled: sm.enable,
                });
            }
        }

        // Step 8: if enabled, request PRE_OP+ACK.
        if auto_state_change {
            fpwr(port, osal, adp, REG_AL_CONTROL, &[AlState::PreOp.to_code(true)])?;
        }

        let _ = slaves.push(slave);
    }

    Ok(slaves)
}

/// Derives `position`'s parent by walking backward with a split counter
/// (spec §4.3 step 5). Slave 1's parent is the master (`None`).
fn derive_parent(slaves: &mut Vec<Slave, EC_MAXSLAVE>, slave: &mut Slave, position: u16) {
    if position == 0 {
        slave.topology.parent_slave = None;
        return;
    }
    let mut counter: i32 = 0;
    for idx in (0..slaves.len()).rev() {
        let candidate = &slaves[idx];
        let topology_count = candidate.topology.port_count;
        match topology_count {
            3 => counter += 1,
            4 => counter += 2,
            1 => counter -= 1,
            _ => {}
        }
        if counter >= 0 && topology_count > 1 {
            slave.topology.parent_slave = Some(candidate.auto_increment_position);
            return;
        }
    }
    slave.topology.parent_slave = Some(0);
}

fn auto_increment_adp(position: u16) -> u16 {
    // Auto-increment addressing counts down from 0 as frames pass through
    // slaves in position order (spec §4.1/§4.3): ADP = -position.
    (0u16).wrapping_sub(position)
}

fn bwr<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, register: u16, data: &[u8]) -> Result<u16, Error> {
    exchange(port, osal, Command::Bwr { ado: register }, data)
}

fn fpwr<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, adp: u16, register: u16, data: &[u8]) -> Result<u16, Error> {
    exchange(port, osal, Command::Fpwr { adp, ado: register }, data)
}

fn fprd<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, adp: u16, register: u16, out: &mut [u8]) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, DISCOVERY_TIMEOUT_NS);
    let zeros = [0u8; 32];
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fprd { adp, ado: register }, &zeros[..out.len()])?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    let wkc = port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))?;
    let payload = port.rx_payload(idx);
    if let Some(view) = crate::datagram::iter_datagrams(payload).next() {
        let data = view.data();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
    }
    Ok(wkc)
}

/// Broadcast-reads the slave TYPE register; the returned work counter is
/// the number of responding slaves (spec §4.3 step 2).
fn brd_count<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal) -> Result<u16, Error> {
    exchange(port, osal, Command::Brd { ado: 0x0000 }, &[0u8; 2])
}

fn exchange<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    command: Command,
    payload: &[u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, DISCOVERY_TIMEOUT_NS);
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, command, payload)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))
}

#[allow(dead_code)]
fn address_words_for_logical(address: u32) -> (u16, u16) {
    split_logical(address)
}

const RECOVER_SENTINEL_ADDRESS: u16 = 0xFFFF;

/// Re-addresses a slave that lost its configured station address (spec §4.6
/// "recover routine"): if the slave at `slave.auto_increment_position`'s
/// fixed address currently reads back 0, temporarily address it to a
/// sentinel, verify alias+vendor+product+revision against the cached
/// record, then restore the configured station address. Returns `Ok(true)`
/// once the slave answers at `slave.station_address` again.
pub fn recover_slave<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, slave: &Slave) -> Result<bool, Error> {
    let adp = auto_increment_adp(slave.auto_increment_position);
    let mut current = [0u8; 2];
    fprd(port, osal, adp, REG_FIXED_STATION_ADDRESS, &mut current)?;
    if u16::from_le_bytes(current) == slave.station_address {
        return Ok(true);
    }

    fpwr(port, osal, adp, REG_FIXED_STATION_ADDRESS, &RECOVER_SENTINEL_ADDRESS.to_le_bytes())?;

    let mut alias = [0u8; 2];
    fprd(port, osal, RECOVER_SENTINEL_ADDRESS, ALIAS_REGISTER, &mut alias)?;
    let (vendor, _) = eeprom_read(port, osal, RECOVER_SENTINEL_ADDRESS, 0x08)?;
    let (product, _) = eeprom_read(port, osal, RECOVER_SENTINEL_ADDRESS, 0x0A)?;
    let (revision, _) = eeprom_read(port, osal, RECOVER_SENTINEL_ADDRESS, 0x0C)?;
    let identity_matches = u32::from_le_bytes([vendor[0], vendor[1], vendor[2], vendor[3]]) == slave.vendor_id
        && u32::from_le_bytes([product[0], product[1], product[2], product[3]]) == slave.product_code
        && u32::from_le_bytes([revision[0], revision[1], revision[2], revision[3]]) == slave.revision_number
        && slave.alias.map(|a| a == u16::from_le_bytes(alias)).unwrap_or(true);

    if !identity_matches {
        warn!(
            "slave {}: recover found a mismatched device at the sentinel address, leaving it unaddressed",
            slave.auto_increment_position
        );
        return Ok(false);
    }

    fpwr(port, osal, RECOVER_SENTINEL_ADDRESS, REG_FIXED_STATION_ADDRESS, &slave.station_address.to_le_bytes())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_increment_adp_counts_down() {
        assert_eq!(auto_increment_adp(0), 0);
        assert_eq!(auto_increment_adp(1), 0xFFFF);
        assert_eq!(auto_increment_adp(2), 0xFFFE);
    }

    #[test]
    fn derive_parent_slave_one_parents_to_master() {
        let mut slaves: Vec<Slave, EC_MAXSLAVE> = Vec::new();
        let mut first = Slave::new(0);
        derive_parent(&mut slaves, &mut first, 0);
        assert_eq!(first.topology.parent_slave, None);
    }
}
