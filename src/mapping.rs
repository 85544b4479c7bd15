//! Mapping engine (spec §4.4): resolves process-data sizes, programs
//! SyncManagers and FMMUs, and lays slaves out into a group's logical
//! address window.

use heapless::Vec;

use crate::datagram::Command;
use crate::error::Error;
use crate::group::{Group, MailboxStatusEntry, Segment};
use crate::iomap::{IoMap, OverlapMode};
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{Fmmu, SyncManager, FMMU_REG_SIZE, REG_FMMU0, REG_SM0, SM_REG_SIZE};
use crate::sii::SiiCache;
use crate::slave::{FmmuConfig, Slave, SyncManagerType};

/// `EC_MAXLRWDATA` minus the DC datagram reservation the first segment of a
/// group must leave room for (SPEC_FULL §1, pinned from SOEM).
pub const EC_MAXLRWDATA: u16 = 1486;
pub const EC_FIRSTDCDATAGRAM: u16 = 12;

/// Byte offset of the SM status field (bits 47:40 of the 8-byte SM register
/// block, register.rs `SyncManager::status`) within SM1's register window.
const SM_STATUS_BYTE_OFFSET: u16 = 5;

/// Resolves one slave's process-data bit sizes (spec §4.4 step 2). The
/// preference order is CoE Complete-Access -> CoE per-entry -> SoE IDN map
/// -> SII PDO section; this core implements the SII fallback directly and
/// exposes hooks for the mailbox-backed earlier preferences.
pub fn resolve_pdo_sizes(sii: &SiiCache) -> Result<(u32, u32), Error> {
    if sii.rx_pdo_bits == 0 && sii.tx_pdo_bits == 0 && sii.sync_managers.is_empty() {
        return Err(Error::NoPdoMapping);
    }
    Ok((sii.rx_pdo_bits, sii.tx_pdo_bits))
}

/// Programs SM0/SM1 (mailbox) in one write if present, then SM2.. (process
/// data) — a SyncManager with length 0 is left disabled (spec §4.4 step 3).
pub fn program_sync_managers<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    slave: &Slave,
) -> Result<(), Error> {
    let (mbx_write, mbx_read) = slave.mailbox_sync_managers();
    if let (Some(w), Some(r)) = (mbx_write, mbx_read) {
        let mut buf = [0u8; SM_REG_SIZE * 2];
        write_sm(&mut buf[0..SM_REG_SIZE], w);
        write_sm(&mut buf[SM_REG_SIZE..], r);
        fpwr(port, osal, station_address, REG_SM0, &buf)?;
    }
    for (i, sm) in slave.sync_managers.iter().enumerate().skip(2) {
        let mut buf = [0u8; SM_REG_SIZE];
        write_sm(&mut buf, sm);
        fpwr(port, osal, station_address, REG_SM0 + (i as u16) * (SM_REG_SIZE as u16), &buf)?;
    }
    Ok(())
}

fn write_sm(buf: &mut [u8], cfg: &crate::slave::SyncManagerConfig) {
    let mut sm = SyncManager(&mut buf[..]);
    sm.set_physical_start(cfg.start_address);
    sm.set_length(cfg.length);
    sm.set_control(cfg.control);
    // length 0 disables the channel regardless of the requested flag.
    sm.set_activate(if cfg.enabled && cfg.length > 0 { 1 } else { 0 });
}

/// One FMMU + logical-address allocation for a single slave's
/// contiguous-direction SyncManager run (spec §4.4 "walk slaves").
struct Allocation {
    fmmu: FmmuConfig,
    logical_bytes: u16,
}

fn allocate_direction(
    sync_managers: &[crate::slave::SyncManagerConfig],
    direction_ty: SyncManagerType,
    logical_cursor: &mut u32,
    bit_cursor: &mut u8,
    packed: bool,
) -> Option<Allocation> {
    let run: Vec<&crate::slave::SyncManagerConfig, 4> = sync_managers
        .iter()
        .filter(|sm| sm.ty == direction_ty && sm.enabled && sm.length > 0)
        .collect();
    if run.is_empty() {
        return None;
    }
    let physical_start = run[0].start_address;
    let total_bytes: u16 = run.iter().map(|sm| sm.length).sum();

    let logical_start = *logical_cursor;
    let logical_start_bit = *bit_cursor;
    let total_bits = total_bytes as u32 * 8;
    let end_bit = (logical_start_bit as u32 + total_bits).saturating_sub(1);

    if packed {
        *bit_cursor = ((logical_start_bit as u32 + total_bits) % 8) as u8;
        *logical_cursor += (logical_start_bit as u32 + total_bits) / 8;
    } else {
        *logical_cursor += total_bytes as u32;
        *bit_cursor = 0;
    }

    Some(Allocation {
        fmmu: FmmuConfig {
            logical_start,
            length: total_bytes,
            logical_start_bit,
            logical_end_bit: (end_bit % 8) as u8,
            physical_start,
            physical_start_bit: 0,
            is_read: direction_ty == SyncManagerType::Inputs,
            is_write: direction_ty == SyncManagerType::Outputs,
            active: true,
        },
        logical_bytes: total_bytes,
    })
}

/// Lays slaves into a group's logical window (spec §4.4 "Then layout"). Runs
/// outputs first, then inputs, tracking segmentation so no LRW datagram
/// would need to split a SyncManager, and the group's trailing 1-byte
/// mailbox-status FMMUs. `iomap` is the application-supplied IO map this
/// group's logical window aliases into (spec §3 "IO map: a contiguous byte
/// region the application supplies").
pub fn layout_group<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    group: &mut Group,
    iomap: &mut IoMap,
    slaves: &mut [Slave],
    mode: OverlapMode,
    packed: bool,
) -> Result<(), Error> {
    let mut logical_cursor = group.logical_start_address;
    let mut bit_cursor = 0u8;
    let mut segment_start = group.logical_start_address;
    let mut segment_bytes = 0u16;
    let mut first_segment = true;

    for &slave_idx in group.slaves.iter() {
        let slave = slaves
            .iter_mut()
            .find(|s| s.auto_increment_position == slave_idx)
            .ok_or(Error::NotFound)?;

        if let Some(alloc) = allocate_direction(
            &slave.sync_managers,
            SyncManagerType::Outputs,
            &mut logical_cursor,
            &mut bit_cursor,
            packed,
        ) {
            slave.process_data.output_byte_offset = alloc.fmmu.logical_start;
            slave.process_data.output_start_bit = alloc.fmmu.logical_start_bit;
            slave.process_data.output_bits = alloc.fmmu.length as u32 * 8;
            let _ = slave.fmmus.push(alloc.fmmu);
            group.output_bytes += alloc.logical_bytes as u32;
            close_segment_if_needed(group, &mut segment_start, &mut segment_bytes, alloc.logical_bytes, &mut first_segment);
        }
    }

    let input_start = match mode {
        OverlapMode::NonOverlap => logical_cursor,
        OverlapMode::Overlap => group.logical_start_address,
    };
    let mut input_cursor = input_start;
    let mut input_bit_cursor = 0u8;

    for &slave_idx in group.slaves.iter() {
        let slave = slaves
            .iter_mut()
            .find(|s| s.auto_increment_position == slave_idx)
            .ok_or(Error::NotFound)?;

        if let Some(alloc) = allocate_direction(
            &slave.sync_managers,
            SyncManagerType::Inputs,
            &mut input_cursor,
            &mut input_bit_cursor,
            packed,
        ) {
            slave.process_data.input_byte_offset = alloc.fmmu.logical_start;
            slave.process_data.input_start_bit = alloc.fmmu.logical_start_bit;
            slave.process_data.input_bits = alloc.fmmu.length as u32 * 8;
            let _ = slave.fmmus.push(alloc.fmmu);
            group.input_bytes += alloc.logical_bytes as u32;
            if mode == OverlapMode::NonOverlap {
                close_segment_if_needed(group, &mut segment_start, &mut segment_bytes, alloc.logical_bytes, &mut first_segment);
            }
        }

        // Program the output/input FMMU registers.
        for (i, fmmu) in slave.fmmus.iter().enumerate() {
            let mut buf = [0u8; FMMU_REG_SIZE];
            write_fmmu(&mut buf, fmmu);
            fpwr(port, osal, slave.station_address, REG_FMMU0 + (i as u16) * (FMMU_REG_SIZE as u16), &buf)?;
        }
    }

    // Reserve the group's main data region in the application's IO map, then
    // append a 1-byte read FMMU per mailbox-enabled slave pointing at its
    // SM1 status register (spec §4.4 "Finally append a 1-byte read FMMU per
    // mailbox-enabled slave"); these bytes form the mailbox-status array.
    iomap.reserve(group.output_bytes, group.input_bytes)?;
    for &slave_idx in group.slaves.iter() {
        let slave = slaves
            .iter_mut()
            .find(|s| s.auto_increment_position == slave_idx)
            .ok_or(Error::NotFound)?;
        if !slave.has_mailbox() {
            continue;
        }

        let offset = iomap.reserve_mailbox_status(1)?;
        let fmmu = FmmuConfig {
            logical_start: group.logical_start_address + offset,
            length: 1,
            logical_start_bit: 0,
            logical_end_bit: 7,
            physical_start: REG_SM0 + SM_REG_SIZE as u16 + SM_STATUS_BYTE_OFFSET,
            physical_start_bit: 0,
            is_read: true,
            is_write: false,
            active: true,
        };
        let fmmu_index = slave.fmmus.len();
        slave.fmmus.push(fmmu).map_err(|_| Error::Capacity)?;
        let mut buf = [0u8; FMMU_REG_SIZE];
        write_fmmu(&mut buf, &fmmu);
        fpwr(port, osal, slave.station_address, REG_FMMU0 + (fmmu_index as u16) * (FMMU_REG_SIZE as u16), &buf)?;

        let _ = group.mailbox_status.push(MailboxStatusEntry {
            slave_index: slave.auto_increment_position,
            byte_offset: offset as u16,
        });
        group.input_bytes += 1;
        close_segment_if_needed(group, &mut segment_start, &mut segment_bytes, 1, &mut first_segment);
    }

    if segment_bytes > 0 {
        flush_segment(group, &mut segment_start, &mut segment_bytes, &mut first_segment);
    }

    Ok(())
}

fn close_segment_if_needed(group: &mut Group, segment_start: &mut u32, segment_bytes: &mut u16, added: u16, first: &mut bool) {
    let limit = if *first { EC_MAXLRWDATA - EC_FIRSTDCDATAGRAM } else { EC_MAXLRWDATA };
    if *segment_bytes > 0 && *segment_bytes + added > limit {
        flush_segment(group, segment_start, segment_bytes, first);
    }
    *segment_bytes += added;
}

/// Pushes the in-progress segment onto `group.segments` and advances the
/// cursor past it (spec §4.4 "walk slaves", §4.12 per-segment LRW framing).
fn flush_segment(group: &mut Group, segment_start: &mut u32, segment_bytes: &mut u16, first: &mut bool) {
    let _ = group.segments.push(Segment { logical_address: *segment_start, length: *segment_bytes });
    *segment_start += *segment_bytes as u32;
    *segment_bytes = 0;
    *first = false;
    group.expected_output_wkc += 1;
    group.expected_input_wkc += 1;
}

fn write_fmmu(buf: &mut [u8], cfg: &FmmuConfig) {
    let mut fmmu = Fmmu(&mut buf[..]);
    fmmu.set_logical_start(cfg.logical_start);
    fmmu.set_length(cfg.length);
    fmmu.set_logical_start_bit(cfg.logical_start_bit);
    fmmu.set_logical_end_bit(cfg.logical_end_bit);
    fmmu.set_physical_start(cfg.physical_start);
    fmmu.set_physical_start_bit(cfg.physical_start_bit);
    fmmu.set_read_enable(cfg.is_read as u8);
    fmmu.set_write_enable(cfg.is_write as u8);
    fmmu.set_enable(cfg.active as u8);
}

fn fpwr<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, station_address: u16, register: u16, data: &[u8]) -> Result<(), Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, 1_000_000_000);
    {
        let mut b = crate::datagram::FrameBuilder::init(&mut buf, crate::ethernet::PRIMARY_MAC)?;
        b.push(idx, Command::Fpwr { adp: station_address, ado: register }, data)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::SyncManagerConfig;

    #[test]
    fn resolve_pdo_sizes_reports_no_mapping_when_empty() {
        let cache = SiiCache::default();
        assert_eq!(resolve_pdo_sizes(&cache), Err(Error::NoPdoMapping));
    }

    #[test]
    fn allocate_direction_byte_aligns_when_not_packed() {
        let sms = [SyncManagerConfig {
            start_address: 0x1100,
            length: 2,
            control: 0x24,
            ty: SyncManagerType::Outputs,
            enabled: true,
        }];
        let mut logical = 0u32;
        let mut bit = 0u8;
        let alloc = allocate_direction(&sms, SyncManagerType::Outputs, &mut logical, &mut bit, false).unwrap();
        assert_eq!(alloc.fmmu.logical_start, 0);
        assert_eq!(alloc.logical_bytes, 2);
        assert_eq!(logical, 2);
        assert_eq!(bit, 0);
    }

    #[test]
    fn layout_group_flushes_final_segment_that_never_overflowed() {
        use crate::group::Group;
        use crate::iomap::OverlapMode;
        use crate::link::loopback::LoopbackPort;
        use crate::osal::Osal;
        use crate::slave::Slave;

        struct FakeClock;
        impl Osal for FakeClock {
            fn now_ns(&self) -> u64 {
                0
            }
            fn usleep(&self, _micros: u32) {}
        }

        let mut port = Port::new(LoopbackPort::new());
        let mut group = Group::new(0x0001_0000);
        let _ = group.slaves.push(1);

        let mut slave = Slave::new(1);
        let _ = slave.sync_managers.push(SyncManagerConfig {
            start_address: 0x1100,
            length: 4,
            control: 0x24,
            ty: SyncManagerType::Outputs,
            enabled: true,
        });
        let mut slaves = [slave];

        let mut backing = [0u8; 64];
        let mut iomap = IoMap::new(&mut backing, OverlapMode::NonOverlap);
        layout_group(&mut port, &FakeClock, &mut group, &mut iomap, &mut slaves, OverlapMode::NonOverlap, false).unwrap();

        // A single small SyncManager never crosses the LRW limit, so the
        // only way it reaches `group.segments` is the trailing flush.
        assert_eq!(group.segments.len(), 1);
        assert_eq!(group.segments[0].logical_address, 0x0001_0000);
        assert_eq!(group.segments[0].length, 4);
    }
}
