//! Mailbox subsystem (spec §4.7): pool, per-group queue, the cyclic
//! inbound/outbound passes, and the non-cyclic direct send/receive path
//! shared by CoE/FoE/EoE/SoE.

pub mod coe;
pub mod eoe;
pub mod foe;
pub mod pool;
pub mod queue;
pub mod soe;

use bitfield::bitfield;
use log::{debug, warn};

use crate::datagram::{Command, FrameBuilder};
use crate::error::{Error, ErrorKind, ErrorRecord, ErrorRing};
use crate::ethernet::PRIMARY_MAC;
use crate::group::Group;
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{SyncManager, REG_SM0, SM_REG_SIZE};
use crate::slave::{MailboxHandlerState, Slave};

use pool::MailboxPool;
use queue::{MailboxQueue, TicketState};

pub const MAILBOX_HEADER_LEN: usize = 6;

pub const MBX_TYPE_ERR: u8 = 0x00;
pub const MBX_TYPE_AOE: u8 = 0x01;
pub const MBX_TYPE_EOE: u8 = 0x02;
pub const MBX_TYPE_COE: u8 = 0x03;
pub const MBX_TYPE_FOE: u8 = 0x04;
pub const MBX_TYPE_SOE: u8 = 0x05;
pub const MBX_TYPE_VOE: u8 = 0x0F;

bitfield! {
    /// 6-byte mailbox service header, little-endian, common to every
    /// mailbox protocol (spec §6 GLOSSARY "mailbox").
    #[derive(Clone)]
    pub struct MailboxHeader([u8]);
    u16;
    pub length, set_length: 15, 0;
    pub address, set_address: 31, 16;
    u8;
    pub channel, set_channel: 37, 32;
    pub priority, set_priority: 39, 38;
    pub mailbox_type, set_mailbox_type: 43, 40;
    pub counter, set_counter: 47, 44;
}

/// Bit3 of the SM status byte: mailbox full (ETG.1000-4 SM status,
/// applies to both the write-direction and read-direction mailbox SMs).
const SM_STATUS_MAILBOX_FULL: u8 = 0x08;
/// Bit1 of the SM control/status bytes: the repeat-request/-ack pair used
/// to recover a lost mailbox response (ETG.1000-4).
const SM_REPEAT_BIT: u8 = 0x02;

fn sm_register(direction_sm_index: u16, station_address: u16) -> (u16, u16) {
    (station_address, REG_SM0 + direction_sm_index * SM_REG_SIZE as u16)
}

fn read_sm<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    sm_index: u16,
) -> Result<[u8; SM_REG_SIZE], Error> {
    let (adp, ado) = sm_register(sm_index, station_address);
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, 200_000_000);
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fprd { adp, ado }, &[0u8; SM_REG_SIZE])?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))?;
    let payload = port.rx_payload(idx);
    let mut out = [0u8; SM_REG_SIZE];
    if let Some(view) = crate::datagram::iter_datagrams(payload).next() {
        let data = view.data();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
    }
    Ok(out)
}

fn write_sm_control<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    sm_index: u16,
    control_byte: u8,
) -> Result<(), Error> {
    let (adp, ado) = sm_register(sm_index, station_address);
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, 200_000_000);
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fpwr { adp, ado: ado + 4 }, &[control_byte])?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))?;
    Ok(())
}

fn write_window<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    physical_start: u16,
    data: &[u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; crate::port::MAX_FRAME];
    let deadline = Deadline::after(osal, 200_000_000);
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fpwr { adp: station_address, ado: physical_start }, data)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))
}

fn read_window<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    station_address: u16,
    physical_start: u16,
    out: &mut [u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; crate::port::MAX_FRAME];
    let deadline = Deadline::after(osal, 200_000_000);
    let zeros = [0u8; pool::MAILBOX_BUFFER_BYTES];
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fprd { adp: station_address, ado: physical_start }, &zeros[..out.len()])?;
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

/// Classifies a received mailbox buffer into the slave's per-protocol
/// inbox, the error ring, or drops it as an emergency (spec §4.7 inbound
/// pass classification rule).
fn classify_inbound(slave: &mut Slave, error_ring: &mut ErrorRing, station_address: u16, osal: &impl Osal, data: &[u8]) {
    if data.len() < MAILBOX_HEADER_LEN {
        return;
    }
    let hdr = MailboxHeader(&data[..MAILBOX_HEADER_LEN]);
    let ty = hdr.mailbox_type();
    let body = &data[MAILBOX_HEADER_LEN..];

    if ty == MBX_TYPE_ERR {
        error_ring.push(ErrorRecord {
            timestamp_ns: osal.now_ns(),
            slave: station_address,
            index: 0,
            subindex: 0,
            kind: ErrorKind::Mbx,
            code: body.first().copied().unwrap_or(0) as u32,
        });
        return;
    }

    if ty == MBX_TYPE_COE && body.len() >= 2 {
        let coe_service = (body[1] >> 4) & 0x0F;
        if coe_service == coe::COE_SERVICE_EMERGENCY {
            error_ring.push(ErrorRecord {
                timestamp_ns: osal.now_ns(),
                slave: station_address,
                index: 0,
                subindex: 0,
                kind: ErrorKind::Emergency,
                code: u32::from_le_bytes([
                    body.get(2).copied().unwrap_or(0),
                    body.get(3).copied().unwrap_or(0),
                    0,
                    0,
                ]),
            });
            return;
        }
    }

    let inbox = match ty {
        MBX_TYPE_COE => &mut slave.mailbox.coe_inbox,
        MBX_TYPE_FOE => &mut slave.mailbox.foe_inbox,
        MBX_TYPE_EOE => &mut slave.mailbox.eoe_inbox,
        MBX_TYPE_SOE => &mut slave.mailbox.soe_inbox,
        _ => return,
    };
    if inbox.full {
        inbox.overrun_count += 1;
        warn!("slave {station_address}: protocol inbox overrun (type {ty})");
    } else {
        inbox.full = true;
    }
}

/// Drives the robust-mailbox toggle-repeat protocol on SM1 (spec §4.7:
/// "read SM1 status-extended, XOR the repeat bit, write back, poll SM1
/// -control until its repeat-ack bit matches, then clear recovery").
fn drive_mailbox_repeat<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
) -> Result<bool, Error> {
    let sm1 = read_sm(port, osal, slave.station_address, 1)?;
    let sm = SyncManager(&sm1[..]);
    let status_repeat = sm.status() & SM_REPEAT_BIT != 0;
    let requested_repeat = !status_repeat;
    let mut control = sm.control();
    control = if requested_repeat { control | SM_REPEAT_BIT } else { control & !SM_REPEAT_BIT };
    write_sm_control(port, osal, slave.station_address, 1, control)?;

    let confirm = read_sm(port, osal, slave.station_address, 1)?;
    let confirm_sm = SyncManager(&confirm[..]);
    let ack_matches = (confirm_sm.status() & SM_REPEAT_BIT != 0) == requested_repeat;
    if ack_matches {
        slave.mailbox.robust_substate = 0;
        slave.mailbox.islost = false;
    }
    Ok(ack_matches)
}

/// One cyclic inbound pass over a group's mailbox-status array (spec §4.7
/// "Inbound pass"). Advances the group's round-robin cursor by one slave
/// per call, matching the "per-call work budget" contract. `inputs` is the
/// group's most recently received process-data buffer; the mailbox-full bit
/// is read straight out of the FMMU-mapped byte the mapping engine already
/// placed there (`layout_group`'s mailbox-status FMMU), so this pass issues
/// no extra wire traffic of its own.
pub fn inbound_pass<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    group: &mut Group,
    slaves: &mut [Slave],
    error_ring: &mut ErrorRing,
    inputs: &[u8],
) -> Result<(), Error> {
    let Some(slave_index) = group.next_mailbox_slave() else {
        return Ok(());
    };
    let Some(slave) = slaves.iter_mut().find(|s| s.auto_increment_position == slave_index) else {
        return Ok(());
    };
    if !slave.has_mailbox() {
        return Ok(());
    }

    if slave.mailbox.robust_substate > 0 {
        match drive_mailbox_repeat(port, osal, slave) {
            Ok(true) => {}
            Ok(false) => slave.mailbox.robust_substate += 1,
            Err(_) => slave.mailbox.robust_substate += 1,
        }
        return Ok(());
    }

    let Some(entry) = group.mailbox_status.iter().find(|e| e.slave_index == slave_index) else {
        return Ok(());
    };
    let Some(&status_byte) = inputs.get(entry.byte_offset as usize) else {
        return Ok(());
    };
    if status_byte & SM_STATUS_MAILBOX_FULL == 0 {
        return Ok(());
    }

    let mut window = [0u8; pool::MAILBOX_BUFFER_BYTES.min(crate::port::MAX_FRAME)];
    let in_len = slave.mailbox_in_length as usize;
    if in_len == 0 || in_len > window.len() {
        return Ok(());
    }
    read_window(port, osal, slave.station_address, slave.mailbox_in_address, &mut window[..in_len])?;
    classify_inbound(slave, error_ring, slave.station_address, osal, &window[..in_len]);
    slave.mailbox.handler_state = MailboxHandlerState::Cyclic;
    debug!("slave {}: mailbox inbound classified", slave.station_address);
    Ok(())
}

/// One cyclic outbound pass (spec §4.7 "Outbound pass"): rotates one ticket
/// from the group queue and, if it targets a slave at PRE_OP or later,
/// attempts to FPWR the buffer.
pub fn outbound_pass<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    group: &mut Group,
    queue: &mut MailboxQueue,
    slaves: &mut [Slave],
    pool: &mut MailboxPool,
) -> Result<(), Error> {
    let Some(ticket) = queue.rotate_one() else {
        return Ok(());
    };
    if matches!(ticket.state, TicketState::Removed | TicketState::Done) {
        return Ok(());
    }
    let Some(slave) = slaves.iter().find(|s| s.auto_increment_position == ticket.slave_index) else {
        return Ok(());
    };
    if matches!(slave.al_state, crate::slave::AlState::Init | crate::slave::AlState::None) {
        return Ok(());
    }

    let data = pool.buffer(ticket.buffer_slot);
    let len = ticket.length as usize;
    let result = write_window(port, osal, slave.station_address, slave.mailbox_out_address, &data[..len.min(data.len())]);
    match result {
        Ok(wkc) if wkc > 0 => {
            queue.set_state(ticket.id, TicketState::Done);
            pool.drop_buffer(ticket.buffer_slot);
        }
        _ => queue.set_state(ticket.id, TicketState::Failed),
    }
    let _ = group;
    Ok(())
}

/// Direct `mbx-send` (spec §4.7 "Non-cyclic path"): verifies SM0 is empty,
/// writes the buffer, retrying once after the empty-poll on failure.
pub fn mbx_send<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &Slave,
    data: &[u8],
    timeout_ns: u64,
) -> Result<(), Error> {
    let deadline = Deadline::after(osal, timeout_ns);
    loop {
        let sm0 = read_sm(port, osal, slave.station_address, 0)?;
        let sm = SyncManager(&sm0[..]);
        if sm.status() & SM_STATUS_MAILBOX_FULL == 0 {
            break;
        }
        if deadline.expired(osal) {
            return Err(Error::NoFrame);
        }
        osal.usleep(1000);
    }
    let wkc = write_window(port, osal, slave.station_address, slave.mailbox_out_address, data)?;
    if wkc > 0 {
        return Ok(());
    }
    // One retry after a fresh empty-poll (spec §4.7).
    loop {
        let sm0 = read_sm(port, osal, slave.station_address, 0)?;
        let sm = SyncManager(&sm0[..]);
        if sm.status() & SM_STATUS_MAILBOX_FULL == 0 {
            break;
        }
        if deadline.expired(osal) {
            return Err(Error::NoFrame);
        }
    }
    let wkc = write_window(port, osal, slave.station_address, slave.mailbox_out_address, data)?;
    if wkc > 0 {
        Ok(())
    } else {
        Err(Error::NoFrame)
    }
}

/// Direct `mbx-receive` (spec §4.7 "Non-cyclic path"): polls SM1 "full",
/// reads the window, classifies it; on "lost" it runs the repeat protocol
/// first.
pub fn mbx_receive<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    error_ring: &mut ErrorRing,
    out: &mut [u8],
    timeout_ns: u64,
) -> Result<usize, Error> {
    if slave.mailbox.islost {
        drive_mailbox_repeat(port, osal, slave)?;
    }
    let deadline = Deadline::after(osal, timeout_ns);
    loop {
        let sm1 = read_sm(port, osal, slave.station_address, 1)?;
        let sm = SyncManager(&sm1[..]);
        if sm.status() & SM_STATUS_MAILBOX_FULL != 0 {
            break;
        }
        if deadline.expired(osal) {
            slave.mailbox.islost = true;
            return Err(Error::NoFrame);
        }
        osal.usleep(1000);
    }
    let n = out.len().min(slave.mailbox_in_length as usize);
    read_window(port, osal, slave.station_address, slave.mailbox_in_address, &mut out[..n])?;
    classify_inbound(slave, error_ring, slave.station_address, osal, &out[..n]);
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_header_roundtrip() {
        let mut buf = [0u8; MAILBOX_HEADER_LEN];
        let mut hdr = MailboxHeader(&mut buf[..]);
        hdr.set_length(10);
        hdr.set_address(0);
        hdr.set_channel(0);
        hdr.set_priority(0);
        hdr.set_mailbox_type(MBX_TYPE_COE);
        hdr.set_counter(3);

        let hdr = MailboxHeader(&buf[..]);
        assert_eq!(hdr.length(), 10);
        assert_eq!(hdr.mailbox_type(), MBX_TYPE_COE);
        assert_eq!(hdr.counter(), 3);
    }
}
