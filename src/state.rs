//! State driver (spec §4.6): writes AL-control to one slave or broadcasts,
//! polls AL-status, and surfaces latched AL status codes.

use heapless::Vec;

use crate::datagram::{Command, FrameBuilder};
use crate::error::Error;
use crate::ethernet::PRIMARY_MAC;
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{AlControl, AlStatus, REG_AL_CONTROL, REG_AL_STATUS};
use crate::slave::{AlState, Slave};
use log::warn;

/// Datagrams per frame for the batched read (SPEC_FULL §1, pinned from SOEM).
pub const MAX_FPRD_MULTI: usize = 64;

/// AL-status register plus AL-status-code register span one contiguous
/// 6-byte read: status at 0x0130, code at 0x0134.
const AL_STATUS_BLOCK_LEN: usize = 6;

const STATE_POLL_RETRY_NS: u64 = 10_000_000;

/// Writes `state` to one slave's AL-control (spec §4.6 "Writes AL-control to
/// one slave").
pub fn write_state(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
    station_address: u16,
    state: AlState,
    ack: bool,
) -> Result<u16, Error> {
    let mut buf = [0u8; 2];
    let mut ctrl = AlControl(&mut buf[..]);
    ctrl.set_state(state.to_code(ack) & 0x0F);
    ctrl.set_ack(ack);
    exchange(port, osal, Command::Fpwr { adp: station_address, ado: REG_AL_CONTROL }, &buf)
}

/// Broadcasts `state` to every slave's AL-control (spec §4.6 "or broadcasts").
pub fn broadcast_state(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
    state: AlState,
    ack: bool,
) -> Result<u16, Error> {
    let mut buf = [0u8; 2];
    let mut ctrl = AlControl(&mut buf[..]);
    ctrl.set_state(state.to_code(ack) & 0x0F);
    ctrl.set_ack(ack);
    exchange(port, osal, Command::Bwr { ado: REG_AL_CONTROL }, &buf)
}

/// Cheap fast-path state check: a BRD of AL-status ORs every responding
/// slave's bits together, so it can only confirm "all slaves are at least in
/// `requested`, none errored" — it can never reliably report BOOT, since
/// BOOT's code (0x03) is bitwise indistinguishable from a mix of INIT (0x01)
/// and PRE_OP (0x02) slaves (spec §4.6).
pub fn check_state_broadcast(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
) -> Result<(AlState, u16), Error> {
    let mut buf = [0u8; 2];
    let wkc = exchange_read(port, osal, Command::Brd { ado: REG_AL_STATUS }, &mut buf)?;
    let status = AlStatus(&buf[..]);
    Ok((AlState::from_code((status.state() | (u8::from(status.error()) << 4)) as u8), wkc))
}

/// Chunked per-slave read (spec §4.6 "chunks up to MAX_FPRD_MULTI FPRDs per
/// frame to collect per-slave AL-status+code"). Updates each slave's
/// `al_state` and `al_status_code` in place.
pub fn read_state_batch<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slaves: &mut [Slave],
) -> Result<(), Error> {
    for chunk in slaves.chunks_mut(MAX_FPRD_MULTI) {
        let idx = port.acquire_index()?;
        let mut buf = [0u8; crate::port::MAX_FRAME];
        let deadline = Deadline::after(osal, 1_000_000_000);
        let zeros = [0u8; AL_STATUS_BLOCK_LEN];
        {
            let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
            for slave in chunk.iter() {
                b.push(idx, Command::Fprd { adp: slave.station_address, ado: REG_AL_STATUS }, &zeros)?;
            }
            let frame = b.finish();
            port.stage(idx, frame)?;
        }
        port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))?;

        let payload = port.rx_payload(idx);
        let views: Vec<_, MAX_FPRD_MULTI> = crate::datagram::iter_datagrams(payload).collect();
        for (slave, view) in chunk.iter_mut().zip(views.iter()) {
            let data = view.data();
            if data.len() < AL_STATUS_BLOCK_LEN {
                continue;
            }
            let status = AlStatus(&data[0..2]);
            let code = u16::from_le_bytes([data[4], data[5]]);
            slave.al_state = AlState::from_code(status.state() | (u8::from(status.error()) << 4));
            slave.al_status_code = code;
        }
    }
    Ok(())
}

/// Requests `state` (broadcast) and polls until every slave reports it or
/// `timeout_ns` elapses (spec §4.6 "retries until requested state or
/// timeout"). Uses the broadcast fast path first and only falls back to the
/// per-slave batched read when it can't confirm agreement, so a healthy bus
/// pays for one BRD per poll instead of `ceil(n/64)` FPRDs.
pub fn wait_for_state<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slaves: &mut [Slave],
    requested: AlState,
    timeout_ns: u64,
) -> Result<(), Error> {
    let deadline = Deadline::after(osal, timeout_ns);
    loop {
        let (broadcast_state, wkc) = check_state_broadcast(port, osal)?;
        let all_responded = wkc as usize == slaves.len();
        if all_responded && broadcast_state == requested && !broadcast_state.is_error() {
            for slave in slaves.iter_mut() {
                slave.al_state = requested;
            }
            return Ok(());
        }

        read_state_batch(port, osal, slaves)?;
        if let Some(bad) = slaves.iter().find(|s| s.al_state.is_error()) {
            warn!(
                "slave {} latched AL error, status code 0x{:04X}",
                bad.station_address, bad.al_status_code
            );
            return Err(Error::AlStatusError { slave: bad.station_address, al_status_code: bad.al_status_code });
        }
        if slaves.iter().all(|s| s.al_state == requested) {
            return Ok(());
        }

        if deadline.expired(osal) {
            let last_seen = slaves
                .iter()
                .find(|s| s.al_state != requested)
                .map(|s| s.al_state)
                .unwrap_or(AlState::None);
            return Err(Error::AlStateTimeout { requested, last_seen });
        }
        osal.usleep((STATE_POLL_RETRY_NS / 1000) as u32);
    }
}

fn exchange(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
    command: Command,
    payload: &[u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, 1_000_000_000);
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, command, payload)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 2_000_000, deadline.remaining_ns(osal))
}

fn exchange_read(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
    command: Command,
    out: &mut [u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, 1_000_000_000);
    let zeros = [0u8; 8];
    {
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, command, &zeros[..out.len()])?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_code_collides_with_init_or_preop_bitwise_or() {
        let boot = AlState::Boot.to_code(false);
        let init_or_preop = AlState::Init.to_code(false) | AlState::PreOp.to_code(false);
        assert_eq!(boot, init_or_preop);
    }
}
