//! Distributed Clocks (spec §4.5): propagation-delay measurement, system-time
//! offset, SYNC0/SYNC1 activation, and the cyclic FRMW feed for the
//! application's PI loop.

use crate::datagram::Command;
use crate::error::Error;
use crate::ethernet::PRIMARY_MAC;
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};
use crate::port::Port;
use crate::register::{
    REG_DC_CYCLIC_CONTROL, REG_DC_RECV_TIME_PORT0, REG_DC_SYNC0_CYCLE, REG_DC_SYNC1_CYCLE,
    REG_DC_SYSTEM_TIME, REG_DC_SYSTEM_TIME_DELAY, REG_DC_SYSTEM_TIME_OFFSET,
};
use crate::slave::Slave;
use log::debug;

const DC_TIMEOUT_NS: u64 = 1_000_000;
/// Round-trip compensation applied to intermediate slaves (teacher's
/// measured constant, `examples/andom9-ethercat/src/dc.rs`).
const LOOP_COMPENSATION_NS: u64 = 40;

/// Latches receive timestamps on every slave, then assigns a system-time
/// offset and propagation delay per slave (spec §4.5 first two bullets).
/// `reference_system_time_ns` is the master's own clock at the latch
/// instant (the first DC-capable slave is the reference).
pub fn measure_and_configure<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slaves: &mut [Slave],
    reference_system_time_ns: u64,
) -> Result<(), Error> {
    bwr(port, osal, REG_DC_RECV_TIME_PORT0, &[0u8; 4])?;

    let mut port0_times = [0u32; 200];
    let mut port1_times = [0u32; 200];
    let mut esc_times = [0u64; 200];

    for (i, slave) in slaves.iter().enumerate() {
        if !slave.capabilities.supports_dc {
            continue;
        }
        let mut recv = [0u8; 8];
        fprd(port, osal, slave.station_address, REG_DC_RECV_TIME_PORT0, &mut recv)?;
        port0_times[i] = u32::from_le_bytes([recv[0], recv[1], recv[2], recv[3]]);
        port1_times[i] = u32::from_le_bytes([recv[4], recv[5], recv[6], recv[7]]);

        let mut esc = [0u8; 8];
        fprd(port, osal, slave.station_address, REG_DC_SYSTEM_TIME, &mut esc)?;
        esc_times[i] = u64::from_le_bytes(esc);
    }

    for (i, slave) in slaves.iter_mut().enumerate() {
        if !slave.capabilities.supports_dc {
            continue;
        }
        let offset = reference_system_time_ns.wrapping_sub(esc_times[i]);
        fpwr(port, osal, slave.station_address, REG_DC_SYSTEM_TIME_OFFSET, &offset.to_le_bytes())?;

        let delay = if i == 0 {
            0
        } else {
            let parent_loop_delay = port1_times[i - 1].wrapping_sub(port0_times[i - 1]) as u64;
            let is_last = i + 1 == slaves.len();
            let (loop_delay, compensation) = if is_last {
                (0u64, 0u64)
            } else {
                (port1_times[i].wrapping_sub(port0_times[i]) as u64, LOOP_COMPENSATION_NS)
            };
            let delta = if loop_delay < parent_loop_delay {
                parent_loop_delay - loop_delay + compensation
            } else {
                loop_delay - parent_loop_delay + compensation
            };
            delta / 2
        };
        slave.topology.dc_propagation_delay_ns = delay as u32;
        fpwr(port, osal, slave.station_address, REG_DC_SYSTEM_TIME_DELAY, &(delay as u32).to_le_bytes())?;
        debug!("slave {i}: propagation delay {delay}ns, offset {offset}ns");
    }

    Ok(())
}

/// Activates SYNC0 (and optionally SYNC1) on every DC-capable slave with the
/// caller-supplied cycle time(s) (spec §4.5 third bullet).
pub fn activate_sync(
    port: &mut Port<impl RawEthernetPort>,
    osal: &impl Osal,
    slaves: &[Slave],
    sync0_cycle_ns: u32,
    sync1_cycle_ns: Option<u32>,
) -> Result<(), Error> {
    for slave in slaves {
        if !slave.capabilities.supports_dc {
            continue;
        }
        fpwr(port, osal, slave.station_address, REG_DC_SYNC0_CYCLE, &sync0_cycle_ns.to_le_bytes())?;
        let mut control = 0b0000_0001u8; // SYNC0 enable
        if let Some(cycle1) = sync1_cycle_ns {
            fpwr(port, osal, slave.station_address, REG_DC_SYNC1_CYCLE, &cycle1.to_le_bytes())?;
            control |= 0b0000_0010;
        }
        fpwr(port, osal, slave.station_address, REG_DC_CYCLIC_CONTROL, &[control])?;
    }
    Ok(())
}

/// Deactivates the DC cyclic unit (`config_init` step before remapping,
/// spec §4.3/§4.5).
pub fn deactivate(port: &mut Port<impl RawEthernetPort>, osal: &impl Osal) -> Result<(), Error> {
    bwr(port, osal, REG_DC_CYCLIC_CONTROL, &[0u8])
}

/// Builds the FRMW datagram embedded in every process-data cycle's second
/// position, reading back the reference slave's SYSTIME so the caller can
/// feed a PI loop (spec §4.5 fourth bullet, §4.12 step 2).
pub fn frmw_command(reference_station_address: u16) -> Command {
    Command::Frmw { adp: reference_station_address, ado: REG_DC_SYSTEM_TIME }
}

fn bwr<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, register: u16, data: &[u8]) -> Result<(), Error> {
    exchange(port, osal, Command::Bwr { ado: register }, data)?;
    Ok(())
}

fn fpwr<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, adp: u16, register: u16, data: &[u8]) -> Result<(), Error> {
    exchange(port, osal, Command::Fpwr { adp, ado: register }, data)?;
    Ok(())
}

fn fprd<L: RawEthernetPort>(port: &mut Port<L>, osal: &impl Osal, adp: u16, register: u16, out: &mut [u8]) -> Result<(), Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, DC_TIMEOUT_NS);
    let zeros = [0u8; 8];
    {
        let mut b = crate::datagram::FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, Command::Fprd { adp, ado: register }, &zeros[..out.len()])?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 500_000, deadline.remaining_ns(osal))?;
    let payload = port.rx_payload(idx);
    if let Some(view) = crate::datagram::iter_datagrams(payload).next() {
        let data = view.data();
        let n = out.len().min(data.len());
        out[..n].copy_from_slice(&data[..n]);
    }
    Ok(())
}

fn exchange<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    command: Command,
    payload: &[u8],
) -> Result<u16, Error> {
    let idx = port.acquire_index()?;
    let mut buf = [0u8; 64];
    let deadline = Deadline::after(osal, DC_TIMEOUT_NS);
    {
        let mut b = crate::datagram::FrameBuilder::init(&mut buf, PRIMARY_MAC)?;
        b.push(idx, command, payload)?;
        let frame = b.finish();
        port.stage(idx, frame)?;
    }
    port.confirm(idx, osal, 500_000, deadline.remaining_ns(osal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frmw_command_targets_the_reference_slaves_systime() {
        match frmw_command(0x1001) {
            Command::Frmw { adp, ado } => {
                assert_eq!(adp, 0x1001);
                assert_eq!(ado, REG_DC_SYSTEM_TIME);
            }
            _ => panic!("expected Frmw"),
        }
    }
}
