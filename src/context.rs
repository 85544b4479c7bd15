//! Context — the top-level master handle (spec §6 "User-facing entry
//! points"). Owns the Port, slave list, group list, error ring, mailbox
//! pool/queues and Quirks; every OSAL-dependent call still takes its
//! `&impl Osal` argument explicitly, the way every lower module does (§9
//! "no global singletons ... per-master-instance state on a Context value").

use heapless::Vec;

use crate::discovery::{self, EC_MAXSLAVE};
use crate::eni::NetworkInformation;
use crate::error::{Error, ErrorRing};
use crate::group::Group;
use crate::iomap::{IoMap, OverlapMode};
use crate::link::RawEthernetPort;
use crate::mailbox::coe::{AbortCode, ClientCommandSpecifier};
use crate::mailbox::pool::MailboxPool;
use crate::mailbox::queue::MailboxQueue;
use crate::mailbox::{self, coe, eoe, foe, soe};
use crate::mapping;
use crate::osal::Osal;
use crate::port::Port;
use crate::processdata::{self, CycleResult};
use crate::quirks::Quirks;
use crate::slave::{AlState, Slave};
use crate::state;
use log::info;

/// `EC_MAXGROUP` (SPEC_FULL §1, pinned from SOEM).
pub const MAX_GROUPS: usize = 8;

/// One group's mailbox bookkeeping; kept parallel to `Context::groups`
/// rather than folded into [`Group`] since the pool is shared master-wide
/// while the queue is per-group (spec §3 "Mailbox pool", "Queue").
#[derive(Default)]
struct GroupMailbox {
    queue: MailboxQueue,
}

/// The PO->SO user hook (spec §4.4 step 1, §9 "Dynamic dispatch for PO→SO
/// hook"): called for each slave as `config_map_group` drives it from
/// PRE_OP toward SAFE_OP, after the ENI's PS-transition commands replay.
pub type PreOpToSafeOpHook = fn(&mut Slave, u16) -> Result<(), Error>;

/// The master handle applications hold for the lifetime of the bus (spec §6
/// "initialize / ... / close").
pub struct Context<L: RawEthernetPort> {
    port: Port<L>,
    quirks: Quirks,
    error_ring: ErrorRing,
    slaves: Vec<Slave, EC_MAXSLAVE>,
    groups: Vec<Group, MAX_GROUPS>,
    group_mailboxes: Vec<GroupMailbox, MAX_GROUPS>,
    mailbox_pool: MailboxPool,
    eni: NetworkInformation,
    po_so_hook: Option<PreOpToSafeOpHook>,
    eoe_hook: Option<eoe::EoeHook>,
}

impl<L: RawEthernetPort> Context<L> {
    /// `initialize` (spec §6): opens the single primary link.
    pub fn initialize(primary_link: L, quirks: Quirks) -> Self {
        info!("master initializing (single link)");
        Self {
            port: Port::new(primary_link),
            quirks,
            error_ring: ErrorRing::new(),
            slaves: Vec::new(),
            groups: Vec::new(),
            group_mailboxes: Vec::new(),
            mailbox_pool: MailboxPool::new(),
            eni: NetworkInformation::new(),
            po_so_hook: None,
            eoe_hook: None,
        }
    }

    /// `initialize_redundant` (spec §6): opens primary + secondary links for
    /// ring-break recovery (§4.1 "Redundant mode").
    pub fn initialize_redundant(primary_link: L, secondary_link: L, quirks: Quirks) -> Self {
        info!("master initializing (redundant)");
        Self {
            port: Port::new_redundant(primary_link, secondary_link),
            quirks,
            error_ring: ErrorRing::new(),
            slaves: Vec::new(),
            groups: Vec::new(),
            group_mailboxes: Vec::new(),
            mailbox_pool: MailboxPool::new(),
            eni: NetworkInformation::new(),
            po_so_hook: None,
            eoe_hook: None,
        }
    }

    /// `close` (spec §6): no persisted state to flush (§6 "Persisted state:
    /// none in the master itself"); consumes `self` so the link(s) drop.
    pub fn close(self) {
        info!("master closing");
    }

    pub fn set_eni(&mut self, eni: NetworkInformation) {
        self.eni = eni;
    }

    /// Registers the PO->SO user hook (spec §9); stored by the application
    /// before calling `config_map_group`.
    pub fn set_po_so_hook(&mut self, hook: PreOpToSafeOpHook) {
        self.po_so_hook = Some(hook);
    }

    /// Registers the EoE fragment-interception hook (spec §4.10); seen by
    /// every inbound fragment before it is copied into the caller's buffer.
    pub fn set_eoe_hook(&mut self, hook: eoe::EoeHook) {
        self.eoe_hook = Some(hook);
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn error_ring_mut(&mut self) -> &mut ErrorRing {
        &mut self.error_ring
    }

    /// `config_init` (spec §6, §4.3 "Discovery"): enumerates the bus and
    /// populates the slave list, replaying any ENI init-commands that match
    /// `INIT_TO_PREOP` once each slave reaches PRE_OP.
    pub fn config_init(&mut self, osal: &impl Osal, auto_state_change: bool) -> Result<usize, Error> {
        self.slaves = discovery::config_init(&mut self.port, osal, auto_state_change, &self.quirks)?;
        for slave in self.slaves.iter_mut() {
            replay_init_commands(
                &mut self.port,
                osal,
                slave,
                &self.eni,
                crate::eni::TransitionMask::INIT_TO_PREOP,
                &mut self.error_ring,
            )?;
        }
        Ok(self.slaves.len())
    }

    /// `config_map_group` (spec §6, §4.4 "Mapping engine"): lays one group
    /// of slaves into `group.logical_start_address`'s window and programs
    /// their SyncManagers/FMMUs. `iomap` wraps the application-supplied IO
    /// map buffer this group's logical window aliases into; the mapping
    /// engine reserves the group's output/input region plus a trailing
    /// 1-byte mailbox-status entry per mailbox-enabled slave (spec §3 "IO
    /// map", §4.4). Returns the group's total logical bytes.
    pub fn config_map_group(
        &mut self,
        osal: &impl Osal,
        logical_start_address: u32,
        slave_positions: &[u16],
        iomap: &mut IoMap,
        mode: OverlapMode,
        packed: bool,
    ) -> Result<u32, Error> {
        let mut group = Group::new(logical_start_address);
        for &pos in slave_positions {
            group.slaves.push(pos).map_err(|_| Error::Capacity)?;
        }
        for &pos in slave_positions {
            let slave = find_slave_mut(&mut self.slaves, pos)?;
            replay_init_commands(
                &mut self.port,
                osal,
                slave,
                &self.eni,
                crate::eni::TransitionMask::PREOP_TO_SAFEOP,
                &mut self.error_ring,
            )?;
            if let Some(hook) = self.po_so_hook {
                let slave = find_slave_mut(&mut self.slaves, pos)?;
                hook(slave, pos)?;
            }
        }
        for &pos in slave_positions {
            let slave = find_slave_mut(&mut self.slaves, pos)?;
            mapping::program_sync_managers(&mut self.port, osal, slave.station_address, slave)?;
        }
        mapping::layout_group(&mut self.port, osal, &mut group, iomap, &mut self.slaves, mode, packed)?;
        let total = group.total_logical_bytes();
        self.groups.push(group).map_err(|_| Error::Capacity)?;
        self.group_mailboxes.push(GroupMailbox::default()).map_err(|_| Error::Capacity)?;
        Ok(total)
    }

    /// `configdc` (spec §6, §4.5): measures propagation delay and system-time
    /// offset for every DC-capable slave.
    pub fn configdc(&mut self, osal: &impl Osal, reference_system_time_ns: u64) -> Result<(), Error> {
        crate::dc::measure_and_configure(&mut self.port, osal, &mut self.slaves, reference_system_time_ns)
    }

    /// `dcsync0` (spec §6): activates SYNC0 only.
    pub fn dcsync0(&mut self, osal: &impl Osal, cycle_ns: u32) -> Result<(), Error> {
        crate::dc::activate_sync(&mut self.port, osal, &self.slaves, cycle_ns, None)
    }

    /// `dcsync01` (spec §6): activates SYNC0 and SYNC1.
    pub fn dcsync01(&mut self, osal: &impl Osal, sync0_cycle_ns: u32, sync1_cycle_ns: u32) -> Result<(), Error> {
        crate::dc::activate_sync(&mut self.port, osal, &self.slaves, sync0_cycle_ns, Some(sync1_cycle_ns))
    }

    /// `write_state` (spec §6): writes AL-control to one slave, replaying
    /// any ENI commands whose transition mask matches `transition`.
    pub fn write_state(
        &mut self,
        osal: &impl Osal,
        position: u16,
        state: AlState,
        transition: u16,
        ack: bool,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        replay_init_commands(&mut self.port, osal, slave, &self.eni, transition, &mut self.error_ring)?;
        state::write_state(&mut self.port, osal, slave.station_address, state, ack)?;
        Ok(())
    }

    /// `read_state` (spec §6): the cheap broadcast fast-path (§4.6).
    pub fn read_state(&mut self, osal: &impl Osal) -> Result<(AlState, u16), Error> {
        state::check_state_broadcast(&mut self.port, osal)
    }

    /// `state_check` (spec §6): blocks until every slave reaches `requested`
    /// or `timeout_ns` elapses.
    pub fn state_check(&mut self, osal: &impl Osal, requested: AlState, timeout_ns: u64) -> Result<(), Error> {
        state::wait_for_state(&mut self.port, osal, &mut self.slaves, requested, timeout_ns)
    }

    /// Recover routine (spec §4.6): re-addresses `position` if it lost its
    /// configured station address, verifying identity before restoring it.
    pub fn recover_slave(&mut self, osal: &impl Osal, position: u16) -> Result<bool, Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        discovery::recover_slave(&mut self.port, osal, slave)
    }

    /// Reconfig routine (spec §4.6): repopulates SM0/SM1 (and any
    /// process-data SyncManagers) from the cached record and re-runs the
    /// PRE_OP->SAFE_OP ENI commands, for a slave that was lost and re-found.
    pub fn reconfig_slave(&mut self, osal: &impl Osal, position: u16) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        mapping::program_sync_managers(&mut self.port, osal, slave.station_address, slave)?;
        let slave = find_slave_mut(&mut self.slaves, position)?;
        replay_init_commands(
            &mut self.port,
            osal,
            slave,
            &self.eni,
            crate::eni::TransitionMask::PREOP_TO_SAFEOP,
            &mut self.error_ring,
        )
    }

    /// `send_processdata` (spec §6, §4.12 step 1-3) for one group, identified
    /// by its index in `config_map_group` call order.
    pub fn send_processdata(
        &mut self,
        group_index: usize,
        outputs: &[u8],
        lrw_blocked: bool,
        dc_reference_station_address: Option<u16>,
    ) -> Result<processdata::Inflight, Error> {
        let group = self.groups.get(group_index).ok_or(Error::NotFound)?;
        processdata::send_cycle(&mut self.port, group, outputs, lrw_blocked, dc_reference_station_address)
    }

    /// `receive_processdata` (spec §6, §4.12 "Receive phase").
    pub fn receive_processdata(
        &mut self,
        osal: &impl Osal,
        inflight: processdata::Inflight,
        inputs: &mut [u8],
        timeout_ns: u64,
    ) -> Result<CycleResult, Error> {
        processdata::receive_cycle(&mut self.port, osal, inflight, inputs, timeout_ns)
    }

    /// `mbx_handler` (spec §6, §4.7 "cyclic handler"): one inbound + one
    /// outbound pass for `group_index`, meant to be called once per cycle
    /// from a non-real-time thread (§5 "one or more cooperative threads").
    /// `inputs` is the group's most recently received process-data buffer
    /// (the same one passed to `receive_processdata`); the inbound pass
    /// reads each slave's mailbox-full bit straight out of it rather than
    /// issuing a fresh register read (spec §4.7 "Inbound pass").
    pub fn mbx_handler(&mut self, osal: &impl Osal, group_index: usize, inputs: &[u8]) -> Result<(), Error> {
        let group = self.groups.get_mut(group_index).ok_or(Error::NotFound)?;
        mailbox::inbound_pass(&mut self.port, osal, group, &mut self.slaves, &mut self.error_ring, inputs)?;
        let gm = self.group_mailboxes.get_mut(group_index).ok_or(Error::NotFound)?;
        mailbox::outbound_pass(&mut self.port, osal, group, &mut gm.queue, &mut self.slaves, &mut self.mailbox_pool)
    }

    /// `SDO_read` (spec §6). Dispatches expedited vs segmented per the
    /// spec's "expedited (N<=4)" boundary.
    pub fn sdo_read(
        &mut self,
        osal: &impl Osal,
        position: u16,
        index: u16,
        subindex: u8,
        complete_access: bool,
        timeout_ns: u64,
    ) -> Result<heapless::Vec<u8, 4>, Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        coe::upload_expedited(&mut self.port, osal, slave, index, subindex, complete_access, timeout_ns)
    }

    /// `SDO_write` (spec §6); `data.len() <= 4` uses the expedited path,
    /// longer payloads segment automatically.
    pub fn sdo_write(
        &mut self,
        osal: &impl Osal,
        position: u16,
        index: u16,
        subindex: u8,
        complete_access: bool,
        data: &[u8],
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        if data.len() <= 4 {
            coe::download_expedited(&mut self.port, osal, slave, index, subindex, complete_access, data, timeout_ns)
        } else {
            coe::download_segmented(&mut self.port, osal, slave, index, subindex, complete_access, data, timeout_ns)
        }
    }

    /// `FoE_read` (spec §6, §4.9).
    pub fn foe_read(
        &mut self,
        osal: &impl Osal,
        position: u16,
        filename: &[u8],
        password: Option<&str>,
        out: &mut heapless::Vec<u8, 65536>,
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        foe::read_file(&mut self.port, osal, slave, filename, password, out, timeout_ns)
    }

    /// `FoE_write` (spec §6, §4.9).
    pub fn foe_write(
        &mut self,
        osal: &impl Osal,
        position: u16,
        filename: &[u8],
        password: Option<&str>,
        data: &[u8],
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        foe::write_file(&mut self.port, osal, slave, filename, password, data, timeout_ns)
    }

    /// `EoE_send` (spec §6, §4.10): fragments and mailbox-sends a whole
    /// Ethernet frame.
    pub fn eoe_send(
        &mut self,
        osal: &impl Osal,
        position: u16,
        frame_no: u8,
        frame: &[u8],
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        eoe::send_frame(&mut self.port, osal, slave, frame_no, frame, timeout_ns)
    }

    /// `EoE_read_fragment` (spec §6, §4.10): receives and validates exactly
    /// one fragment; callers assemble the full frame by calling this
    /// repeatedly (`EoE_recv` below does that assembly for the common case).
    pub fn eoe_read_fragment(
        &mut self,
        osal: &impl Osal,
        position: u16,
        expected_fragment: u8,
        out: &mut [u8],
        timeout_ns: u64,
    ) -> Result<(usize, bool), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        eoe::receive_fragment(
            &mut self.port,
            osal,
            slave,
            &mut self.error_ring,
            expected_fragment,
            out,
            self.eoe_hook,
            timeout_ns,
        )
    }

    /// `EoE_recv` (spec §6, §4.10): assembles a complete frame from
    /// fragments into `out`, returning the number of bytes assembled.
    pub fn eoe_recv(&mut self, osal: &impl Osal, position: u16, out: &mut [u8], timeout_ns: u64) -> Result<usize, Error> {
        let mut total = 0usize;
        let mut fragment_no = 0u8;
        loop {
            let (n, last) = self.eoe_read_fragment(osal, position, fragment_no, &mut out[total..], timeout_ns)?;
            total += n;
            if last {
                return Ok(total);
            }
            fragment_no = fragment_no.wrapping_add(1);
        }
    }

    /// `EoE_set_ip` (spec §6, §4.10).
    pub fn eoe_set_ip(&mut self, osal: &impl Osal, position: u16, params: &eoe::IpParams, timeout_ns: u64) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        eoe::set_ip(&mut self.port, osal, slave, params, timeout_ns)
    }

    /// `EoE_get_ip` (spec §6): issues the same exchange with the Get-IP
    /// frame type, reusing `set_ip`'s wire helper with an empty request body
    /// since the slave's reply carries the current parameters.
    pub fn eoe_get_ip(&mut self, osal: &impl Osal, position: u16, timeout_ns: u64) -> Result<eoe::IpParams, Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        eoe::get_ip(&mut self.port, osal, slave, timeout_ns)
    }

    /// `SoE_read` (spec §6, §4.11).
    pub fn soe_read(
        &mut self,
        osal: &impl Osal,
        position: u16,
        addr: soe::IdnAddress,
        elements: soe::ElementFlags,
        out: &mut heapless::Vec<u8, { soe::MAX_SOE_DATA }>,
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        soe::read_idn(&mut self.port, osal, slave, addr, elements, out, timeout_ns)
    }

    /// `SoE_write` (spec §6, §4.11).
    pub fn soe_write(
        &mut self,
        osal: &impl Osal,
        position: u16,
        addr: soe::IdnAddress,
        elements: soe::ElementFlags,
        data: &[u8],
        timeout_ns: u64,
    ) -> Result<(), Error> {
        let slave = find_slave_mut(&mut self.slaves, position)?;
        soe::write_idn(&mut self.port, osal, slave, addr, elements, data, timeout_ns)
    }

    /// EEPROM read (spec §6 "EEPROM read/write (by auto-inc or fixed
    /// address)"), word-addressed.
    pub fn eeprom_read(&mut self, osal: &impl Osal, station_address: u16, word_address: u16) -> Result<([u8; 8], bool), Error> {
        crate::sii::eeprom_read(&mut self.port, osal, station_address, word_address)
    }

    /// EEPROM write (spec §6), word-addressed.
    pub fn eeprom_write(&mut self, osal: &impl Osal, station_address: u16, word_address: u16, word: u16) -> Result<(), Error> {
        crate::sii::eeprom_write(&mut self.port, osal, station_address, word_address, word)
    }
}

/// Looks up a slave by its auto-increment position within `slaves` alone, so
/// the borrow it returns doesn't extend to the rest of `Context` (a `&mut
/// self` method here would borrow the whole struct for as long as the result
/// lives, conflicting with the `&mut self.port` every caller also needs).
fn find_slave_mut(slaves: &mut [Slave], position: u16) -> Result<&mut Slave, Error> {
    slaves.iter_mut().find(|s| s.auto_increment_position == position).ok_or(Error::NotFound)
}

/// Replays an ENI slave's write commands for `transition` in declared order
/// (spec §6 "the mapping engine replays write commands that match each
/// transition"), surfacing any abort on the error ring rather than aborting
/// the whole batch.
fn replay_init_commands<L: RawEthernetPort>(
    port: &mut Port<L>,
    osal: &impl Osal,
    slave: &mut Slave,
    eni: &NetworkInformation,
    transition: u16,
    error_ring: &mut ErrorRing,
) -> Result<(), Error> {
    let position = slave.auto_increment_position;
    let commands: heapless::Vec<_, { crate::eni::MAX_INIT_COMMANDS_PER_SLAVE }> =
        eni.write_commands_for_transition(position, transition).cloned().collect();
    for cmd in commands {
        debug_assert_eq!(cmd.specifier, ClientCommandSpecifier::Write);
        let data = &cmd.data[..cmd.size as usize];
        let result = if data.len() <= 4 {
            coe::download_expedited(port, osal, slave, cmd.index, cmd.subindex, cmd.complete_access, data, cmd.timeout_ns)
        } else {
            coe::download_segmented(port, osal, slave, cmd.index, cmd.subindex, cmd.complete_access, data, cmd.timeout_ns)
        };
        if let Err(Error::MailboxAbort(code)) = result {
            error_ring.push(crate::error::ErrorRecord {
                timestamp_ns: osal.now_ns(),
                slave: position,
                index: cmd.index,
                subindex: cmd.subindex,
                kind: crate::error::ErrorKind::Sdo,
                code: abort_code_value(code),
            });
        } else {
            result?;
        }
    }
    Ok(())
}

fn abort_code_value(code: AbortCode) -> u32 {
    match code {
        AbortCode::Other(v) => v,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::loopback::LoopbackPort;

    struct FakeClock;
    impl Osal for FakeClock {
        fn now_ns(&self) -> u64 {
            0
        }
        fn usleep(&self, _micros: u32) {}
    }

    #[test]
    fn initialize_starts_with_no_slaves_or_groups() {
        let ctx = Context::initialize(LoopbackPort::new(), Quirks::default());
        assert!(ctx.slaves().is_empty());
        assert!(ctx.groups().is_empty());
    }

    #[test]
    fn config_map_group_rejects_unknown_slave_position() {
        let mut ctx = Context::initialize(LoopbackPort::new(), Quirks::default());
        let mut backing = [0u8; 64];
        let mut iomap = IoMap::new(&mut backing, OverlapMode::NonOverlap);
        let err = ctx
            .config_map_group(&FakeClock, 0x0001_0000, &[1], &mut iomap, OverlapMode::NonOverlap, false)
            .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }
}
