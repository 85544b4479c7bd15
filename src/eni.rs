//! ENI — the application-supplied network-information structure (spec §6
//! "ENI"): known slaves and the per-slave CoE init-commands the mapping
//! engine replays on each AL state transition.

use heapless::Vec;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mailbox::coe::ClientCommandSpecifier;

pub const MAX_ENI_SLAVES: usize = 200;
pub const MAX_INIT_COMMANDS_PER_SLAVE: usize = 32;
pub const MAX_INIT_COMMAND_BYTES: usize = 64;

/// Transition bitmask a CoE init-command fires on (spec §6: "transition
/// bitmask"). Bits follow the teacher's AL-state ordinal, so e.g.
/// `PREOP_TO_SAFEOP` fires when the slave moves PRE_OP -> SAFE_OP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransitionMask(pub u16);

impl TransitionMask {
    pub const INIT_TO_PREOP: u16 = 1 << 0;
    pub const PREOP_TO_SAFEOP: u16 = 1 << 1;
    pub const SAFEOP_TO_OP: u16 = 1 << 2;
    pub const SAFEOP_TO_PREOP: u16 = 1 << 3;
    pub const PREOP_TO_INIT: u16 = 1 << 4;
    pub const OP_TO_SAFEOP: u16 = 1 << 5;

    pub fn includes(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

/// One CoE init-command (spec §6: "{transition bitmask, complete-access,
/// client-command-specifier, index, subindex, timeout, size, data pointer}").
/// `data` is inline rather than a pointer since the core is `no_std`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InitCommand {
    pub transitions: TransitionMask,
    pub complete_access: bool,
    pub specifier: ClientCommandSpecifier,
    pub index: u16,
    pub subindex: u8,
    pub timeout_ns: u64,
    pub size: u16,
    pub data: Vec<u8, MAX_INIT_COMMAND_BYTES>,
}

/// One slave's identity and its init-command list (spec §6: "known slaves
/// by {position, vendor, product, revision}").
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SlaveEni {
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub init_commands: Vec<InitCommand, MAX_INIT_COMMANDS_PER_SLAVE>,
}

impl SlaveEni {
    pub fn new(position: u16, vendor_id: u32, product_code: u32, revision_number: u32) -> Self {
        Self {
            position,
            vendor_id,
            product_code,
            revision_number,
            init_commands: Vec::new(),
        }
    }
}

/// The full static network description (spec §6 "ENI (application->master)").
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkInformation {
    pub slaves: Vec<SlaveEni, MAX_ENI_SLAVES>,
}

impl NetworkInformation {
    pub fn new() -> Self {
        Self { slaves: Vec::new() }
    }

    pub fn slave(&self, position: u16) -> Option<&SlaveEni> {
        self.slaves.iter().find(|s| s.position == position)
    }

    /// Write commands whose transition mask includes `transition`, in
    /// declared order (spec §6: "replays write commands that match each
    /// transition"). Read commands are available for validation only and
    /// are not replayed automatically.
    pub fn write_commands_for_transition(
        &self,
        position: u16,
        transition: u16,
    ) -> impl Iterator<Item = &InitCommand> {
        self.slave(position)
            .into_iter()
            .flat_map(move |s| s.init_commands.iter())
            .filter(move |c| c.transitions.includes(transition) && c.specifier == ClientCommandSpecifier::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commands_filters_by_transition_and_direction() {
        let mut eni = NetworkInformation::new();
        let mut slave = SlaveEni::new(1, 0x1, 0x2, 0x3);
        let _ = slave.init_commands.push(InitCommand {
            transitions: TransitionMask(TransitionMask::PREOP_TO_SAFEOP),
            complete_access: false,
            specifier: ClientCommandSpecifier::Write,
            index: 0x6060,
            subindex: 0,
            timeout_ns: 100_000_000,
            size: 1,
            data: Vec::from_slice(&[0u8]).unwrap(),
        });
        let _ = slave.init_commands.push(InitCommand {
            transitions: TransitionMask(TransitionMask::INIT_TO_PREOP),
            complete_access: false,
            specifier: ClientCommandSpecifier::Write,
            index: 0x1000,
            subindex: 0,
            timeout_ns: 100_000_000,
            size: 1,
            data: Vec::from_slice(&[0u8]).unwrap(),
        });
        let _ = eni.slaves.push(slave);

        let matched: Vec<_, 4> = eni
            .write_commands_for_transition(1, TransitionMask::PREOP_TO_SAFEOP)
            .collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].index, 0x6060);
    }
}
