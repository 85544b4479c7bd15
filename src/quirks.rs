//! Opt-in behavioral workarounds for slave firmware bugs (spec §9 Open
//! Question "SM2 workaround"). Every flag here defaults to off and is
//! logged when it fires — never silently applied.

use log::warn;

/// Per-master workaround toggles. Constructed once by the application and
/// threaded through discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quirks {
    /// Some slaves misreport SyncManager 2's type in its SII control byte
    /// (reads back as type 2/`MbxRead` instead of `Outputs`). When set, SM
    /// index 2 is forced to `Outputs` regardless of what the control byte
    /// decodes to (spec §9: "the source applies `SMt_bug_add = 1`... this
    /// should be explicit policy, guarded and logged").
    pub sm2_type_workaround: bool,
}

impl Quirks {
    /// Applies `sm2_type_workaround` to a decoded SyncManager type if
    /// `sm_index == 2` and the flag is set, logging the override.
    pub fn apply_sm_type(&self, sm_index: usize, decoded: crate::slave::SyncManagerType) -> crate::slave::SyncManagerType {
        use crate::slave::SyncManagerType;
        if self.sm2_type_workaround && sm_index == 2 && decoded != SyncManagerType::Outputs {
            warn!("SM2 type workaround applied: decoded {decoded:?}, forcing Outputs");
            SyncManagerType::Outputs
        } else {
            decoded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::SyncManagerType;

    #[test]
    fn workaround_off_by_default_leaves_type_unchanged() {
        let quirks = Quirks::default();
        assert_eq!(quirks.apply_sm_type(2, SyncManagerType::MbxRead), SyncManagerType::MbxRead);
    }

    #[test]
    fn workaround_forces_sm2_to_outputs_when_enabled() {
        let quirks = Quirks { sm2_type_workaround: true };
        assert_eq!(quirks.apply_sm_type(2, SyncManagerType::MbxRead), SyncManagerType::Outputs);
        assert_eq!(quirks.apply_sm_type(3, SyncManagerType::Inputs), SyncManagerType::Inputs);
    }
}
