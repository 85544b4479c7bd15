//! The slave record (spec §3 "Slave record") and the AL state enum shared
//! across the state driver, the error ring, and the mailbox subsystem.

use heapless::{String, Vec};

/// `station address = auto-increment position + 0x1000` (spec §3, §4.3 step 3).
pub const STATION_ADDRESS_OFFSET: u16 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlState {
    #[default]
    None,
    Init,
    PreOp,
    Boot,
    SafeOp,
    Op,
    /// Any of the above OR'd with the ERROR bit (0x10), carrying the base
    /// state the slave last reported alongside the error flag.
    Error(AlBaseState),
}

/// The five "clean" AL states, used where an error flag must compose with a
/// base state rather than replace it (spec §3 "optionally OR'd with ERROR").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlBaseState {
    Init,
    PreOp,
    Boot,
    SafeOp,
    Op,
}

impl AlState {
    pub const INIT_CODE: u8 = 0x01;
    pub const PRE_OP_CODE: u8 = 0x02;
    pub const BOOT_CODE: u8 = 0x03;
    pub const SAFE_OP_CODE: u8 = 0x04;
    pub const OP_CODE: u8 = 0x08;
    pub const ERROR_BIT: u8 = 0x10;
    pub const ACK_BIT: u8 = 0x10;

    /// Decodes an `AL_STATUS`/`AL_CONTROL` byte (spec §3).
    pub fn from_code(code: u8) -> Self {
        let base = code & !(Self::ERROR_BIT);
        let errored = code & Self::ERROR_BIT != 0;
        let base_state = match base {
            Self::INIT_CODE => Some(AlBaseState::Init),
            Self::PRE_OP_CODE => Some(AlBaseState::PreOp),
            Self::BOOT_CODE => Some(AlBaseState::Boot),
            Self::SAFE_OP_CODE => Some(AlBaseState::SafeOp),
            Self::OP_CODE => Some(AlBaseState::Op),
            _ => None,
        };
        match (base_state, errored) {
            (Some(b), true) => AlState::Error(b),
            (Some(AlBaseState::Init), false) => AlState::Init,
            (Some(AlBaseState::PreOp), false) => AlState::PreOp,
            (Some(AlBaseState::Boot), false) => AlState::Boot,
            (Some(AlBaseState::SafeOp), false) => AlState::SafeOp,
            (Some(AlBaseState::Op), false) => AlState::Op,
            (None, _) => AlState::None,
        }
    }

    /// Encodes the requested-state byte written to `AL_CONTROL`. `ack`
    /// sets the acknowledge bit used when clearing a latched error.
    pub fn to_code(self, ack: bool) -> u8 {
        let base = match self {
            AlState::Init | AlState::Error(AlBaseState::Init) => Self::INIT_CODE,
            AlState::PreOp | AlState::Error(AlBaseState::PreOp) => Self::PRE_OP_CODE,
            AlState::Boot | AlState::Error(AlBaseState::Boot) => Self::BOOT_CODE,
            AlState::SafeOp | AlState::Error(AlBaseState::SafeOp) => Self::SAFE_OP_CODE,
            AlState::Op | AlState::Error(AlBaseState::Op) => Self::OP_CODE,
            AlState::None => 0,
        };
        if ack {
            base | Self::ACK_BIT
        } else {
            base
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, AlState::Error(_))
    }
}

/// Supported mailbox protocols bitset (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxProtocols(pub u16);

impl MailboxProtocols {
    pub const AOE: u16 = 1 << 0;
    pub const EOE: u16 = 1 << 1;
    pub const COE: u16 = 1 << 2;
    pub const FOE: u16 = 1 << 3;
    pub const SOE: u16 = 1 << 4;
    pub const VOE: u16 = 1 << 5;

    pub fn supports(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }
}

/// CoE-specific detail flags read from SII general category / `0x1008..0x100B` (spec §3, §4.8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoeDetails {
    pub sdo: bool,
    pub sdo_info: bool,
    pub pdo_assign: bool,
    pub pdo_config: bool,
    pub upload: bool,
    pub complete_access: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub protocols: MailboxProtocols,
    pub coe: CoeDetails,
    pub supports_dc: bool,
    /// Slave's SII control reports an 8-byte (vs 4-byte) EEPROM read.
    pub eeprom_8byte_read: bool,
}

/// A SyncManager's role, decoded from its control byte (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncManagerType {
    Unused,
    MbxWrite,
    MbxRead,
    Outputs,
    Inputs,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncManagerConfig {
    pub start_address: u16,
    pub length: u16,
    pub control: u8,
    pub ty: SyncManagerType,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FmmuConfig {
    pub logical_start: u32,
    pub length: u16,
    pub logical_start_bit: u8,
    pub logical_end_bit: u8,
    pub physical_start: u16,
    pub physical_start_bit: u8,
    pub is_read: bool,
    pub is_write: bool,
    pub active: bool,
}

/// Per-protocol inbox slot in the mailbox handler (spec §3 "protocol inbox
/// slots: buffer pointer, full flag, overrun counter").
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolInbox {
    pub full: bool,
    pub overrun_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxHandlerState {
    #[default]
    None,
    Cyclic,
    Lost,
}

/// Mailbox-handler fields (spec §3 "mailbox handler").
#[derive(Debug, Default)]
pub struct MailboxState {
    pub handler_state: MailboxHandlerState,
    /// Robust-mailbox recovery sub-state 0..3 (spec §4.7).
    pub robust_substate: u8,
    pub coe_inbox: ProtocolInbox,
    pub foe_inbox: ProtocolInbox,
    pub eoe_inbox: ProtocolInbox,
    pub soe_inbox: ProtocolInbox,
    /// Rolling 3-bit mailbox counter; rolls 1..7, never 0 (spec §3 invariant).
    pub counter: u8,
    pub islost: bool,
}

impl MailboxState {
    pub fn next_counter(&mut self) -> u8 {
        self.counter = if self.counter >= 7 { 1 } else { self.counter + 1 };
        self.counter
    }
}

/// Topology fields (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct Topology {
    pub active_ports: u8,
    pub port_count: u8,
    pub parent_slave: Option<u16>,
    pub parent_port: u8,
    pub dc_propagation_delay_ns: u32,
    pub previous_dc_slave: Option<u16>,
    pub next_dc_slave: Option<u16>,
}

/// Process-data window into the shared IO map (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessDataWindow {
    pub input_bits: u32,
    pub output_bits: u32,
    pub input_byte_offset: u32,
    pub input_start_bit: u8,
    pub output_byte_offset: u32,
    pub output_start_bit: u8,
}

pub const MAX_SYNC_MANAGERS: usize = 8;
pub const MAX_FMMUS: usize = 4;

/// One detected device (spec §3 "Slave record").
#[derive(Debug)]
pub struct Slave {
    pub auto_increment_position: u16,
    pub station_address: u16,
    pub alias: Option<u16>,

    pub vendor_id: u32,
    pub product_code: u32,
    pub revision_number: u32,
    pub serial_number: u32,
    pub name: String<64>,

    pub capabilities: Capabilities,

    pub al_state: AlState,
    pub al_status_code: u16,

    pub topology: Topology,

    pub sync_managers: Vec<SyncManagerConfig, MAX_SYNC_MANAGERS>,
    pub fmmus: Vec<FmmuConfig, MAX_FMMUS>,

    pub mailbox_out_address: u16,
    pub mailbox_out_length: u16,
    pub mailbox_in_address: u16,
    pub mailbox_in_length: u16,

    pub process_data: ProcessDataWindow,

    pub mailbox: MailboxState,
}

impl Slave {
    pub fn new(auto_increment_position: u16) -> Self {
        Self {
            auto_increment_position,
            station_address: auto_increment_position.wrapping_add(STATION_ADDRESS_OFFSET),
            alias: None,
            vendor_id: 0,
            product_code: 0,
            revision_number: 0,
            serial_number: 0,
            name: String::new(),
            capabilities: Capabilities::default(),
            al_state: AlState::None,
            al_status_code: 0,
            topology: Topology::default(),
            sync_managers: Vec::new(),
            fmmus: Vec::new(),
            mailbox_out_address: 0,
            mailbox_out_length: 0,
            mailbox_in_address: 0,
            mailbox_in_length: 0,
            process_data: ProcessDataWindow::default(),
            mailbox: MailboxState::default(),
        }
    }

    pub fn has_mailbox(&self) -> bool {
        self.mailbox_out_length > 0 && self.mailbox_in_length > 0
    }

    /// SyncManager 0/1 are always mailbox-write/mailbox-read when present
    /// (spec §3 invariant); returns their configured lengths.
    pub fn mailbox_sync_managers(&self) -> (Option<&SyncManagerConfig>, Option<&SyncManagerConfig>) {
        (
            self.sync_managers.iter().find(|sm| sm.ty == SyncManagerType::MbxWrite),
            self.sync_managers.iter().find(|sm| sm.ty == SyncManagerType::MbxRead),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn al_state_round_trips_through_code() {
        assert_eq!(AlState::from_code(0x02), AlState::PreOp);
        assert_eq!(AlState::from_code(0x08), AlState::Op);
        assert!(AlState::from_code(0x12).is_error());
        assert_eq!(AlState::PreOp.to_code(false), 0x02);
        assert_eq!(AlState::Op.to_code(true), 0x18);
    }

    #[test]
    fn station_address_is_position_plus_offset() {
        let slave = Slave::new(0xFFFE); // position -2 in two's complement wraparound space
        assert_eq!(slave.station_address, 0xFFFE_u16.wrapping_add(0x1000));
    }

    #[test]
    fn mailbox_counter_rolls_1_through_7_never_0() {
        let mut mbx = MailboxState::default();
        let mut seen = Vec::<u8, 8>::new();
        for _ in 0..10 {
            let c = mbx.next_counter();
            assert_ne!(c, 0);
            assert!(c <= 7);
            let _ = seen.push(c);
        }
    }
}
