//! ESC register views (spec §4 throughout). Each register is a thin
//! bitfield wrapper over a byte slice, the teacher's idiom for memory-mapped
//! device registers.

use bitfield::bitfield;

pub const REG_AL_CONTROL: u16 = 0x0120;
pub const REG_AL_STATUS: u16 = 0x0130;
pub const REG_AL_STATUS_CODE: u16 = 0x0134;
pub const REG_DL_STATUS: u16 = 0x0110;
pub const REG_RX_ERROR_COUNTERS: u16 = 0x0300;
pub const REG_FIXED_STATION_ADDRESS: u16 = 0x0010;
pub const REG_SII_ACCESS: u16 = 0x0500;
pub const REG_SII_CONTROL: u16 = 0x0502;
pub const REG_SII_ADDRESS: u16 = 0x0504;
pub const REG_SII_DATA: u16 = 0x0508;
pub const REG_FMMU0: u16 = 0x0600;
pub const FMMU_SIZE: u16 = 0x10;
pub const REG_SM0: u16 = 0x0800;
pub const SM_SIZE: u16 = 0x08;
pub const REG_DC_RECV_TIME_PORT0: u16 = 0x0900;
pub const REG_DC_SYSTEM_TIME: u16 = 0x0910;
pub const REG_DC_SYSTEM_TIME_OFFSET: u16 = 0x0920;
pub const REG_DC_SYSTEM_TIME_DELAY: u16 = 0x0928;
pub const REG_DC_CYCLIC_CONTROL: u16 = 0x0980;
pub const REG_DC_SYNC0_CYCLE: u16 = 0x09A0;
pub const REG_DC_SYNC1_CYCLE: u16 = 0x09A4;

bitfield! {
    #[derive(Clone)]
    pub struct AlControl([u8]);
    u8;
    pub state, set_state: 3, 0;
    pub ack, set_ack: 4;
}

bitfield! {
    #[derive(Clone)]
    pub struct AlStatus([u8]);
    u8;
    pub state, _: 3, 0;
    pub error, _: 4;
}

bitfield! {
    #[derive(Clone)]
    pub struct DlStatus([u8]);
    u16;
    pub pdi_operational, _: 0, 0;
    pub link_port0, _: 4, 4;
    pub link_port1, _: 5, 5;
    pub link_port2, _: 6, 6;
    pub link_port3, _: 7, 7;
    pub loop_port0, _: 8, 8;
    pub signal_port0, _: 9, 9;
    pub loop_port1, _: 10, 10;
    pub signal_port1, _: 11, 11;
    pub loop_port2, _: 12, 12;
    pub signal_port2, _: 13, 13;
    pub loop_port3, _: 14, 14;
    pub signal_port3, _: 15, 15;
}

impl<T: AsRef<[u8]>> DlStatus<T> {
    /// Port `k`'s communication-established field sits at bits
    /// `[8+2k+1:8+2k]` — `loop_portN`/`signal_portN` above, bits 8-15 — and
    /// reads `0b10` iff the port is active (spec §4.3 step 5).
    pub fn port_active(&self, port: u8) -> bool {
        let raw = u16::from_le_bytes([self.0.as_ref()[0], self.0.as_ref()[1]]);
        let bits = (raw >> (8 + 2 * port)) & 0b11;
        bits == 0b10
    }
}

bitfield! {
    #[derive(Clone)]
    pub struct SiiAccess([u8]);
    u8;
    pub owner, set_owner: 0, 0;
    pub reset_access, set_reset_access: 1, 1;
}

impl<T: AsRef<[u8]>> SiiAccess<T> {
    pub fn pdi_accessed(&self) -> bool {
        self.0.as_ref()[1] & 0x01 != 0
    }
}

bitfield! {
    #[derive(Clone)]
    pub struct SiiControl([u8]);
    u8;
    pub write_access, set_write_access: 0, 0;
    pub read_size, _: 6, 6;
    pub address_algorithm, _: 7, 7;
    pub read_operation, set_read_operation: 8, 8;
    pub write_operation, set_write_operation: 9, 9;
    pub reload_operation, set_reload_operation: 10, 10;
    pub checksum_error, _: 11, 11;
    pub device_info_error, _: 12, 12;
    pub command_error, _: 13, 13;
    pub busy, _: 15, 15;
}

bitfield! {
    #[derive(Clone)]
    pub struct SyncManager([u8]);
    u16;
    pub physical_start, set_physical_start: 15, 0;
    pub length, set_length: 31, 16;
    u8;
    pub control, set_control: 39, 32;
    pub status, _: 47, 40;
    pub activate, set_activate: 55, 48;
    pub pdi_control, _: 63, 56;
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> SyncManager<T> {
    /// Buffer type: 00 = unused, 01 = mailbox, 10 = buffered, 11 = buffered w/ 3 buffers.
    pub fn buffer_type(&self) -> u8 {
        self.control() & 0b11
    }

    pub fn set_buffer_type(&mut self, value: u8) {
        let control = (self.control() & !0b11) | (value & 0b11);
        self.set_control(control);
    }

    /// 0 = read (master writes, slave reads = outputs), 1 = write
    /// (slave writes, master reads = inputs) from the SM's own control bits.
    pub fn direction(&self) -> u8 {
        (self.control() >> 2) & 0b11
    }
}

bitfield! {
    #[derive(Clone)]
    pub struct Fmmu([u8]);
    u32;
    pub logical_start, set_logical_start: 31, 0;
    u16;
    pub length, set_length: 47, 32;
    u8;
    pub logical_start_bit, set_logical_start_bit: 50, 48;
    pub logical_end_bit, set_logical_end_bit: 58, 56;
    u16;
    pub physical_start, set_physical_start: 74, 64;
    u8;
    pub physical_start_bit, set_physical_start_bit: 77, 72;
    pub read_enable, set_read_enable: 88, 88;
    pub write_enable, set_write_enable: 89, 89;
    pub enable, set_enable: 96, 96;
}

pub const FMMU_REG_SIZE: usize = 16;
pub const SM_REG_SIZE: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dl_status_port_active_bits() {
        // port 0 active (0b10), port 1 inactive (0b00)
        let raw: u16 = 0b10 << 4;
        let buf = raw.to_le_bytes();
        let status = DlStatus(&buf[..]);
        assert!(status.port_active(0));
        assert!(!status.port_active(1));
    }

    #[test]
    fn sync_manager_buffer_type_roundtrip() {
        let mut buf = [0u8; SM_REG_SIZE];
        let mut sm = SyncManager(&mut buf[..]);
        sm.set_physical_start(0x1000);
        sm.set_length(256);
        sm.set_buffer_type(0b10);
        sm.set_activate(1);
        let sm = SyncManager(&buf[..]);
        assert_eq!(sm.physical_start(), 0x1000);
        assert_eq!(sm.length(), 256);
        assert_eq!(sm.buffer_type(), 0b10);
    }
}
