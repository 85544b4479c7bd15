//! Group: a partition of slaves sharing one logical address window
//! (spec §3 "Group").

use heapless::{Deque, Vec};

pub const MAX_SEGMENTS: usize = 16;
pub const MAX_SLAVES_PER_GROUP: usize = 64;
pub const MBX_FIFO_DEPTH: usize = 32;

/// One LRW-sized chunk of a group's logical window, never crossing a
/// SyncManager boundary (spec §3 invariant).
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub logical_address: u32,
    pub length: u16,
}

/// Per-slave mailbox-status lookup entry (spec §3 "mailbox-status byte
/// array with per-slave lookup table").
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxStatusEntry {
    pub slave_index: u16,
    pub byte_offset: u16,
}

/// A pending outbound mailbox send queued against this group (spec §3
/// "outgoing mailbox FIFO").
#[derive(Debug, Clone, Copy)]
pub struct QueuedSend {
    pub slave_index: u16,
    pub buffer_slot: u8,
    pub length: u16,
}

#[derive(Debug)]
pub struct Group {
    pub logical_start_address: u32,
    pub output_bytes: u32,
    pub input_bytes: u32,
    pub segments: Vec<Segment, MAX_SEGMENTS>,
    pub expected_output_wkc: u16,
    pub expected_input_wkc: u16,
    pub slaves: Vec<u16, MAX_SLAVES_PER_GROUP>,
    pub mailbox_status: Vec<MailboxStatusEntry, MAX_SLAVES_PER_GROUP>,
    /// Round-robin cursor into `slaves` for the cyclic mailbox handler
    /// (spec §4.7 "cyclic handler").
    pub mailbox_cursor: usize,
    pub outgoing_mailbox: Deque<QueuedSend, MBX_FIFO_DEPTH>,
    pub dc_next_slave: Option<u16>,
}

impl Group {
    pub fn new(logical_start_address: u32) -> Self {
        Self {
            logical_start_address,
            output_bytes: 0,
            input_bytes: 0,
            segments: Vec::new(),
            expected_output_wkc: 0,
            expected_input_wkc: 0,
            slaves: Vec::new(),
            mailbox_status: Vec::new(),
            mailbox_cursor: 0,
            outgoing_mailbox: Deque::new(),
            dc_next_slave: None,
        }
    }

    /// Advances the round-robin cursor and returns the next slave to poll
    /// for its mailbox handler turn, wrapping at the end of the list
    /// (spec §4.7 "cyclic handler").
    pub fn next_mailbox_slave(&mut self) -> Option<u16> {
        if self.slaves.is_empty() {
            return None;
        }
        let slave = self.slaves[self.mailbox_cursor % self.slaves.len()];
        self.mailbox_cursor = (self.mailbox_cursor + 1) % self.slaves.len();
        Some(slave)
    }

    pub fn total_logical_bytes(&self) -> u32 {
        self.output_bytes + self.input_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_cursor_wraps_round_robin() {
        let mut g = Group::new(0);
        g.slaves.push(1).unwrap();
        g.slaves.push(2).unwrap();
        g.slaves.push(3).unwrap();
        assert_eq!(g.next_mailbox_slave(), Some(1));
        assert_eq!(g.next_mailbox_slave(), Some(2));
        assert_eq!(g.next_mailbox_slave(), Some(3));
        assert_eq!(g.next_mailbox_slave(), Some(1));
    }
}
