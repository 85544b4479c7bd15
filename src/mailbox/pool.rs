//! Mailbox buffer pool (spec §3 "Mailbox pool", §4.7 "Pool"). `N` zeroed
//! buffers, handed out and returned by index.
//!
//! The spec describes pool access as mutex-guarded; this core's `Context`
//! (and every module it owns) is accessed through `&mut self` with no
//! interior sharing, so mutual exclusion falls out of ordinary borrowing —
//! there is no separate lock to take.

use heapless::Vec;

use crate::error::Error;

pub const MAILBOX_POOL_DEPTH: usize = 16;
/// `EC_MAXMBX` (SPEC_FULL §1): one frame's worth of mailbox data.
pub const MAILBOX_BUFFER_BYTES: usize = 1486;

pub type MailboxBuffer = [u8; MAILBOX_BUFFER_BYTES];

/// Fixed-capacity free list of mailbox buffers (spec §4.7 "get/drop").
pub struct MailboxPool {
    buffers: [MailboxBuffer; MAILBOX_POOL_DEPTH],
    lengths: [usize; MAILBOX_POOL_DEPTH],
    free: Vec<u8, MAILBOX_POOL_DEPTH>,
}

impl Default for MailboxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxPool {
    pub fn new() -> Self {
        let mut free = Vec::new();
        for i in 0..MAILBOX_POOL_DEPTH as u8 {
            let _ = free.push(i);
        }
        Self {
            buffers: [[0u8; MAILBOX_BUFFER_BYTES]; MAILBOX_POOL_DEPTH],
            lengths: [0; MAILBOX_POOL_DEPTH],
            free,
        }
    }

    /// Returns a zeroed buffer's slot id, or `Error::Capacity` if the pool
    /// is exhausted (spec §4.7 "get returns a zeroed buffer or none").
    pub fn get(&mut self) -> Result<u8, Error> {
        let slot = self.free.pop().ok_or(Error::Capacity)?;
        self.buffers[slot as usize] = [0u8; MAILBOX_BUFFER_BYTES];
        self.lengths[slot as usize] = 0;
        Ok(slot)
    }

    /// Returns the buffer to the free list (spec §4.7 "drop returns the
    /// buffer to the empty list").
    pub fn drop_buffer(&mut self, slot: u8) {
        if !self.free.iter().any(|&s| s == slot) {
            let _ = self.free.push(slot);
        }
    }

    pub fn buffer(&self, slot: u8) -> &[u8] {
        &self.buffers[slot as usize][..self.lengths[slot as usize]]
    }

    pub fn buffer_mut(&mut self, slot: u8) -> &mut MailboxBuffer {
        &mut self.buffers[slot as usize]
    }

    pub fn set_length(&mut self, slot: u8, length: usize) {
        self.lengths[slot as usize] = length;
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_exhausts_then_drop_replenishes() {
        let mut pool = MailboxPool::new();
        let mut taken = Vec::<u8, MAILBOX_POOL_DEPTH>::new();
        for _ in 0..MAILBOX_POOL_DEPTH {
            taken.push(pool.get().unwrap()).unwrap();
        }
        assert_eq!(pool.get(), Err(Error::Capacity));
        pool.drop_buffer(taken[0]);
        assert!(pool.get().is_ok());
    }
}
