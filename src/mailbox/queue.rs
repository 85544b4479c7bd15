//! Per-group mailbox send queue (spec §3 "Queue", §4.7 "Queue"). `add`
//! appends a ticket and returns its id; `done_poll`/`expire` manage the
//! ticket's lifetime; the outbound cyclic pass rotates the queue so heads
//! and tails stay contiguous.

use heapless::Deque;

use crate::group::MBX_FIFO_DEPTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    Requested,
    Done,
    Failed,
    /// Marked by `done_poll` (once `Done`) or `expire`; dropped on the next
    /// rotation instead of being resent.
    Removed,
}

#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    pub id: u32,
    pub slave_index: u16,
    pub buffer_slot: u8,
    pub length: u16,
    pub state: TicketState,
}

/// A group's outbound mailbox FIFO (spec §3 "outgoing mailbox FIFO").
pub struct MailboxQueue {
    tickets: Deque<Ticket, MBX_FIFO_DEPTH>,
    next_id: u32,
}

impl Default for MailboxQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxQueue {
    pub const fn new() -> Self {
        Self { tickets: Deque::new(), next_id: 1 }
    }

    /// Appends a ticket, returning its opaque id (spec §4.7 "add appends a
    /// ticket -> caller gets an opaque ticket id"). `None` if the queue is
    /// full.
    pub fn add(&mut self, slave_index: u16, buffer_slot: u8, length: u16) -> Option<u32> {
        let id = self.next_id;
        self.tickets
            .push_back(Ticket { id, slave_index, buffer_slot, length, state: TicketState::Requested })
            .ok()?;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        Some(id)
    }

    /// Reports whether `ticket` reached `Done`; if so marks it for removal
    /// (spec §4.7 "done-poll(ticket) reports whether the ticket reached
    /// done and, if yes, marks for removal").
    pub fn done_poll(&mut self, ticket: u32) -> Option<bool> {
        for t in self.tickets.iter_mut() {
            if t.id == ticket {
                return match t.state {
                    TicketState::Done => {
                        t.state = TicketState::Removed;
                        Some(true)
                    }
                    TicketState::Removed => Some(true),
                    _ => Some(false),
                };
            }
        }
        None
    }

    /// Marks a still-pending ticket for removal without waiting for it to
    /// complete (spec §4.7 "expire(ticket) marks a still-pending ticket for
    /// removal without waiting").
    pub fn expire(&mut self, ticket: u32) {
        for t in self.tickets.iter_mut() {
            if t.id == ticket {
                t.state = TicketState::Removed;
                return;
            }
        }
    }

    pub fn set_state(&mut self, ticket: u32, state: TicketState) {
        for t in self.tickets.iter_mut() {
            if t.id == ticket {
                t.state = state;
                return;
            }
        }
    }

    /// Rotates one ticket from the tail to the head, dropping it instead if
    /// it is marked `Removed` (spec §4.7 "the queue is rotated each
    /// iteration so heads/tails remain contiguous"). Returns the ticket that
    /// was rotated (before the drop check), for the caller to act on.
    pub fn rotate_one(&mut self) -> Option<Ticket> {
        let ticket = self.tickets.pop_front()?;
        if ticket.state != TicketState::Removed {
            let _ = self.tickets.push_back(ticket);
        }
        Some(ticket)
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_poll_marks_removed_once_done() {
        let mut q = MailboxQueue::new();
        let id = q.add(1, 0, 32).unwrap();
        assert_eq!(q.done_poll(id), Some(false));
        q.set_state(id, TicketState::Done);
        assert_eq!(q.done_poll(id), Some(true));
        assert_eq!(q.done_poll(id), Some(true));
    }

    #[test]
    fn rotate_drops_removed_tickets() {
        let mut q = MailboxQueue::new();
        let a = q.add(1, 0, 32).unwrap();
        let _b = q.add(2, 1, 32).unwrap();
        q.expire(a);
        assert_eq!(q.len(), 2);
        q.rotate_one();
        assert_eq!(q.len(), 1);
    }
}
