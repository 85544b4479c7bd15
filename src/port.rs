//! The indexed frame engine (spec §4.1, §3 "Frame index ring").
//!
//! Maintains a ring of `EC_MAXBUF` TX/RX slots per NIC "stack". A logical
//! send/receive cycle is identified by the slot index carried in the
//! datagram header; at most one request may be in flight per index. In
//! redundant mode the same index is driven on both the primary and
//! secondary link and the engine reconciles which buffer is authoritative
//! from the second MAC word of the returned frame.

use heapless::Vec;

use crate::error::{Error, PortError};
use crate::ethernet::{
    mac_word1, ECAT_HEADER_LEN, ETHERNET_HEADER_LEN, PRIMARY_MAC, PRIMARY_MARKER, SECONDARY_MAC,
    SECONDARY_MARKER,
};
use crate::link::RawEthernetPort;
use crate::osal::{Deadline, Osal};

/// Depth of the TX/RX index ring (SPEC_FULL §1, pinned from SOEM `EC_MAXBUF`).
pub const EC_MAXBUF: usize = 16;
/// Largest Ethernet frame the port will build or accept.
pub const MAX_FRAME: usize = 1518;
/// Budget for the one-break-recovery resend's reply on the secondary link
/// (spec §4.1 "Redundant mode"; SOEM `ecx_waitinframe_red` gives the resend
/// its own short wait rather than reusing the outer retry deadline).
const RESEND_RETRY_NS: u64 = 2_000_000;

/// A TX slot's status strictly advances `Empty -> Alloc -> Tx -> Rcvd ->
/// Complete -> Empty` (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Alloc,
    Tx,
    Rcvd,
    Complete,
}

struct Slot {
    status: SlotStatus,
    tx: Vec<u8, MAX_FRAME>,
    rx: Vec<u8, MAX_FRAME>,
    rx_mac_word1: Option<u16>,
    wkc: u16,
}

impl Slot {
    const fn new() -> Self {
        Self {
            status: SlotStatus::Empty,
            tx: Vec::new(),
            rx: Vec::new(),
            rx_mac_word1: None,
            wkc: 0,
        }
    }
}

/// One NIC's indexed TX/RX ring (spec §4.1 "symmetric stacks").
struct Stack {
    slots: [Slot; EC_MAXBUF],
    last_used: usize,
}

impl Stack {
    fn new() -> Self {
        Self {
            slots: [
                Slot::new(), Slot::new(), Slot::new(), Slot::new(),
                Slot::new(), Slot::new(), Slot::new(), Slot::new(),
                Slot::new(), Slot::new(), Slot::new(), Slot::new(),
                Slot::new(), Slot::new(), Slot::new(), Slot::new(),
            ],
            last_used: 0,
        }
    }

    /// Scans forward from the last-used slot for `Empty`. Fails only if
    /// every slot is in use (spec §4.1 "Acquire index").
    fn acquire(&mut self) -> Result<u8, PortError> {
        for step in 0..EC_MAXBUF {
            let idx = (self.last_used + 1 + step) % EC_MAXBUF;
            if self.slots[idx].status == SlotStatus::Empty {
                self.slots[idx].status = SlotStatus::Alloc;
                self.last_used = idx;
                return Ok(idx as u8);
            }
        }
        Err(PortError::NoFreeIndex)
    }

    fn send(&mut self, index: u8, link: &mut impl RawEthernetPort) -> Result<(), Error> {
        let slot = &mut self.slots[index as usize];
        link.send(&slot.tx).map_err(|_| PortError::SendFailed)?;
        slot.status = SlotStatus::Tx;
        Ok(())
    }

    /// Reads at most one frame; if it matches a slot in `Tx`, completes the
    /// round trip for that slot (spec §4.1 "Receive one frame").
    fn receive_one(&mut self, link: &mut impl RawEthernetPort, source_mac: u64) -> Result<bool, Error> {
        let mut buf = [0u8; MAX_FRAME];
        let Some(len) = link.receive(&mut buf)? else {
            return Ok(false);
        };
        if len < ETHERNET_HEADER_LEN + ECAT_HEADER_LEN {
            return Ok(false);
        }
        let src_mac = u64::from_be_bytes({
            let mut m = [0u8; 8];
            m[2..8].copy_from_slice(&buf[6..12]);
            m
        });
        // Ignore our own broadcast, mirrored back by some switches.
        if src_mac == source_mac {
            return Ok(false);
        }
        let payload = &buf[ETHERNET_HEADER_LEN + ECAT_HEADER_LEN..len];
        let Some(dgram) = crate::datagram::iter_datagrams(payload).next() else {
            return Ok(false);
        };
        let idx = dgram.index() as usize;
        if idx >= EC_MAXBUF {
            return Ok(false);
        }
        let slot = &mut self.slots[idx];
        match slot.status {
            SlotStatus::Tx => {
                slot.rx.clear();
                let _ = slot.rx.extend_from_slice(payload);
                slot.rx_mac_word1 = Some(mac_word1(src_mac));
                slot.wkc = dgram.working_counter();
                slot.status = SlotStatus::Rcvd;
                Ok(true)
            }
            // Already received this index: duplicate, discard.
            _ => Ok(false),
        }
    }

    fn wait(
        &mut self,
        index: u8,
        link: &mut impl RawEthernetPort,
        source_mac: u64,
        osal: &impl Osal,
        deadline: Deadline,
    ) -> Result<u16, Error> {
        loop {
            if self.slots[index as usize].status == SlotStatus::Rcvd {
                let slot = &mut self.slots[index as usize];
                slot.status = SlotStatus::Complete;
                let wkc = slot.wkc;
                slot.status = SlotStatus::Empty;
                return Ok(wkc);
            }
            if deadline.expired(osal) {
                self.slots[index as usize].status = SlotStatus::Empty;
                return Err(PortError::Timeout.into());
            }
            self.receive_one(link, source_mac)?;
        }
    }
}

/// The Port: one primary NIC stack, optionally a secondary for redundant
/// mode (spec §4.1).
pub struct Port<L> {
    primary_link: L,
    secondary_link: Option<L>,
    primary: Stack,
    secondary: Stack,
}

impl<L: RawEthernetPort> Port<L> {
    pub fn new(primary_link: L) -> Self {
        Self {
            primary_link,
            secondary_link: None,
            primary: Stack::new(),
            secondary: Stack::new(),
        }
    }

    pub fn new_redundant(primary_link: L, secondary_link: L) -> Self {
        Self {
            primary_link,
            secondary_link: Some(secondary_link),
            primary: Stack::new(),
            secondary: Stack::new(),
        }
    }

    pub fn is_redundant(&self) -> bool {
        self.secondary_link.is_some()
    }

    pub fn acquire_index(&mut self) -> Result<u8, Error> {
        Ok(self.primary.acquire()?)
    }

    /// Writes `frame` into the slot's TX buffer. Must be called before `send`.
    pub fn stage(&mut self, index: u8, frame: &[u8]) -> Result<(), Error> {
        let slot = &mut self.primary.slots[index as usize];
        slot.tx.clear();
        slot.tx
            .extend_from_slice(frame)
            .map_err(|_| crate::error::PacketError::TooLarge)?;
        if self.secondary_link.is_some() {
            let sslot = &mut self.secondary.slots[index as usize];
            sslot.status = SlotStatus::Alloc;
            sslot.tx.clear();
            let _ = sslot.tx.extend_from_slice(frame);
        }
        Ok(())
    }

    /// The raw received frame payload (after the Ethernet + EtherCAT
    /// headers) for `index`, valid until the slot is reused. Callers that
    /// need the datagram's data after [`Port::confirm`] parse it with
    /// [`crate::datagram::iter_datagrams`].
    pub fn rx_payload(&self, index: u8) -> &[u8] {
        let slot = &self.primary.slots[index as usize];
        &slot.rx[ETHERNET_HEADER_LEN + ECAT_HEADER_LEN..]
    }

    pub fn send(&mut self, index: u8) -> Result<(), Error> {
        self.primary.send(index, &mut self.primary_link)?;
        if let Some(sec_link) = self.secondary_link.as_mut() {
            self.secondary.send(index, sec_link)?;
        }
        Ok(())
    }

    /// Combined send + wait with retry (spec §4.1 "Confirm"): retries while
    /// the measured work counter is 0 or a short per-retry budget elapses,
    /// until the overall `timeout_ns` budget expires.
    pub fn confirm(
        &mut self,
        index: u8,
        osal: &impl Osal,
        retry_ns: u64,
        timeout_ns: u64,
    ) -> Result<u16, Error> {
        let overall = Deadline::after(osal, timeout_ns);
        loop {
            self.send(index)?;
            let retry_deadline = Deadline::after(osal, retry_ns.min(timeout_ns));
            let result = if self.is_redundant() {
                self.wait_redundant(index, osal, retry_deadline)
            } else {
                self.primary
                    .wait(index, &mut self.primary_link, PRIMARY_MAC, osal, retry_deadline)
            };
            match result {
                Ok(wkc) if wkc > 0 => return Ok(wkc),
                Ok(_) | Err(Error::Port(PortError::Timeout)) => {
                    if overall.expired(osal) {
                        return Err(Error::NoFrame);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-redundant wait for a single index.
    pub fn wait_index(&mut self, index: u8, osal: &impl Osal, deadline: Deadline) -> Result<u16, Error> {
        self.primary
            .wait(index, &mut self.primary_link, PRIMARY_MAC, osal, deadline)
    }

    /// Exposes the primary link for tests that need to inject a simulated
    /// reply frame from outside this module.
    #[cfg(test)]
    pub(crate) fn primary_link_for_test(&mut self) -> &mut L {
        &mut self.primary_link
    }

    /// Redundant-mode reconciliation (spec §4.1 "Redundant mode").
    fn wait_redundant(&mut self, index: u8, osal: &impl Osal, deadline: Deadline) -> Result<u16, Error> {
        loop {
            let primary_done = self.primary.slots[index as usize].status == SlotStatus::Rcvd;
            let secondary_done = self.secondary.slots[index as usize].status == SlotStatus::Rcvd;
            if primary_done && secondary_done {
                break;
            }
            if deadline.expired(osal) {
                self.primary.slots[index as usize].status = SlotStatus::Empty;
                self.secondary.slots[index as usize].status = SlotStatus::Empty;
                return Err(PortError::Timeout.into());
            }
            if !primary_done {
                self.primary.receive_one(&mut self.primary_link, PRIMARY_MAC)?;
            }
            if !secondary_done {
                if let Some(link) = self.secondary_link.as_mut() {
                    self.secondary.receive_one(link, SECONDARY_MAC)?;
                }
            }
        }

        let primary_seen = self.primary.slots[index as usize].rx_mac_word1;
        let secondary_seen = self.secondary.slots[index as usize].rx_mac_word1;

        let wkc = match (primary_seen, secondary_seen) {
            // Normal ring: primary sees the secondary marker (the frame went
            // all the way round) and vice versa. Secondary buffer is
            // authoritative.
            (Some(p), Some(s)) if p == SECONDARY_MARKER && s == PRIMARY_MARKER => {
                self.secondary.slots[index as usize].wkc
            }
            // Ring partially broken: primary only saw its own marker (it
            // looped back locally) while secondary got the real reply.
            // Feed the primary's result into the secondary TX buffer and
            // resend there; the resend's reply carries the full combined
            // image and is the only one that's authoritative (SOEM
            // `ecx_waitinframe_red`), so wait for it before reading the wkc.
            (p, Some(s)) if s == SECONDARY_MARKER && (p.is_none() || p == Some(PRIMARY_MARKER)) => {
                if p == Some(PRIMARY_MARKER) {
                    let payload = self.primary.slots[index as usize].rx.clone();
                    if let Some(link) = self.secondary_link.as_mut() {
                        let sslot = &mut self.secondary.slots[index as usize];
                        sslot.tx.clear();
                        let _ = sslot.tx.extend_from_slice(&payload);
                        let _ = link.send(&sslot.tx);
                        sslot.status = SlotStatus::Tx;
                        let resend_deadline = Deadline::after(osal, RESEND_RETRY_NS);
                        loop {
                            if self.secondary.slots[index as usize].status == SlotStatus::Rcvd {
                                break;
                            }
                            if resend_deadline.expired(osal) {
                                break;
                            }
                            self.secondary.receive_one(link, SECONDARY_MAC)?;
                        }
                    }
                }
                self.secondary.slots[index as usize].wkc
            }
            _ => 0,
        };

        self.primary.slots[index as usize].status = SlotStatus::Empty;
        self.secondary.slots[index as usize].status = SlotStatus::Empty;
        Ok(wkc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::{Command, FrameBuilder};
    use crate::link::loopback::LoopbackPort;

    struct FakeClock;
    impl Osal for FakeClock {
        fn now_ns(&self) -> u64 {
            0
        }
        fn usleep(&self, _micros: u32) {}
    }

    #[test]
    fn acquire_scans_from_last_used() {
        let mut stack = Stack::new();
        let a = stack.acquire().unwrap();
        let b = stack.acquire().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhausting_slots_fails() {
        let mut stack = Stack::new();
        for _ in 0..EC_MAXBUF {
            stack.acquire().unwrap();
        }
        assert_eq!(stack.acquire(), Err(PortError::NoFreeIndex));
    }

    #[test]
    fn send_and_receive_round_trip() {
        let mut port = Port::new(LoopbackPort::new());
        let idx = port.acquire_index().unwrap();

        let mut buf = [0u8; 64];
        let mut b = FrameBuilder::init(&mut buf, PRIMARY_MAC).unwrap();
        b.push(idx, Command::Brd { ado: 0x0130 }, &[0u8; 4]).unwrap();
        let frame = b.finish().to_vec();

        port.stage(idx, &frame).unwrap();

        // Simulate a slave reply: same frame but with wkc=1 and a foreign
        // source MAC so the loopback doesn't see it as self-broadcast.
        let mut reply = frame.clone();
        reply[6..12].copy_from_slice(&[0x12, 0x10, 0x10, 0x10, 0x10, 0x10]);
        let wkc_offset = reply.len() - 2;
        reply[wkc_offset..].copy_from_slice(&1u16.to_le_bytes());
        port.primary_link.inject(&reply);

        let deadline = Deadline::after(&FakeClock, 1_000_000_000);
        port.send(idx).unwrap();
        let wkc = port.wait_index(idx, &FakeClock, deadline).unwrap();
        assert_eq!(wkc, 1);
    }
}
