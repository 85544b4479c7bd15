//! The raw NIC driver interface the core consumes (spec §6 "NIC driver
//! interface"). Opening adapters, sending a completed Ethernet frame and
//! receiving one back are the only operations the core needs; everything
//! above this line (framing, addressing, retries) lives in [`crate::port`].

use crate::error::Error;

/// One opened network adapter, primary or secondary.
pub trait RawEthernetPort {
    /// Sends a complete Ethernet II frame. Must not block.
    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Reads at most one frame into `buf`, non-blocking. Returns the number
    /// of bytes written, or `None` if nothing was waiting.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error>;
}

/// Adapter enumeration (spec §6 "adapter enumeration"), kept separate from
/// `RawEthernetPort` since listing adapters is an OS/platform concern the
/// core never needs at runtime — only tooling built on top of it does.
pub trait LinkEnumerator {
    type Iter: Iterator<Item = AdapterInfo>;

    fn list_adapters(&self) -> Self::Iter;
}

#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: heapless::String<64>,
    pub description: heapless::String<128>,
}

/// An in-memory loopback pair, used by unit tests that exercise the Port
/// and datagram layers without a real NIC (SPEC_FULL §10.4).
#[cfg(any(test, feature = "std"))]
pub mod loopback {
    use super::*;
    use heapless::Deque;

    const QUEUE_DEPTH: usize = 32;

    #[derive(Debug)]
    pub struct LoopbackPort {
        inbox: Deque<heapless::Vec<u8, 1536>, QUEUE_DEPTH>,
    }

    impl Default for LoopbackPort {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LoopbackPort {
        pub fn new() -> Self {
            Self { inbox: Deque::new() }
        }

        /// Injects a frame as if it had arrived on the wire (used by tests
        /// to simulate a slave's reply).
        pub fn inject(&mut self, frame: &[u8]) {
            let mut v = heapless::Vec::new();
            let _ = v.extend_from_slice(frame);
            let _ = self.inbox.push_back(v);
        }
    }

    impl RawEthernetPort for LoopbackPort {
        fn send(&mut self, _frame: &[u8]) -> Result<(), Error> {
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
            match self.inbox.pop_front() {
                Some(frame) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    Ok(Some(len))
                }
                None => Ok(None),
            }
        }
    }
}
