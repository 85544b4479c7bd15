//! Reference link-driver + OSAL implementation for desktop hosts (spec §6
//! "NIC driver interface", "OSAL interface"), feature-gated behind `std`
//! since it needs a real NIC and the host clock. Not part of the core —
//! applications are free to supply their own `RawEthernetPort`/`Osal` impls
//! instead (an embedded target would, since `pnet_datalink` needs an OS).
//!
//! Grounded in the teacher's `examples/pnet.rs` harness: open an interface by
//! name through `pnet_datalink`, wrap its `DataLinkSender`/`DataLinkReceiver`
//! behind the core's traits.

extern crate std;

use std::boxed::Box;
use std::string::String;
use std::time::Instant;
use std::vec::Vec;

use pnet_datalink::{self, Channel::Ethernet, DataLinkReceiver, DataLinkSender};

use crate::error::Error;
use crate::link::{AdapterInfo, LinkEnumerator, RawEthernetPort};
use crate::osal::Osal;

/// Opens one adapter by OS interface name (spec §6 "adapter enumeration"
/// lists names this constructor consumes).
pub struct PnetPort {
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
}

impl PnetPort {
    pub fn open(interface_name: &str) -> Result<Self, Error> {
        let interface = pnet_datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or(Error::LinkUnavailable)?;
        let (tx, rx) = match pnet_datalink::channel(&interface, Default::default()) {
            Ok(Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(Error::LinkUnavailable),
            Err(_) => return Err(Error::LinkUnavailable),
        };
        Ok(Self { tx, rx })
    }
}

impl RawEthernetPort for PnetPort {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        match self.tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            _ => Err(Error::LinkUnavailable),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        match self.rx.next() {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(_) => Err(Error::LinkUnavailable),
        }
    }
}

/// Lists the OS's network interfaces (spec §6 "adapter enumeration"),
/// grounded in the teacher's `examples/pnet.rs` `main` fallback listing.
pub struct PnetEnumerator;

pub struct AdapterIter {
    inner: std::vec::IntoIter<pnet_datalink::NetworkInterface>,
}

impl Iterator for AdapterIter {
    type Item = AdapterInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|iface| AdapterInfo {
            name: heapless::String::try_from(truncate(&iface.name, 64).as_str()).unwrap_or_default(),
            description: heapless::String::try_from(truncate(&iface.description, 128).as_str()).unwrap_or_default(),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl LinkEnumerator for PnetEnumerator {
    type Iter = AdapterIter;

    fn list_adapters(&self) -> Self::Iter {
        let interfaces: Vec<_> = pnet_datalink::interfaces();
        AdapterIter { inner: interfaces.into_iter() }
    }
}

/// `Osal` backed by `std::time::Instant` and `std::thread::sleep` — the
/// desktop counterpart to an embedded target's tick-counter impl.
pub struct StdOsal {
    epoch: Instant,
}

impl Default for StdOsal {
    fn default() -> Self {
        Self::new()
    }
}

impl StdOsal {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Osal for StdOsal {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn usleep(&self, micros: u32) {
        std::thread::sleep(std::time::Duration::from_micros(micros as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_osal_now_ns_is_monotonic_nondecreasing() {
        let osal = StdOsal::new();
        let a = osal.now_ns();
        osal.usleep(1);
        let b = osal.now_ns();
        assert!(b >= a);
    }
}
