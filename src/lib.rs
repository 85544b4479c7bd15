#![no_std]

#[cfg(feature = "std")]
extern crate std;

pub mod context;
pub mod datagram;
pub mod dc;
pub mod discovery;
pub mod eni;
pub mod error;
pub mod ethernet;
pub mod group;
pub mod iomap;
pub mod link;
pub mod mailbox;
pub mod mapping;
pub mod osal;
pub mod port;
pub mod processdata;
pub mod quirks;
pub mod register;
pub mod sii;
pub mod slave;
pub mod state;

#[cfg(feature = "std")]
pub mod std;

pub use context::Context;
pub use error::Error;
