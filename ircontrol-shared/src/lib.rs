#![cfg_attr(not(feature = "std"), no_std)]

pub mod code;
pub mod protocol;

#[cfg(feature = "utils")]
pub mod codetable;
#[cfg(feature = "utils")]
pub mod link;

pub use code::{IrCode, Protocol};
pub use protocol::{Message, MessageType, PACKET_SIZE};

#[cfg(feature = "utils")]
pub use codetable::CodeTable;
#[cfg(feature = "utils")]
pub use link::{Interface, SerialLink};
