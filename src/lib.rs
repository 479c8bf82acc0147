//! Bridges an IR receiver/transmitter on a serial line to host actions, and TCP
//! commands to IR transmissions.

pub mod actions;
pub mod config;
pub mod dispatch;
pub mod ingress;
pub mod transmit;

#[cfg(test)]
mod testutil;
