//! Reverse tunnel: agents connect out to the gateway, register named
//! services over a multiplexed session, and the gateway dials back through
//! per-request proxy streams.

pub mod autolisten;
pub mod client;
pub mod datagram;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
