//! Connection admission and upgrade pipeline.
//!
//! Every connection handled by a [`swarm::Swarm`] moves through three states,
//! raw, secured and capable, and the configured [`gater::ConnectionGater`] is
//! consulted at each admission checkpoint on the way:
//!
//! | Checkpoint | Enforced by | Information available |
//! |---|---|---|
//! | dial | swarm | target address |
//! | peer dial | swarm | target peer |
//! | accept | swarm | local and remote addresses |
//! | secured | upgrader | verified remote peer |
//! | upgraded | upgrader | live multiplexed connection |
//!
//! A denial at any checkpoint tears the connection down; only connections that
//! pass every checkpoint are registered with the swarm.

mod framing;
pub mod gater;
pub mod identity;
pub mod muxer;
pub mod security;
pub mod swarm;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod types;
pub mod upgrader;
pub mod utils;
