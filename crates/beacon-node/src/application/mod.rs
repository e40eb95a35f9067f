//! Application layer for the discovery node.
//!
//! # Sub-modules
//!
//! - **`discovery`** – The [`Discovery`](discovery::Discovery) runtime.  Owns
//!   the membership state machine from `beacon_core`, drives the heartbeat
//!   and health-check timers, runs the receive loop, and publishes
//!   [`DiscoveryEvent`](discovery::DiscoveryEvent)s to subscribers.
//!
//! - **`channels`** – Application-defined pub/sub channels multiplexed over
//!   the same transport as membership traffic.
//!
//! **Dependency rule**: this layer depends on `beacon_core` and on the
//! [`DatagramTransport`](crate::infrastructure::network::DatagramTransport)
//! trait, never on a concrete socket type.

pub mod channels;
pub mod discovery;
