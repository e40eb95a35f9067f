//! # beacon-core
//!
//! Shared library for Beacon containing the datagram wire protocol, the
//! fragment reassembler, and the membership/election state machine.
//!
//! This crate performs no I/O.  It never opens a socket, spawns a task, or
//! reads the clock on its own: every time-dependent operation takes `now` as
//! an argument.  That keeps the hard parts (reassembly expiry, heartbeat
//! timeouts, master election) deterministic and easy to unit-test.
//!
//! # Architecture overview (for beginners)
//!
//! Beacon lets processes on the same LAN find each other over UDP broadcast
//! or multicast and agree on a "master" without any central coordinator.
//!
//! - **`protocol`** – How application messages become datagrams and back.
//!   Outbound: envelope → JSON → optional AES-GCM → fragments.  Inbound: the
//!   reverse, with a reassembly buffer in the middle.
//!
//! - **`domain`** – The node table and the election rules: who is alive, who
//!   is master, and when this instance should promote or demote itself.

pub mod domain;
pub mod protocol;

pub use domain::membership::{
    is_reserved, ElectionSettings, Membership, MembershipEvent, Outcome, SettingsError, HELLO_EVENT,
    RESERVED_EVENTS,
};
pub use domain::node::{HelloPayload, Node, Origin, SelfRecord};
pub use protocol::envelope::{Envelope, Identity, IgnoreMode};
pub use protocol::pipeline::{Delivery, Inbound, Outbound, PipelineConfig, PipelineError};
