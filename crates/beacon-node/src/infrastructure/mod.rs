//! Infrastructure layer for the discovery node.
//!
//! Contains OS-facing adapters: datagram transports (UDP and an in-process
//! loopback hub) and TOML configuration storage.
//!
//! **Dependency rule**: this layer may depend on `beacon_core`, but MUST NOT
//! import from `application`.

pub mod network;
pub mod storage;
