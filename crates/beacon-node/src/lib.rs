//! beacon-node library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::channels::{ChannelHandler, ChannelMessage};
pub use application::discovery::{Discovery, DiscoveryError, DiscoveryEvent};
pub use infrastructure::network::{DatagramTransport, TransportError};
pub use infrastructure::storage::config::{ConfigError, DiscoveryConfig};
