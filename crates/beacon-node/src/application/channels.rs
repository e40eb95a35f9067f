//! Application-defined channels.
//!
//! A channel is a named topic carried in the envelope's `event` field, next
//! to the reserved membership traffic.  Joining a channel registers a local
//! handler; every envelope received for that name is handed to all of the
//! channel's handlers in registration order.  Leaving removes every handler
//! for the name at once.
//!
//! Reserved names are rejected by [`Discovery`](super::discovery::Discovery)
//! before they reach the registry.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use beacon_core::Envelope;
use serde_json::Value;

/// Callback invoked for each message on a joined channel.
pub type ChannelHandler = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// A message received on a joined channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: String,
    /// Application payload; `Value::Null` when the sender sent none.
    pub data: Value,
    /// Instance id of the sender.
    pub sender: String,
    /// Process id of the sender.
    pub process_id: String,
    pub host_name: String,
    /// Address the datagrams came from.
    pub source: SocketAddr,
}

impl ChannelMessage {
    pub fn from_envelope(envelope: Envelope, source: SocketAddr) -> Self {
        Self {
            channel: envelope.event,
            data: envelope.data,
            sender: envelope.iid,
            process_id: envelope.pid,
            host_name: envelope.host_name,
            source,
        }
    }
}

/// Joined channels and their handlers.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: HashMap<String, Vec<ChannelHandler>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("ChannelRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl ChannelRegistry {
    /// Adds `handler` to `name`.  Returns `true` if this is the first
    /// handler, i.e. the channel was not joined before.
    pub fn join(&mut self, name: &str, handler: ChannelHandler) -> bool {
        let list = self.handlers.entry(name.to_string()).or_default();
        list.push(handler);
        list.len() == 1
    }

    /// Drops every handler for `name`.  Returns `true` if it was joined.
    pub fn leave(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn is_joined(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// The handlers for `name`, cloned so they can be called without holding
    /// the registry.
    pub fn handlers(&self, name: &str) -> Vec<ChannelHandler> {
        self.handlers.get(name).cloned().unwrap_or_default()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
