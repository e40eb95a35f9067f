//! The wire envelope and the sender identity stamped onto it.
//!
//! Every datagram block carries exactly one JSON envelope:
//!
//! ```json
//! {"event":"hello","data":{...},"pid":"9f0c…","iid":"41ab…","hostName":"build-07"}
//! ```
//!
//! - `pid` is shared by every engine instance inside one OS process.
//! - `iid` is unique per engine instance.
//!
//! Receivers use one of the two ids to drop their own broadcasts (see
//! [`IgnoreMode`]).

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event (channel) name, e.g. `"hello"`.
    pub event: String,
    /// Arbitrary application payload.  Absent on the wire decodes as `null`.
    #[serde(default)]
    pub data: Value,
    /// Process id of the sender.
    pub pid: String,
    /// Instance id of the sender.
    pub iid: String,
    /// Host name reported by the sender.
    #[serde(default)]
    pub host_name: String,
}

/// The ids and host name this instance stamps on every outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub process_id: String,
    pub instance_id: String,
    pub host_name: String,
}

impl Identity {
    /// Creates an identity with a fresh instance id and the shared process id.
    pub fn generate(host_name: impl Into<String>) -> Self {
        Self {
            process_id: process_id().to_string(),
            instance_id: random_hex_id(),
            host_name: host_name.into(),
        }
    }

    /// Wraps `data` in an envelope addressed to `event`.
    pub fn envelope(&self, event: &str, data: Value) -> Envelope {
        Envelope {
            event: event.to_string(),
            data,
            pid: self.process_id.clone(),
            iid: self.instance_id.clone(),
            host_name: self.host_name.clone(),
        }
    }
}

/// Which of our own broadcasts a receiver should drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IgnoreMode {
    /// Drop envelopes carrying our instance id.
    #[default]
    #[serde(rename = "self")]
    Instance,
    /// Drop envelopes from any instance in this OS process.
    #[serde(rename = "process")]
    Process,
    /// Deliver everything, including our own broadcasts.
    #[serde(rename = "none")]
    Nothing,
}

impl IgnoreMode {
    /// Returns `true` when `envelope` originated from `identity` under this mode.
    pub fn should_ignore(self, identity: &Identity, envelope: &Envelope) -> bool {
        match self {
            IgnoreMode::Instance => envelope.iid == identity.instance_id,
            IgnoreMode::Process => envelope.pid == identity.process_id,
            IgnoreMode::Nothing => false,
        }
    }
}

/// The process-wide id shared by every instance created in this process.
pub fn process_id() -> &'static str {
    static PROCESS_ID: OnceLock<String> = OnceLock::new();
    PROCESS_ID.get_or_init(random_hex_id)
}

/// A random 128-bit id rendered as 32 lowercase hex characters.
pub fn random_hex_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Best-effort local host name.
pub fn local_host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
