//! Node records: what this instance knows about itself and about its peers.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The body of a `hello` envelope.
///
/// Every field is optional on receipt: a peer that omits a field leaves the
/// stored value untouched.  `info` distinguishes "absent" (`None`) from an
/// explicit `null` (`Some(Value::Null)`), which clears the advertisement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_master: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_master_eligible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Address the sender believes it has.  Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub info: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// This instance's own record, broadcast with every hello.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfRecord {
    pub id: String,
    pub process_id: String,
    pub host_name: String,
    pub address: String,
    pub port: u16,
    pub is_master: bool,
    pub is_master_eligible: bool,
    pub weight: f64,
    /// Application advertisement; `None` means nothing to advertise.
    pub info: Option<Value>,
}

impl SelfRecord {
    /// The hello body for this record.  `info` is always present so that
    /// clearing an advertisement propagates as an explicit `null`.
    pub fn to_hello(&self) -> HelloPayload {
        HelloPayload {
            is_master: Some(self.is_master),
            is_master_eligible: Some(self.is_master_eligible),
            weight: Some(self.weight),
            address: Some(self.address.clone()),
            info: Some(self.info.clone().unwrap_or(Value::Null)),
        }
    }
}

/// Who a hello came from, as established by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub instance_id: String,
    pub process_id: String,
    pub host_name: String,
    /// Datagram source; never taken from the payload.
    pub source: SocketAddr,
}

/// A remote peer's last known state.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub process_id: String,
    pub address: IpAddr,
    pub port: u16,
    pub host_name: String,
    pub last_seen: Instant,
    pub is_master: bool,
    pub is_master_eligible: bool,
    pub weight: f64,
    pub info: Option<Value>,
}

impl Node {
    /// A record for a peer seen for the first time.  Fields the peer has not
    /// advertised yet default to "not master, not eligible, weight 0".
    pub fn discovered(origin: &Origin, now: Instant) -> Self {
        Self {
            id: origin.instance_id.clone(),
            process_id: origin.process_id.clone(),
            address: origin.source.ip(),
            port: origin.source.port(),
            host_name: origin.host_name.clone(),
            last_seen: now,
            is_master: false,
            is_master_eligible: false,
            weight: 0.0,
            info: None,
        }
    }

    /// Refreshes transport-derived fields and merges advertised ones.
    pub fn merge(&mut self, origin: &Origin, hello: &HelloPayload, now: Instant) {
        self.last_seen = now;
        self.address = origin.source.ip();
        self.port = origin.source.port();
        self.host_name = origin.host_name.clone();
        self.process_id = origin.process_id.clone();

        if let Some(is_master) = hello.is_master {
            self.is_master = is_master;
        }
        if let Some(eligible) = hello.is_master_eligible {
            self.is_master_eligible = eligible;
        }
        if let Some(weight) = hello.weight {
            self.weight = weight;
        }
        if let Some(info) = &hello.info {
            self.info = if info.is_null() { None } else { Some(info.clone()) };
        }
    }
}
