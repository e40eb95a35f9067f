//! The two halves of the transport pipeline.
//!
//! [`Outbound`] is stateless: `event + data → envelope → JSON → seal → wrap`.
//! It can be shared freely between tasks.
//!
//! [`Inbound`] owns the only stateful stage, the [`Unwrapper`], and must be
//! driven by a single receive loop: `datagram → unwrap → open → JSON →
//! self-filter → Delivery`.
//!
//! Every failure is mapped to a [`PipelineError`].  None of them poison the
//! pipeline: the offending message is dropped and the next datagram is
//! processed normally.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::protocol::cipher::Cipher;
use crate::protocol::codec::{decode_envelope, encode_envelope, CodecError};
use crate::protocol::envelope::{Envelope, Identity, IgnoreMode};
use crate::protocol::wrap::{
    max_fragment_payload, wrap, Unwrapper, WrapError, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_TIMEOUT,
};

/// Data-path errors.  Cloneable so they can be fanned out as events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Serialization, encryption, or fragmentation of an outbound message failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decryption or deserialization of a reassembled block failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A reassembled block did not match its checksum.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// A partial block expired before all fragments arrived.
    #[error("reassembly timeout: {0}")]
    ReassemblyTimeout(String),

    /// A datagram was rejected before reassembly.
    #[error("malformed datagram: {0}")]
    Malformed(String),
}

impl PipelineError {
    fn from_inbound(error: WrapError) -> Self {
        match error {
            WrapError::Checksum { .. } => PipelineError::Checksum(error.to_string()),
            WrapError::Timeout { .. } => PipelineError::ReassemblyTimeout(error.to_string()),
            other => PipelineError::Malformed(other.to_string()),
        }
    }
}

impl From<CodecError> for PipelineError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Encode(_) => PipelineError::Encode(error.to_string()),
            CodecError::Decode(_) => PipelineError::Decode(error.to_string()),
        }
    }
}

/// Settings shared by both pipeline halves.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Shared passphrase; `None` disables encryption.
    pub key: Option<String>,
    /// Datagram size including the 36-byte fragment header.
    pub block_size: usize,
    /// How long a partial block is kept.
    pub block_timeout: Duration,
    /// Which of our own broadcasts to drop on receipt.
    pub ignore: IgnoreMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            key: None,
            block_size: DEFAULT_BLOCK_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            ignore: IgnoreMode::Instance,
        }
    }
}

impl PipelineConfig {
    fn cipher(&self) -> Option<Cipher> {
        self.key.as_deref().map(Cipher::from_passphrase)
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Turns `(event, data)` into ready-to-send datagrams.
#[derive(Debug, Clone)]
pub struct Outbound {
    identity: Identity,
    cipher: Option<Cipher>,
    block_size: usize,
}

impl Outbound {
    /// # Errors
    ///
    /// [`PipelineError::Encode`] if the block size leaves no room for payload.
    pub fn new(config: &PipelineConfig, identity: Identity) -> Result<Self, PipelineError> {
        max_fragment_payload(config.block_size).map_err(|e| PipelineError::Encode(e.to_string()))?;
        Ok(Self {
            identity,
            cipher: config.cipher(),
            block_size: config.block_size,
        })
    }

    /// The identity stamped on every envelope.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Encodes one message into one or more datagrams.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Encode`] when any outbound stage fails.
    pub fn encode(&self, event: &str, data: Value) -> Result<Vec<Vec<u8>>, PipelineError> {
        let envelope = self.identity.envelope(event, data);
        let serialized = encode_envelope(&envelope)?;
        let sealed = match &self.cipher {
            Some(cipher) => cipher
                .seal(&serialized)
                .map_err(|e| PipelineError::Encode(e.to_string()))?,
            None => serialized,
        };
        wrap(&sealed, self.block_size).map_err(|e| PipelineError::Encode(e.to_string()))
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// A decoded envelope from another instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Address the datagrams actually came from.  Upper layers trust this,
    /// never an address carried inside the payload.
    pub source: SocketAddr,
}

/// Turns received datagrams into [`Delivery`]s.
#[derive(Debug)]
pub struct Inbound {
    identity: Identity,
    ignore: IgnoreMode,
    cipher: Option<Cipher>,
    unwrapper: Unwrapper,
}

impl Inbound {
    /// # Errors
    ///
    /// [`PipelineError::Decode`] if the block size leaves no room for payload.
    pub fn new(config: &PipelineConfig, identity: Identity) -> Result<Self, PipelineError> {
        let unwrapper = Unwrapper::new(config.block_size, config.block_timeout)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        Ok(Self {
            identity,
            ignore: config.ignore,
            cipher: config.cipher(),
            unwrapper,
        })
    }

    /// Feeds one datagram through the inbound stages.
    ///
    /// Returns `Ok(None)` while a block is still partial, and for envelopes
    /// this instance sent itself.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`] except `Encode`.
    pub fn ingest(
        &mut self,
        datagram: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Option<Delivery>, PipelineError> {
        let Some(block) = self
            .unwrapper
            .push(datagram, source, now)
            .map_err(PipelineError::from_inbound)?
        else {
            return Ok(None);
        };

        let plaintext = match &self.cipher {
            Some(cipher) => cipher
                .open(&block.payload)
                .map_err(|e| PipelineError::Decode(e.to_string()))?,
            None => block.payload,
        };
        let envelope = decode_envelope(&plaintext)?;

        if self.ignore.should_ignore(&self.identity, &envelope) {
            trace!("dropping own '{}' envelope", envelope.event);
            return Ok(None);
        }

        Ok(Some(Delivery {
            envelope,
            source: block.source,
        }))
    }

    /// Discards expired partial blocks.
    pub fn expire(&mut self, now: Instant) -> Vec<PipelineError> {
        self.unwrapper
            .expire(now)
            .into_iter()
            .map(PipelineError::from_inbound)
            .collect()
    }

    /// When the next partial block expires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unwrapper.next_deadline()
    }

    /// Number of partially received blocks.
    pub fn pending_blocks(&self) -> usize {
        self.unwrapper.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src() -> SocketAddr {
        "10.0.0.7:12345".parse().unwrap()
    }

    fn pair(config: &PipelineConfig) -> (Outbound, Inbound) {
        let sender = Identity::generate("sender");
        let receiver = Identity::generate("receiver");
        (
            Outbound::new(config, sender).unwrap(),
            Inbound::new(config, receiver).unwrap(),
        )
    }

    fn deliver(datagrams: &[Vec<u8>], inbound: &mut Inbound) -> Vec<Delivery> {
        let now = Instant::now();
        datagrams
            .iter()
            .filter_map(|d| inbound.ingest(d, src(), now).unwrap())
            .collect()
    }

    #[test]
    fn test_plain_message_crosses_pipeline() {
        // Arrange
        let (outbound, mut inbound) = pair(&PipelineConfig::default());

        // Act
        let datagrams = outbound.encode("jobs", json!({"thinking": true})).unwrap();
        let out = deliver(&datagrams, &mut inbound);

        // Assert
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.event, "jobs");
        assert_eq!(out[0].envelope.data, json!({"thinking": true}));
        assert_eq!(out[0].envelope.iid, outbound.identity().instance_id);
        assert_eq!(out[0].source, src());
    }

    #[test]
    fn test_encrypted_message_crosses_pipeline() {
        let config = PipelineConfig {
            key: Some("correct horse".to_string()),
            ..PipelineConfig::default()
        };
        let (outbound, mut inbound) = pair(&config);

        let datagrams = outbound.encode("jobs", json!([1, 2, 3])).unwrap();
        let out = deliver(&datagrams, &mut inbound);

        assert_eq!(out[0].envelope.data, json!([1, 2, 3]));
    }

    #[test]
    fn test_encrypted_payload_is_not_plain_json_on_the_wire() {
        let config = PipelineConfig {
            key: Some("k".to_string()),
            ..PipelineConfig::default()
        };
        let (outbound, _) = pair(&config);
        let datagrams = outbound.encode("secret-channel", Value::Null).unwrap();
        let body = &datagrams[0][36..];
        assert!(!body.windows(14).any(|w| w == b"secret-channel"));
    }

    #[test]
    fn test_key_mismatch_is_decode_error() {
        // Arrange
        let sender_cfg = PipelineConfig {
            key: Some("one".to_string()),
            ..PipelineConfig::default()
        };
        let receiver_cfg = PipelineConfig {
            key: Some("two".to_string()),
            ..PipelineConfig::default()
        };
        let outbound = Outbound::new(&sender_cfg, Identity::generate("a")).unwrap();
        let mut inbound = Inbound::new(&receiver_cfg, Identity::generate("b")).unwrap();
        let datagrams = outbound.encode("x", Value::Null).unwrap();

        // Act
        let result = inbound.ingest(&datagrams[0], src(), Instant::now());

        // Assert
        assert!(matches!(result, Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_own_envelope_is_filtered() {
        // Arrange
        let identity = Identity::generate("me");
        let config = PipelineConfig::default();
        let outbound = Outbound::new(&config, identity.clone()).unwrap();
        let mut inbound = Inbound::new(&config, identity).unwrap();

        // Act
        let datagrams = outbound.encode("hello", json!({})).unwrap();
        let out = deliver(&datagrams, &mut inbound);

        // Assert
        assert!(out.is_empty());
    }

    #[test]
    fn test_ignore_nothing_delivers_own_envelope() {
        let identity = Identity::generate("me");
        let config = PipelineConfig {
            ignore: IgnoreMode::Nothing,
            ..PipelineConfig::default()
        };
        let outbound = Outbound::new(&config, identity.clone()).unwrap();
        let mut inbound = Inbound::new(&config, identity).unwrap();

        let datagrams = outbound.encode("hello", json!({})).unwrap();

        assert_eq!(deliver(&datagrams, &mut inbound).len(), 1);
    }

    #[test]
    fn test_garbage_datagram_is_malformed() {
        let (_, mut inbound) = pair(&PipelineConfig::default());
        let result = inbound.ingest(b"definitely not a fragment", src(), Instant::now());
        assert!(matches!(result, Err(PipelineError::Malformed(_))));
    }

    #[test]
    fn test_wrapped_non_json_is_decode_error() {
        let (_, mut inbound) = pair(&PipelineConfig::default());
        let datagram = wrap(b"{not json", DEFAULT_BLOCK_SIZE).unwrap().remove(0);
        let result = inbound.ingest(&datagram, src(), Instant::now());
        assert!(matches!(result, Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_expire_maps_to_reassembly_timeout() {
        // Arrange
        let (outbound, mut inbound) = pair(&PipelineConfig::default());
        let big: String = "x".repeat(4000);
        let datagrams = outbound.encode("bulk", json!(big)).unwrap();
        let start = Instant::now();
        inbound.ingest(&datagrams[0], src(), start).unwrap();

        // Act
        let errors = inbound.expire(start + Duration::from_secs(6));

        // Assert
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], PipelineError::ReassemblyTimeout(_)));
        assert_eq!(inbound.pending_blocks(), 0);
    }

    #[test]
    fn test_outbound_rejects_tiny_block_size() {
        let config = PipelineConfig {
            block_size: 10,
            ..PipelineConfig::default()
        };
        let result = Outbound::new(&config, Identity::generate("h"));
        assert!(matches!(result, Err(PipelineError::Encode(_))));
    }
}
