//! Protocol module: envelope format and the encode/encrypt/fragment pipeline.
//!
//! Stages, in outbound order:
//!
//! ```text
//! Envelope ─► codec (JSON) ─► cipher (optional) ─► wrap ─► datagrams
//! datagrams ─► unwrap ─► cipher (optional) ─► codec ─► Envelope
//! ```
//!
//! Only `wrap` keeps state between datagrams (the reassembly buffer).

pub mod checksum;
pub mod cipher;
pub mod codec;
pub mod envelope;
pub mod pipeline;
pub mod wrap;

pub use cipher::{Cipher, CipherError};
pub use codec::{decode_envelope, encode_envelope, CodecError};
pub use envelope::{Envelope, Identity, IgnoreMode};
pub use pipeline::{Delivery, Inbound, Outbound, PipelineConfig, PipelineError};
pub use wrap::{wrap, FragmentHeader, Reassembled, Unwrapper, WrapError};
