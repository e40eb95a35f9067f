//! Fragmentation ("wrap") and reassembly ("unwrap") of payloads that do not
//! fit in a single datagram.
//!
//! Wire format of one fragment:
//! ```text
//! [magic:4 "WRAP"][block_id:16][checksum:i32][total_len:u32][frag_len:u32][offset:u32][fragment:frag_len]
//! ```
//! Header size: 36 bytes.  All integers are big-endian.
//!
//! # How reassembly works (for beginners)
//!
//! UDP delivers each datagram whole or not at all, but it may reorder them and
//! it caps their size.  A payload larger than `block_size - 36` bytes is
//! therefore split into several fragments that all carry:
//!
//! - the same random **block id**, so the receiver knows they belong together;
//! - the same **checksum** of the *complete* payload, so the receiver can tell
//!   whether the reassembled buffer is intact;
//! - the **total length** and their own **offset**, so each fragment can be
//!   copied straight into a pre-sized buffer no matter which order it arrives.
//!
//! The receiver keeps one [`PendingBlock`] per block id.  Once every fragment
//! has arrived the checksum is verified and the buffer is released.  A block
//! that stalls for longer than `block_timeout` is discarded.  Deadlines live in
//! one ordered set, so finding the next expiry never scans the whole table.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::protocol::checksum::signed_crc32;

/// Magic tag at the start of every fragment.
pub const MAGIC: [u8; 4] = *b"WRAP";

/// Size of the fragment header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Default datagram size, header included.
pub const DEFAULT_BLOCK_SIZE: usize = 1500;

/// Default time a partially received block is kept.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Upper bound on a block's declared length; larger headers are rejected
/// before any buffer is allocated.
pub const MAX_BLOCK_LENGTH: usize = 16 * 1024 * 1024;

/// Random identifier shared by all fragments of one block.
pub type BlockId = [u8; 16];

/// Errors produced while wrapping or unwrapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WrapError {
    /// The configured block size leaves no room for payload.
    #[error("block size {0} cannot hold the {HEADER_SIZE}-byte fragment header")]
    BlockSizeTooSmall(usize),

    /// The datagram is shorter than a fragment header.
    #[error("datagram too small: {0} bytes")]
    TooSmall(usize),

    /// The datagram does not start with the `WRAP` tag.
    #[error("datagram is not a wrapped fragment")]
    BadMagic,

    /// The header declares more fragment bytes than the datagram carries.
    #[error("fragment incomplete: header declares {declared} bytes, {available} received")]
    Incomplete { declared: usize, available: usize },

    /// The fragment would be written outside its block.
    #[error("fragment out of bounds: offset {offset} + {length} exceeds block length {total}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        total: usize,
    },

    /// A fragment disagrees with earlier fragments of the same block.
    #[error("fragment of block {block} disagrees with earlier fragments")]
    Inconsistent { block: String },

    /// The block is larger than [`MAX_BLOCK_LENGTH`].
    #[error("block length {0} exceeds the {MAX_BLOCK_LENGTH}-byte limit")]
    TooLarge(usize),

    /// The reassembled buffer does not match the header checksum.
    #[error("block {block} failed checksum: header {expected}, computed {actual}")]
    Checksum {
        block: String,
        expected: i32,
        actual: i32,
    },

    /// The block did not complete before its deadline.
    #[error("block {block} timed out with {received} of {expected} fragments")]
    Timeout {
        block: String,
        received: usize,
        expected: usize,
    },
}

impl WrapError {
    /// `true` for errors raised by a single bad datagram, before any
    /// reassembly state was touched.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            WrapError::TooSmall(_)
                | WrapError::BadMagic
                | WrapError::Incomplete { .. }
                | WrapError::OutOfBounds { .. }
                | WrapError::Inconsistent { .. }
                | WrapError::TooLarge(_)
        )
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub block_id: BlockId,
    /// Signed CRC-32 of the complete block payload.
    pub checksum: i32,
    /// Length of the complete block payload.
    pub total_length: u32,
    /// Number of payload bytes following this header.
    pub fragment_length: u32,
    /// Byte offset of this fragment within the block payload.
    pub offset: u32,
}

impl FragmentHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&self.block_id);
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.total_length.to_be_bytes());
        buf.extend_from_slice(&self.fragment_length.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
    }

    /// Parses the header and returns it with the fragment bytes it describes.
    ///
    /// Bytes after the declared fragment length are ignored.
    ///
    /// # Errors
    ///
    /// [`WrapError::TooSmall`], [`WrapError::BadMagic`], or
    /// [`WrapError::Incomplete`].
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8]), WrapError> {
        if datagram.len() < HEADER_SIZE {
            return Err(WrapError::TooSmall(datagram.len()));
        }
        if datagram[0..4] != MAGIC {
            return Err(WrapError::BadMagic);
        }

        let mut block_id = [0u8; 16];
        block_id.copy_from_slice(&datagram[4..20]);
        let header = Self {
            block_id,
            checksum: read_u32(datagram, 20) as i32,
            total_length: read_u32(datagram, 24),
            fragment_length: read_u32(datagram, 28),
            offset: read_u32(datagram, 32),
        };

        let body = &datagram[HEADER_SIZE..];
        let declared = header.fragment_length as usize;
        if body.len() < declared {
            return Err(WrapError::Incomplete {
                declared,
                available: body.len(),
            });
        }
        Ok((header, &body[..declared]))
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn block_label(id: &BlockId) -> String {
    Uuid::from_bytes(*id).simple().to_string()
}

// ── Wrap ──────────────────────────────────────────────────────────────────────

/// Payload bytes available per fragment for a given block size.
///
/// # Errors
///
/// [`WrapError::BlockSizeTooSmall`] when `block_size <= HEADER_SIZE`.
pub fn max_fragment_payload(block_size: usize) -> Result<usize, WrapError> {
    if block_size <= HEADER_SIZE {
        return Err(WrapError::BlockSizeTooSmall(block_size));
    }
    Ok(block_size - HEADER_SIZE)
}

/// Number of fragments needed for a payload of `len` bytes.
///
/// An empty payload still travels as one header-only fragment.
pub fn fragment_count(len: usize, max_fragment: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(max_fragment)
    }
}

/// Splits `payload` into datagrams under a fresh random block id.
///
/// # Errors
///
/// [`WrapError::BlockSizeTooSmall`] or [`WrapError::TooLarge`].
pub fn wrap(payload: &[u8], block_size: usize) -> Result<Vec<Vec<u8>>, WrapError> {
    wrap_block(Uuid::new_v4().into_bytes(), payload, block_size)
}

/// Splits `payload` into datagrams under the given block id.
///
/// # Errors
///
/// [`WrapError::BlockSizeTooSmall`] or [`WrapError::TooLarge`].
pub fn wrap_block(
    block_id: BlockId,
    payload: &[u8],
    block_size: usize,
) -> Result<Vec<Vec<u8>>, WrapError> {
    let max_fragment = max_fragment_payload(block_size)?;
    if payload.len() > MAX_BLOCK_LENGTH {
        return Err(WrapError::TooLarge(payload.len()));
    }

    let checksum = signed_crc32(payload);
    let count = fragment_count(payload.len(), max_fragment);
    let mut datagrams = Vec::with_capacity(count);

    for index in 0..count {
        let start = index * max_fragment;
        let end = (start + max_fragment).min(payload.len());
        let header = FragmentHeader {
            block_id,
            checksum,
            total_length: payload.len() as u32,
            fragment_length: (end - start) as u32,
            offset: start as u32,
        };

        let mut datagram = Vec::with_capacity(HEADER_SIZE + end - start);
        header.write_to(&mut datagram);
        datagram.extend_from_slice(&payload[start..end]);
        datagrams.push(datagram);
    }

    Ok(datagrams)
}

// ── Unwrap ────────────────────────────────────────────────────────────────────

/// A fully reassembled, checksum-verified block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub payload: Vec<u8>,
    /// Sender of the block's first fragment.
    pub source: SocketAddr,
}

#[derive(Debug)]
struct PendingBlock {
    checksum: i32,
    total_length: u32,
    expected: usize,
    offsets: HashSet<u32>,
    buffer: Vec<u8>,
    source: SocketAddr,
    deadline: Instant,
}

/// Reassembly buffer for inbound fragments.
#[derive(Debug)]
pub struct Unwrapper {
    max_fragment: usize,
    block_timeout: Duration,
    blocks: HashMap<BlockId, PendingBlock>,
    deadlines: BTreeSet<(Instant, BlockId)>,
}

impl Unwrapper {
    /// Creates an empty reassembler.
    ///
    /// `block_size` must match the senders' block size: the expected fragment
    /// count of a block is derived from it.
    ///
    /// # Errors
    ///
    /// [`WrapError::BlockSizeTooSmall`].
    pub fn new(block_size: usize, block_timeout: Duration) -> Result<Self, WrapError> {
        Ok(Self {
            max_fragment: max_fragment_payload(block_size)?,
            block_timeout,
            blocks: HashMap::new(),
            deadlines: BTreeSet::new(),
        })
    }

    /// Feeds one datagram into the reassembler.
    ///
    /// Returns `Ok(Some(..))` when this fragment completed its block,
    /// `Ok(None)` while the block is still partial or the fragment was a
    /// duplicate.  Each fragment pushes its block's deadline out to
    /// `now + block_timeout`.
    ///
    /// # Errors
    ///
    /// Malformed datagrams are rejected without creating state (see
    /// [`WrapError::is_malformed`]).  A completed block whose checksum does
    /// not match yields [`WrapError::Checksum`] and is discarded.
    pub fn push(
        &mut self,
        datagram: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Option<Reassembled>, WrapError> {
        let (header, fragment) = FragmentHeader::parse(datagram)?;

        let total = header.total_length as usize;
        if total > MAX_BLOCK_LENGTH {
            return Err(WrapError::TooLarge(total));
        }
        let offset = header.offset as usize;
        if offset + fragment.len() > total {
            return Err(WrapError::OutOfBounds {
                offset,
                length: fragment.len(),
                total,
            });
        }

        let id = header.block_id;
        let deadline = now + self.block_timeout;
        let block = match self.blocks.entry(id) {
            Entry::Occupied(entry) => {
                let block = entry.into_mut();
                if block.total_length != header.total_length || block.checksum != header.checksum
                {
                    return Err(WrapError::Inconsistent {
                        block: block_label(&id),
                    });
                }
                self.deadlines.remove(&(block.deadline, id));
                block.deadline = deadline;
                block
            }
            Entry::Vacant(entry) => entry.insert(PendingBlock {
                checksum: header.checksum,
                total_length: header.total_length,
                expected: fragment_count(total, self.max_fragment),
                offsets: HashSet::new(),
                buffer: vec![0u8; total],
                source,
                deadline,
            }),
        };
        self.deadlines.insert((deadline, id));

        if !block.offsets.insert(header.offset) {
            trace!("duplicate fragment at offset {} of block {}", offset, block_label(&id));
            return Ok(None);
        }
        block.buffer[offset..offset + fragment.len()].copy_from_slice(fragment);

        if block.offsets.len() < block.expected {
            return Ok(None);
        }

        let Some(block) = self.blocks.remove(&id) else {
            return Ok(None);
        };
        self.deadlines.remove(&(block.deadline, id));

        let actual = signed_crc32(&block.buffer);
        if actual != block.checksum {
            return Err(WrapError::Checksum {
                block: block_label(&id),
                expected: block.checksum,
                actual,
            });
        }

        Ok(Some(Reassembled {
            payload: block.buffer,
            source: block.source,
        }))
    }

    /// Drops every block whose deadline is at or before `now`, returning one
    /// [`WrapError::Timeout`] per dropped block.
    pub fn expire(&mut self, now: Instant) -> Vec<WrapError> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(block) = self.blocks.remove(&id) {
                expired.push(WrapError::Timeout {
                    block: block_label(&id),
                    received: block.offsets.len(),
                    expected: block.expected,
                });
            }
        }
        expired
    }

    /// Earliest pending deadline, if any block is partial.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Number of partially received blocks.
    pub fn pending(&self) -> usize {
        self.blocks.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
