//! Typed results produced by the response parser.
//!
//! Retrieval and line results reference the receive buffers in place via
//! `TokenData`; materializing accessors copy on demand. Results are plain
//! owned values: they stay valid after the client recycles its buffers.

use crate::io::TokenData;
use bytes::Bytes;

/// One `VALUE <key> <flags> <bytes>[ <cas>]` reply.
///
/// Valid only once the whole payload arrived (`is_complete`); the pool drops
/// incomplete trailing values at collection time.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub key: TokenData,
    pub data_block: TokenData,
    pub flags: u32,
    pub cas_unique: u64,
    /// Declared payload length.
    pub bytes: u32,
    /// Payload bytes not yet consumed, plus one for the pending header LF.
    pub(crate) bytes_remain: u32,
}

impl RetrievalResult {
    pub(crate) fn new() -> Self {
        Self {
            bytes_remain: 1, // the header LF is still outstanding
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_remain == 0
    }

    pub fn key_len(&self) -> usize {
        self.key.len()
    }

    /// The key, materialized.
    pub fn key_bytes(&self) -> Bytes {
        self.key.to_bytes()
    }

    /// The payload, materialized.
    pub fn value_bytes(&self) -> Bytes {
        self.data_block.to_bytes()
    }
}

/// Reply kinds for storage, deletion, and touch commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Exists,
    Ok,
    Stored,
    NotStored,
    NotFound,
    Deleted,
    Touched,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Exists => "EXISTS",
            MessageKind::Ok => "OK",
            MessageKind::Stored => "STORED",
            MessageKind::NotStored => "NOT_STORED",
            MessageKind::NotFound => "NOT_FOUND",
            MessageKind::Deleted => "DELETED",
            MessageKind::Touched => "TOUCHED",
        }
    }
}

/// A one-line reply matched back to the key that requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult {
    pub kind: MessageKind,
    pub key: Bytes,
}

/// One raw line from a STAT or VERSION response.
#[derive(Debug, Clone, Default)]
pub struct LineResult {
    pub line: TokenData,
    pub line_len: usize,
}

impl LineResult {
    /// The line with its terminating CR stripped.
    pub fn text(&self) -> Bytes {
        let bytes = self.line.to_bytes();
        match bytes.last() {
            Some(b'\r') => bytes.slice(..bytes.len() - 1),
            _ => bytes,
        }
    }
}

/// Numeric reply to incr/decr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedResult {
    pub key: Bytes,
    pub value: u64,
}

/// Per-server outcome of a broadcast command (version, stats, flush_all).
///
/// Allocated for every server regardless of liveness; a server that did not
/// answer contributes empty lines and no message kind.
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    pub host: String,
    pub lines: Vec<Bytes>,
    /// For flush_all: the single reply kind, when exactly one arrived.
    pub msg_kind: Option<MessageKind>,
}
