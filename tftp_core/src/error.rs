//! Error types shared across the crate.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::transfer::protocol::{ErrorCode, Opcode};

/// Packet encode/decode failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet truncated ({len} bytes)")]
    Truncated { len: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("{0} field is not NUL-terminated")]
    MissingTerminator(&'static str),
    #[error("{0} field is not valid ASCII text")]
    InvalidText(&'static str),
    #[error("data payload of {0} bytes exceeds 512")]
    PayloadTooLarge(usize),
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("text field contains an embedded NUL")]
    EmbeddedNul,
    #[error("{0} is not a request opcode")]
    NotARequest(Opcode),
}

/// UDP socket failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no free ephemeral port after {tries} attempts")]
    EphemeralExhausted { tries: usize },
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },
    #[error("receive timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// File store access decisions and faults
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("file '{0}' not found")]
    NotFound(String),
    #[error("file '{0}' already exists")]
    AlreadyExists(String),
    #[error("access to '{name}' denied: {reason}")]
    Violation { name: String, reason: &'static str },
    #[error("access table invariant violated for '{name}': {detail}")]
    Invariant { name: String, detail: &'static str },
    #[error("I/O error on '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl AccessError {
    /// Error code reported to the peer for this decision
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::FileNotFound,
            Self::AlreadyExists(_) => ErrorCode::FileAlreadyExists,
            Self::Violation { .. } => ErrorCode::AccessViolation,
            Self::Invariant { .. } | Self::Io { .. } => ErrorCode::NotDefined,
        }
    }
}

/// Compression and decompression failures
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("not a compressed file (bad magic)")]
    BadMagic,
    #[error("compressed data is truncated")]
    Truncated,
    #[error("corrupt code table")]
    InvalidCodeTable,
    #[error("bitstream does not decode to a known symbol")]
    InvalidBitstream,
    #[error("'{0}' does not carry the compressed-file suffix")]
    UnexpectedName(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a transfer session did not complete
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer reported error: {code}: {message}")]
    Peer { code: ErrorCode, message: String },
    #[error("no valid response after {0} attempts")]
    RetriesExhausted(u32),
    #[error("request rejected locally: {0}")]
    Access(#[from] AccessError),
    #[error("local file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("unexpected {0} from peer")]
    Unexpected(Opcode),
}
