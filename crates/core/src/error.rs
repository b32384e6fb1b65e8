//! Error types for the reconciliation library.
//!
//! All operations return structured errors rather than panicking.
//! Transient algorithmic events, such as a BCH decode failure or a checksum
//! mismatch, are *not* errors: the protocol recovers from them locally
//! (group splitting and cloning) and they never surface here.
//!
//! What does surface:
//! - Codec: a wire message cannot be parsed (truncated buffer, malformed
//!   field, incompatible sketch parameters)
//! - Protocol: a peer message or an API call violates the protocol state
//!   machine (wrong role, group-count mismatch, short side arrays)
//! - I/O: the matrix cache directory cannot be created

use thiserror::Error;

use crate::reconciler::Role;

/// Top-level error type for all operations in the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire message could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol invariant violated by a peer message or an API call
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration rejected at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// File system error (matrix cache directory)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message and sketch codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer is too small for the message it claims to hold
    #[error("buffer too short: need at least {required} bytes, got {actual}")]
    BufferTooShort { required: usize, actual: usize },

    /// Field width outside the supported range
    #[error("unsupported field width m={m} (supported: 3..=14)")]
    UnsupportedField { m: u32 },

    /// Sketch capacity outside the valid range for the field
    #[error("invalid capacity t={t} for field of order {order}")]
    InvalidCapacity { t: usize, order: usize },

    /// Two sketches with different parameters cannot be merged
    #[error("sketch parameter mismatch: ({m_a},{t_a}) vs ({m_b},{t_b})")]
    SketchMismatch {
        m_a: u32,
        t_a: usize,
        m_b: u32,
        t_b: usize,
    },

    /// Per-group difference count exceeds the sketch capacity
    #[error("decoded difference count {count} exceeds capacity {capacity}")]
    InvalidCount { count: u32, capacity: usize },

    /// Decoded bin index outside the valid range [1, n-1]
    #[error("bin index {bin} outside valid range [1, {max}]")]
    InvalidBinIndex { bin: u64, max: usize },
}

/// Protocol state machine violations. These are fatal for the instance.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Operation reserved for the other role
    #[error("{operation} is not permitted for role {role:?}")]
    WrongRole {
        role: Role,
        operation: &'static str,
    },

    /// `decode`/`decode_check` called without a preceding `encode`
    #[error("operation requires a preceding encode for the current round")]
    EncodeRequired,

    /// `encode` called again before the round's decode step consumed it
    #[error("encode called twice in the same round")]
    AlreadyEncoded,

    /// Peer message carries a different group count than local state
    #[error("group count mismatch: local {local}, message {message}")]
    GroupCountMismatch { local: usize, message: usize },

    /// Peer message was built with different BCH parameters
    #[error("BCH parameter mismatch: local ({m},{t}), message ({msg_m},{msg_t})")]
    ParameterMismatch {
        m: u32,
        t: usize,
        msg_m: u32,
        msg_t: usize,
    },

    /// Encoding hint references a group outside the previous round
    #[error("hint index {index} out of range (previous round had {groups} groups)")]
    HintIndexOutOfRange { index: u32, groups: usize },

    /// Side arrays shorter than the decoding message requires
    #[error("{kind} length mismatch: need {required}, got {actual}")]
    LengthMismatch {
        kind: &'static str,
        required: usize,
        actual: usize,
    },
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
