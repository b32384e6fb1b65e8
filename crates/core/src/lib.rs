//! pbs-core: Parity Bitmap Sketch set reconciliation
//!
//! This library reconciles two remote multisets of 64-bit keys so that
//! both endpoints end up holding the union, transmitting data roughly
//! proportional to the size of the symmetric difference rather than to
//! the set sizes. It is a building block for mempool synchronization,
//! replica repair, and change-set exchange.
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries, leaves first:
//! - `bitio`: LSB-first bit-packed reading/writing
//! - `field`: `GF(2^m)` arithmetic tables
//! - `bch`: BCH syndrome sketches (create/add/serialize/merge/decode)
//! - `params`: near-optimal `(m, t)` search over a balls-into-bins
//!   Markov chain
//! - `cache`: memory + disk memoization of the chain matrices
//! - `messages`: the bit-packed Encoding / Decoding / Encoding-Hint
//!   wire messages
//! - `reconciler`: the multi-round protocol state machine
//!
//! # Design Principles
//!
//! - **No panics**: errors are structured; algorithmic failures (BCH
//!   overload, checksum exceptions) are recovered by the protocol itself
//! - **Deterministic**: all hashing is seeded; two instances configured
//!   alike behave bit-identically
//! - **Transport-agnostic**: messages are plain byte buffers; the caller
//!   owns delivery, ordering and round limits

pub mod bch;
pub mod bitio;
pub mod cache;
pub mod error;
mod field;
pub mod messages;
pub mod params;
pub mod reconciler;

// Re-export commonly used types
pub use bch::BchSketch;
pub use cache::{MatrixCache, MatrixKey};
pub use error::{CodecError, Error, ProtocolError, Result};
pub use messages::{
    DecodingMessage, EncodingHintMessage, EncodingMessage, PbsMessage, PbsMessageType,
};
pub use params::{BchParams, ParamOracle};
pub use reconciler::{
    PbsConfig, Reconciler, Role, BIN_SEED_OFFSET, DEFAULT_SEED, SPLIT_SEED_OFFSET,
};
