//! Wire messages for the PBS protocol.
//!
//! Three message types travel between peers, all byte-aligned at the
//! outer boundary but bit-packed inside, with no framing header (the
//! transport provides lengths):
//!
//! # Encoding Message
//!
//! ```text
//! +--------------------------+
//! | sketch 0 (m*t bits)      |  BCH sketch of group 0
//! +--------------------------+
//! | sketch 1 (m*t bits)      |  bit-concatenated, no alignment
//! +--------------------------+
//! | ...                      |
//! +--------------------------+
//! | zero padding to byte     |
//! +--------------------------+
//! ```
//!
//! Serialized size: `ceil(m*t*g / 8)` bytes. The parameters `(m, t, g)`
//! are not carried; both peers derive them from the shared configuration.
//!
//! # Decoding Message
//!
//! ```text
//! +--------------------------+
//! | count 0 (w_d bits)       |  w_d = ceil(log2(t + 2))
//! | ...                      |  all-ones value = BCH decoding failed
//! | count g-1 (w_d bits)     |
//! +--------------------------+
//! | bin index (m bits)       |  sum(count_i) indices, group order
//! | ...                      |
//! +--------------------------+
//! ```
//!
//! # Encoding-Hint Message
//!
//! A list of group indices (previous round numbering) where checksum
//! verification failed, each `max(1, ceil(log2(prev_group_count)))` bits.
//! Indices are strictly ascending; parsing stops at the first
//! non-ascending value, which is how zero padding is rejected.
//!
//! All messages satisfy `parse(write(x)) == x` and `write(x).len() ==
//! serialized_size(x)`.

use crate::bch::BchSketch;
use crate::bitio::{BitReader, BitWriter};
use crate::error::{CodecError, ProtocolError, Result};

/// Number of bits needed to distinguish `x` values (0 for `x <= 1`).
fn ceil_log2(x: u64) -> usize {
    if x <= 1 {
        0
    } else {
        (64 - (x - 1).leading_zeros()) as usize
    }
}

/// Wire message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PbsMessageType {
    Encoding = 1,
    Decoding = 2,
    EncodingHint = 3,
}

/// Any PBS wire message.
///
/// The three messages share nothing beyond a tag, so this is a plain
/// tagged variant; all behavior lives on the concrete types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbsMessage {
    Encoding(EncodingMessage),
    Decoding(DecodingMessage),
    EncodingHint(EncodingHintMessage),
}

impl PbsMessage {
    /// The message discriminant.
    pub fn message_type(&self) -> PbsMessageType {
        match self {
            PbsMessage::Encoding(_) => PbsMessageType::Encoding,
            PbsMessage::Decoding(_) => PbsMessageType::Decoding,
            PbsMessage::EncodingHint(_) => PbsMessageType::EncodingHint,
        }
    }

    /// Serialize the payload.
    pub fn write(&self) -> Vec<u8> {
        match self {
            PbsMessage::Encoding(m) => m.write(),
            PbsMessage::Decoding(m) => m.write(),
            PbsMessage::EncodingHint(m) => m.write(),
        }
    }

    /// Exact payload size in bytes.
    pub fn serialized_size(&self) -> usize {
        match self {
            PbsMessage::Encoding(m) => m.serialized_size(),
            PbsMessage::Decoding(m) => m.serialized_size(),
            PbsMessage::EncodingHint(m) => m.serialized_size(),
        }
    }
}

/// A collection of per-group BCH sketches: one peer's parity view of
/// every group in the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingMessage {
    /// Field width `m`
    pub field_sz: u32,
    /// Sketch capacity `t`
    pub capacity: usize,
    /// One sketch per group, in group order
    pub sketches: Vec<BchSketch>,
}

impl EncodingMessage {
    /// Create a message of `num_groups` empty sketches.
    pub fn new(field_sz: u32, capacity: usize, num_groups: usize) -> Result<Self> {
        let sketches = (0..num_groups)
            .map(|_| BchSketch::create(field_sz, capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            field_sz,
            capacity,
            sketches,
        })
    }

    /// Wrap already-built sketches.
    pub fn with_sketches(field_sz: u32, capacity: usize, sketches: Vec<BchSketch>) -> Self {
        debug_assert!(sketches
            .iter()
            .all(|s| s.field_sz() == field_sz && s.capacity() == capacity));
        Self {
            field_sz,
            capacity,
            sketches,
        }
    }

    /// Number of groups carried.
    pub fn num_groups(&self) -> usize {
        self.sketches.len()
    }

    /// Exact serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        (self.field_sz as usize * self.capacity * self.sketches.len() + 7) / 8
    }

    /// Serialize: sketches bit-concatenated, zero-padded to a byte.
    pub fn write(&self) -> Vec<u8> {
        let sketch_bits = self.field_sz as usize * self.capacity;
        let mut w = BitWriter::new();
        for sketch in &self.sketches {
            let bytes = sketch.serialize();
            let mut remaining = sketch_bits;
            for &byte in &bytes {
                let take = remaining.min(8);
                w.write_bits(byte as u64, take);
                remaining -= take;
            }
        }
        w.finish()
    }

    /// Parse `num_groups` sketches of the given parameters.
    pub fn parse(field_sz: u32, capacity: usize, num_groups: usize, buf: &[u8]) -> Result<Self> {
        let sketch_bits = field_sz as usize * capacity;
        let required = (sketch_bits * num_groups + 7) / 8;
        if buf.len() < required {
            return Err(CodecError::BufferTooShort {
                required,
                actual: buf.len(),
            }
            .into());
        }

        let mut r = BitReader::new(buf);
        let sketch_bytes = BchSketch::serialized_size(field_sz, capacity);
        let mut sketches = Vec::with_capacity(num_groups);
        for _ in 0..num_groups {
            let mut bytes = Vec::with_capacity(sketch_bytes);
            let mut remaining = sketch_bits;
            while remaining > 0 {
                let take = remaining.min(8);
                bytes.push(r.read_bits(take) as u8);
                remaining -= take;
            }
            sketches.push(BchSketch::deserialize(field_sz, capacity, &bytes)?);
        }
        Ok(Self {
            field_sz,
            capacity,
            sketches,
        })
    }
}

/// Per-group BCH decode outcomes plus the decoded bin indices of every
/// successful group.
///
/// Counts and indices are stored separately (not interleaved) so the
/// indices pack back-to-back at a fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodingMessage {
    /// Field width `m`
    pub field_sz: u32,
    /// Sketch capacity `t`
    pub capacity: usize,
    /// Decode outcome per group: `Some(p)` differences, `None` = failed
    pub num_differences: Vec<Option<u32>>,
    /// Bin indices of all successful groups, concatenated in group order
    pub differences: Vec<u64>,
}

impl DecodingMessage {
    /// Assemble from decode outcomes.
    pub fn new(
        field_sz: u32,
        capacity: usize,
        num_differences: Vec<Option<u32>>,
        differences: Vec<u64>,
    ) -> Self {
        debug_assert_eq!(
            num_differences
                .iter()
                .map(|p| p.unwrap_or(0) as usize)
                .sum::<usize>(),
            differences.len()
        );
        Self {
            field_sz,
            capacity,
            num_differences,
            differences,
        }
    }

    /// Number of groups covered.
    pub fn num_groups(&self) -> usize {
        self.num_differences.len()
    }

    /// Width of each per-group count field: `ceil(log2(t + 2))`, enough
    /// for `0..=t` plus the failure sentinel.
    pub fn count_width(&self) -> usize {
        ceil_log2(self.capacity as u64 + 2)
    }

    fn failure_flag(width: usize) -> u64 {
        (1u64 << width) - 1
    }

    /// Exact serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        let bits = self.count_width() * self.num_differences.len()
            + self.field_sz as usize * self.differences.len();
        (bits + 7) / 8
    }

    /// Serialize: counts first, then bin indices.
    pub fn write(&self) -> Vec<u8> {
        let width = self.count_width();
        let flag = Self::failure_flag(width);
        let mut w = BitWriter::new();
        for p in &self.num_differences {
            w.write_bits(p.map_or(flag, u64::from), width);
        }
        for &bin in &self.differences {
            w.write_bits(bin, self.field_sz as usize);
        }
        w.finish()
    }

    /// Parse outcomes for `num_groups` groups.
    pub fn parse(field_sz: u32, capacity: usize, num_groups: usize, buf: &[u8]) -> Result<Self> {
        let width = ceil_log2(capacity as u64 + 2);
        let flag = Self::failure_flag(width);
        let mut r = BitReader::new(buf);

        let mut num_differences = Vec::with_capacity(num_groups);
        let mut total = 0usize;
        for _ in 0..num_groups {
            let raw = r.read_bits(width);
            if raw == flag {
                num_differences.push(None);
            } else {
                if raw > capacity as u64 {
                    return Err(CodecError::InvalidCount {
                        count: raw as u32,
                        capacity,
                    }
                    .into());
                }
                total += raw as usize;
                num_differences.push(Some(raw as u32));
            }
        }

        let required = (width * num_groups + field_sz as usize * total + 7) / 8;
        if buf.len() < required {
            return Err(CodecError::BufferTooShort {
                required,
                actual: buf.len(),
            }
            .into());
        }

        // Bin 0 is reserved and the block length 2^m - 1 is not a bin, so
        // anything outside [1, 2^m - 2] is malformed.
        let max_bin = (1u64 << field_sz) - 2;
        let mut differences = Vec::with_capacity(total);
        for _ in 0..total {
            let bin = r.read_bits(field_sz as usize);
            if bin == 0 || bin > max_bin {
                return Err(CodecError::InvalidBinIndex {
                    bin,
                    max: max_bin as usize,
                }
                .into());
            }
            differences.push(bin);
        }

        Ok(Self {
            field_sz,
            capacity,
            num_differences,
            differences,
        })
    }
}

/// Group indices (previous round numbering) where the Initiator's
/// checksum verification failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingHintMessage {
    /// Group count of the round the indices refer to (sets the width)
    pub prev_group_count: usize,
    /// Strictly ascending group indices
    pub groups: Vec<u32>,
}

impl EncodingHintMessage {
    /// Assemble a hint for the given indices.
    pub fn new(prev_group_count: usize, groups: Vec<u32>) -> Self {
        debug_assert!(groups.windows(2).all(|w| w[0] < w[1]));
        Self {
            prev_group_count,
            groups,
        }
    }

    /// Bits per index.
    pub fn index_width(&self) -> usize {
        Self::width_for(self.prev_group_count)
    }

    fn width_for(prev_group_count: usize) -> usize {
        ceil_log2(prev_group_count as u64).max(1)
    }

    /// Exact serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        (self.index_width() * self.groups.len() + 7) / 8
    }

    /// Serialize the index list.
    pub fn write(&self) -> Vec<u8> {
        let width = self.index_width();
        let mut w = BitWriter::new();
        for &gid in &self.groups {
            w.write_bits(gid as u64, width);
        }
        w.finish()
    }

    /// Parse against the previous round's group count.
    ///
    /// The strictly-ascending prefix of the decoded values is kept;
    /// trailing padding decodes as zeros and is dropped by that rule.
    /// An index at or beyond `prev_group_count` is a protocol violation.
    pub fn parse(prev_group_count: usize, buf: &[u8]) -> Result<Self> {
        let width = Self::width_for(prev_group_count);
        let mut r = BitReader::new(buf);
        let max_count = buf.len() * 8 / width;

        let mut groups: Vec<u32> = Vec::new();
        for _ in 0..max_count {
            let v = r.read_bits(width);
            if let Some(&last) = groups.last() {
                if v <= last as u64 {
                    break;
                }
            }
            if v >= prev_group_count as u64 {
                return Err(ProtocolError::HintIndexOutOfRange {
                    index: v as u32,
                    groups: prev_group_count,
                }
                .into());
            }
            groups.push(v as u32);
        }

        Ok(Self {
            prev_group_count,
            groups,
        })
    }
}
