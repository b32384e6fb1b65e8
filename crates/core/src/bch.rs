//! BCH syndrome sketches over `GF(2^m)`.
//!
//! A sketch is a fixed-size summary of a set of nonzero field elements:
//! the `t` odd power sums `s_k = sum(x^(2k+1))`. Two properties make it
//! useful for reconciliation:
//!
//! - adding the same element twice cancels, so a sketch summarizes the
//!   elements present an odd number of times
//! - XOR-merging two sketches yields the sketch of their symmetric
//!   difference, which `decode` can recover exactly when it contains at
//!   most `t` elements
//!
//! Decoding runs the classic syndrome pipeline: reconstruct the even
//! power sums by squaring, Berlekamp–Massey for the error locator
//! polynomial, then an exhaustive root search over the field. Failure
//! (more than `t` differences, or an inconsistent locator) is reported
//! as `None`; it is an expected outcome, not an error.
//!
//! The element `0` must never be added: it is a fixed point of every
//! power map and contributes nothing to any syndrome.

use crate::bitio::{BitReader, BitWriter};
use crate::error::{CodecError, Result};
use crate::field::{Field, MAX_FIELD_SZ, MIN_FIELD_SZ};

/// A BCH syndrome sketch with field width `m` and capacity `t`.
///
/// Serialized form is exactly `m * t` bits: the `t` odd syndromes,
/// `m` bits each, LSB-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BchSketch {
    m: u32,
    capacity: usize,
    syndromes: Vec<u64>,
}

impl BchSketch {
    /// Create an empty sketch for field width `m` (3..=14) and capacity
    /// `t` in `[1, 2^m - 2]`.
    pub fn create(m: u32, capacity: usize) -> Result<Self> {
        if !(MIN_FIELD_SZ..=MAX_FIELD_SZ).contains(&m) {
            return Err(CodecError::UnsupportedField { m }.into());
        }
        let order = (1usize << m) - 1;
        if capacity == 0 || capacity >= order {
            return Err(CodecError::InvalidCapacity { t: capacity, order }.into());
        }
        Ok(Self {
            m,
            capacity,
            syndromes: vec![0; capacity],
        })
    }

    /// Field width `m`.
    pub fn field_sz(&self) -> u32 {
        self.m
    }

    /// Decoding capacity `t`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Serialized size in bytes for a `(m, t)` sketch.
    pub fn serialized_size(m: u32, capacity: usize) -> usize {
        (m as usize * capacity + 7) / 8
    }

    /// Whether no element (or every element an even number of times) has
    /// been added.
    pub fn is_empty(&self) -> bool {
        self.syndromes.iter().all(|&s| s == 0)
    }

    /// Add a value in `[1, 2^m - 1]`. Adding a value twice removes it.
    pub fn add(&mut self, value: u64) {
        let f = self.field();
        debug_assert!(
            value >= 1 && value <= f.order() as u64,
            "sketch value {value} outside [1, {}]",
            f.order()
        );
        // pw walks the odd powers: value, value^3, value^5, ...
        let sq = f.sqr(value);
        let mut pw = value;
        for s in self.syndromes.iter_mut() {
            *s ^= pw;
            pw = f.mul(pw, sq);
        }
    }

    /// Serialize into `m * t` bits, zero-padded to the next byte.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        for &s in &self.syndromes {
            w.write_bits(s, self.m as usize);
        }
        w.finish()
    }

    /// Rebuild a sketch from its serialized form.
    pub fn deserialize(m: u32, capacity: usize, buf: &[u8]) -> Result<Self> {
        let mut sketch = Self::create(m, capacity)?;
        let required = Self::serialized_size(m, capacity);
        if buf.len() < required {
            return Err(CodecError::BufferTooShort {
                required,
                actual: buf.len(),
            }
            .into());
        }
        let mut r = BitReader::new(buf);
        for s in sketch.syndromes.iter_mut() {
            *s = r.read_bits(m as usize);
        }
        Ok(sketch)
    }

    /// Merge another sketch into this one, producing the sketch of the
    /// symmetric difference of the two underlying sets.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if self.m != other.m || self.capacity != other.capacity {
            return Err(CodecError::SketchMismatch {
                m_a: self.m,
                t_a: self.capacity,
                m_b: other.m,
                t_b: other.capacity,
            }
            .into());
        }
        for (s, o) in self.syndromes.iter_mut().zip(&other.syndromes) {
            *s ^= o;
        }
        Ok(())
    }

    /// Decode the set summarized by this sketch.
    ///
    /// Returns the decoded values (at most `t`, in unspecified order), or
    /// `None` when the sketch holds more than `t` values or the locator
    /// polynomial is inconsistent. A successful return can still be wrong
    /// when the true set exceeded `t`; callers verify independently.
    pub fn decode(&self) -> Option<Vec<u64>> {
        if self.is_empty() {
            return Some(Vec::new());
        }
        let f = self.field();
        let t = self.capacity;

        // Full syndrome sequence s[1..=2t]; even entries come for free in
        // characteristic 2: s_{2k} = s_k^2.
        let mut s = vec![0u64; 2 * t + 1];
        for k in 0..t {
            s[2 * k + 1] = self.syndromes[k];
        }
        for i in 1..=t {
            s[2 * i] = f.sqr(s[i]);
        }

        let locator = berlekamp_massey(f, &s, t)?;
        find_roots(f, &locator)
    }

    fn field(&self) -> &'static Field {
        // Width was validated at construction
        Field::get(self.m).expect("validated field width")
    }
}

/// Berlekamp–Massey over `GF(2^m)`: smallest LFSR generating `s[1..=2t]`.
///
/// Returns the locator polynomial coefficients `c[0..=l]` (with
/// `c[0] = 1`), or `None` when the minimal LFSR is longer than `t` or its
/// length disagrees with the polynomial degree.
fn berlekamp_massey(f: &Field, s: &[u64], t: usize) -> Option<Vec<u64>> {
    let nsyn = 2 * t;
    let mut c = vec![0u64; nsyn + 1];
    let mut b = vec![0u64; nsyn + 1];
    c[0] = 1;
    b[0] = 1;
    let mut l = 0usize;
    let mut shift = 1usize;
    let mut last_d = 1u64;

    for i in 0..nsyn {
        let mut d = s[i + 1];
        for j in 1..=l {
            d ^= f.mul(c[j], s[i + 1 - j]);
        }
        if d == 0 {
            shift += 1;
        } else {
            let coef = f.mul(d, f.inv(last_d));
            if 2 * l <= i {
                let prev = c.clone();
                for j in 0..=(nsyn - shift) {
                    c[j + shift] ^= f.mul(coef, b[j]);
                }
                l = i + 1 - l;
                b = prev;
                last_d = d;
                shift = 1;
            } else {
                for j in 0..=(nsyn - shift) {
                    c[j + shift] ^= f.mul(coef, b[j]);
                }
                shift += 1;
            }
        }
    }

    if l > t {
        return None;
    }
    // The locator degree must match the LFSR length, else the syndrome
    // sequence is inconsistent with any set of at most t elements.
    let degree = c.iter().rposition(|&x| x != 0).unwrap_or(0);
    if degree != l {
        return None;
    }
    c.truncate(l + 1);
    Some(c)
}

/// Exhaustive root search: the decoded values are the inverses of the
/// locator roots. Returns `None` unless the number of distinct roots
/// equals the locator degree.
fn find_roots(f: &Field, locator: &[u64]) -> Option<Vec<u64>> {
    let degree = locator.len() - 1;
    let mut out = Vec::with_capacity(degree);
    for v in 1..=f.order() as u64 {
        // Horner evaluation of the locator at v
        let mut acc = 0u64;
        for &coef in locator.iter().rev() {
            acc = f.mul(acc, v) ^ coef;
        }
        if acc == 0 {
            out.push(f.inv(v));
            if out.len() > degree {
                return None;
            }
        }
    }
    if out.len() != degree {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<u64>) -> Vec<u64> {
        v.sort_unstable();
        v
    }

    #[test]
    fn test_create_validates_parameters() {
        assert!(BchSketch::create(2, 1).is_err());
        assert!(BchSketch::create(15, 1).is_err());
        assert!(BchSketch::create(6, 0).is_err());
        assert!(BchSketch::create(6, 63).is_err());
        assert!(BchSketch::create(6, 62).is_ok());
    }

    #[test]
    fn test_empty_decodes_to_nothing() {
        let sk = BchSketch::create(6, 4).unwrap();
        assert!(sk.is_empty());
        assert_eq!(sk.decode().unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_double_add_cancels() {
        let mut sk = BchSketch::create(6, 4).unwrap();
        sk.add(17);
        sk.add(17);
        assert!(sk.is_empty());
    }

    #[test]
    fn test_decode_recovers_added_set() {
        let mut sk = BchSketch::create(6, 4).unwrap();
        for v in [3u64, 17, 40] {
            sk.add(v);
        }
        assert_eq!(sorted(sk.decode().unwrap()), vec![3, 17, 40]);
    }

    #[test]
    fn test_decode_at_full_capacity() {
        let mut sk = BchSketch::create(8, 5).unwrap();
        let vals = [1u64, 42, 100, 200, 254];
        for v in vals {
            sk.add(v);
        }
        assert_eq!(sorted(sk.decode().unwrap()), vals.to_vec());
    }

    #[test]
    fn test_merge_decodes_symmetric_difference() {
        let mut a = BchSketch::create(7, 6).unwrap();
        let mut b = BchSketch::create(7, 6).unwrap();
        for v in [5u64, 9, 33, 77] {
            a.add(v);
        }
        for v in [9u64, 33, 101] {
            b.add(v);
        }
        a.merge(&b).unwrap();
        assert_eq!(sorted(a.decode().unwrap()), vec![5, 77, 101]);
    }

    #[test]
    fn test_overload_yields_phantom_not_truth() {
        // Two values at capacity one: the syndromes collapse to those of
        // the single value a ^ b, which decode dutifully reports. The
        // reconciler's hash checks exist to catch exactly this.
        let mut sk = BchSketch::create(6, 1).unwrap();
        sk.add(5);
        sk.add(9);
        assert_eq!(sk.decode().unwrap(), vec![5 ^ 9]);
    }

    #[test]
    fn test_serialize_roundtrip_byte_aligned() {
        let mut sk = BchSketch::create(8, 4).unwrap();
        sk.add(200);
        sk.add(13);
        let buf = sk.serialize();
        assert_eq!(buf.len(), BchSketch::serialized_size(8, 4));
        let back = BchSketch::deserialize(8, 4, &buf).unwrap();
        assert_eq!(back, sk);
    }

    #[test]
    fn test_serialize_roundtrip_unaligned() {
        // 11 * 3 = 33 bits -> 5 bytes with 7 padding bits
        let mut sk = BchSketch::create(11, 3).unwrap();
        sk.add(1234);
        sk.add(2000);
        sk.add(7);
        let buf = sk.serialize();
        assert_eq!(buf.len(), 5);
        let back = BchSketch::deserialize(11, 3, &buf).unwrap();
        assert_eq!(back, sk);
        assert_eq!(sorted(back.decode().unwrap()), vec![7, 1234, 2000]);
    }

    #[test]
    fn test_deserialize_short_buffer() {
        let err = BchSketch::deserialize(8, 4, &[0u8; 3]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Codec(CodecError::BufferTooShort { required: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_merge_mismatch() {
        let mut a = BchSketch::create(6, 4).unwrap();
        let b = BchSketch::create(6, 5).unwrap();
        assert!(matches!(
            a.merge(&b),
            Err(crate::Error::Codec(CodecError::SketchMismatch { .. }))
        ));
        let c = BchSketch::create(7, 4).unwrap();
        assert!(a.merge(&c).is_err());
    }

    #[test]
    fn test_large_field() {
        let mut a = BchSketch::create(14, 8).unwrap();
        let mut b = BchSketch::create(14, 8).unwrap();
        for v in [1u64, 16382, 9000, 12345] {
            a.add(v);
        }
        for v in [9000u64, 12345, 555] {
            b.add(v);
        }
        a.merge(&b).unwrap();
        assert_eq!(sorted(a.decode().unwrap()), vec![1, 555, 16382]);
    }
}
