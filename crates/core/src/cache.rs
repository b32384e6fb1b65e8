//! Two-tier memoization for the parameter oracle's Markov matrices.
//!
//! A multi-round matrix is a pure function of `(balls, bins, capacity,
//! rounds)` and costly to compute, so results are kept in a bounded
//! in-memory LRU and, optionally, persisted to a cache directory with
//! one file per key.
//!
//! # Disk Format
//!
//! ```text
//! +------------------+
//! | Magic (4 bytes)  |  0x50 0x42 0x53 0x4D ("PBSM")
//! +------------------+
//! | rows (4)         |  u32 little-endian
//! +------------------+
//! | cols (4)         |  u32 little-endian
//! +------------------+
//! | cells            |  rows * cols IEEE-754 f64, little-endian,
//! | (variable)       |  row-major
//! +------------------+
//! | crc32 (4)        |  over rows, cols and cells
//! +------------------+
//! ```
//!
//! Readers treat anything unexpected (truncation, bad magic or CRC, a
//! shape that disagrees with the key) as a cache miss and recompute.
//! Writers simply overwrite; last writer wins, and since the value is a
//! pure function of the key, concurrent writers write identical bytes.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::params::Matrix;

/// Cache key: `(balls, bins, capacity, rounds)`.
pub type MatrixKey = (usize, usize, usize, usize);

/// Default in-memory capacity (entries).
pub const DEFAULT_MEM_CAPACITY: usize = 1024;

const MAGIC: [u8; 4] = *b"PBSM";
const HEADER_SIZE: usize = 12;

/// Bounded memory cache with an optional disk tier.
#[derive(Debug)]
pub struct MatrixCache {
    mem: Mutex<LruCache<MatrixKey, Arc<Matrix>>>,
    disk_dir: Option<PathBuf>,
}

impl Default for MatrixCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MatrixCache {
    /// Memory-only cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEM_CAPACITY)
    }

    /// Memory-only cache with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mem: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1"),
            )),
            disk_dir: None,
        }
    }

    /// Cache with a disk tier rooted at `dir` (created if missing).
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut cache = Self::new();
        cache.disk_dir = Some(dir);
        Ok(cache)
    }

    /// Location of the disk tier, if any.
    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk_dir.as_deref()
    }

    /// Fetch the matrix for `key`, computing and storing it on miss.
    pub(crate) fn get_or_insert_with(
        &self,
        key: MatrixKey,
        compute: impl FnOnce() -> Matrix,
    ) -> Arc<Matrix> {
        if let Some(hit) = self.mem.lock().get(&key) {
            return Arc::clone(hit);
        }

        if let Some(dir) = &self.disk_dir {
            if let Some(loaded) = load_file(&file_path(dir, key), key) {
                debug!(?key, "matrix cache: disk hit");
                let loaded = Arc::new(loaded);
                self.mem.lock().put(key, Arc::clone(&loaded));
                return loaded;
            }
        }

        debug!(?key, "matrix cache: miss, computing");
        let value = Arc::new(compute());
        if let Some(dir) = &self.disk_dir {
            let path = file_path(dir, key);
            if let Err(e) = std::fs::write(&path, encode(&value)) {
                warn!(?key, error = %e, "matrix cache: disk write failed");
            }
        }
        self.mem.lock().put(key, Arc::clone(&value));
        value
    }
}

fn file_path(dir: &Path, (balls, bins, capacity, rounds): MatrixKey) -> PathBuf {
    dir.join(format!("mr_m2d_{balls}_{bins}_{capacity}_{rounds}.bin"))
}

fn encode(matrix: &Matrix) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + matrix.data().len() * 8 + 4);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(matrix.rows() as u32).to_le_bytes());
    out.extend_from_slice(&(matrix.cols() as u32).to_le_bytes());
    for &v in matrix.data() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out[4..]);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out
}

/// Load and validate one cache file; any defect reads as a miss.
fn load_file(path: &Path, (balls, _bins, _capacity, rounds): MatrixKey) -> Option<Matrix> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < HEADER_SIZE + 4 || bytes[0..4] != MAGIC {
        warn!(path = %path.display(), "matrix cache: malformed file, recomputing");
        return None;
    }

    let body = &bytes[..bytes.len() - 4];
    let stored_crc = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body[4..]);
    if hasher.finalize() != stored_crc {
        warn!(path = %path.display(), "matrix cache: checksum mismatch, recomputing");
        return None;
    }

    let rows = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
    let cols = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
    let cells = &body[HEADER_SIZE..];
    if cells.len() != rows * cols * 8 {
        warn!(path = %path.display(), "matrix cache: truncated payload, recomputing");
        return None;
    }
    // The matrix shape is implied by the key; a file claiming anything
    // else was written for different code and cannot be trusted.
    if rows != balls + 1 || cols != rounds + 1 {
        warn!(
            path = %path.display(),
            rows, cols,
            "matrix cache: shape disagrees with key, recomputing"
        );
        return None;
    }

    let data = cells
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Matrix::from_parts(rows, cols, data)
}
