//! The PBS reconciler: a multi-round state machine that recovers the
//! symmetric difference between two remote key multisets.
//!
//! # Protocol Shape
//!
//! Keys are partitioned into groups by a seeded hash; within a group and
//! round, every key hashes to a bin in `[1, n-1]` (`n = 2^m - 1`, bin 0
//! reserved). Each group's bin-parity bitmap is compressed into a BCH
//! sketch. Merging one peer's sketch with the other's decodes the bins
//! whose parity differs, and XORing the two peers' per-bin key XORs
//! yields candidate difference keys, verified against their own hashes
//! and a per-group checksum.
//!
//! Two recovery paths keep the protocol total:
//! - BCH decode failure (too many differing bins): both sides split the
//!   group's keys over fresh subgroups with an independent hash
//! - checksum mismatch (a phantom recovery or a missed difference): the
//!   Initiator requeues the group, folds the accepted candidates back in
//!   so XOR cancellation removes them next round, and tells the
//!   Responder which groups to requeue via an Encoding-Hint
//!
//! Rounds continue until every group verifies clean. Per round, both
//! sides perform the same split and requeue operations in the same
//! order, so group indices stay aligned without ever being transmitted.
//!
//! # Roles
//!
//! The peer that checks decodings is the **Initiator**; the peer that
//! decodes merged sketches is the **Responder**. Both call `encode`
//! first, so the role is locked by the first role-distinguishing call
//! (`decode` or `decode_check`) and never flips afterwards.
//!
//! # Driving the Exchange
//!
//! ```no_run
//! use pbs_core::{ParamOracle, Reconciler};
//!
//! # fn main() -> pbs_core::Result<()> {
//! let oracle = ParamOracle::new();
//! let mut alice = Reconciler::new(4, &oracle)?; // Initiator
//! let mut bob = Reconciler::new(4, &oracle)?;   // Responder
//! alice.add_all([1u64, 2, 3, 4]);
//!
//! let (enc, _) = alice.encode()?;
//! bob.encode()?;
//! let (mut xors, mut checksums) = (Vec::new(), Vec::new());
//! let mut dec = bob.decode(&enc, &mut xors, &mut checksums)?;
//! while !alice.decode_check(&dec, &xors, &checksums)? {
//!     let (enc, hint) = alice.encode()?;
//!     bob.encode_with_hint(hint.as_ref())?;
//!     xors.clear();
//!     checksums.clear();
//!     dec = bob.decode(&enc, &mut xors, &mut checksums)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::mem;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::bch::BchSketch;
use crate::error::{CodecError, Error, ProtocolError, Result};
use crate::messages::{DecodingMessage, EncodingHintMessage, EncodingMessage};
use crate::params::ParamOracle;

/// Base seed both peers use unless configured otherwise.
pub const DEFAULT_SEED: u64 = 0x6d49_6e53_6b65;

/// Offset deriving the per-round bin seed from the base seed.
///
/// Both offsets are part of the wire protocol: peers that disagree on
/// them partition keys differently and will never converge.
pub const BIN_SEED_OFFSET: u64 = 142_857;

/// Offset deriving the per-round split seed from the base seed.
///
/// Independent of the group seed on purpose: reusing the group seed
/// would map a failed group's keys back into one subgroup, defeating
/// the split.
pub const SPLIT_SEED_OFFSET: u64 = 285_714;

/// Reconciler tuning knobs. The same values must be used on both peers.
#[derive(Debug, Clone, Copy)]
pub struct PbsConfig {
    /// Target average differences per group (delta); sets the initial
    /// group count `ceil(d / delta)`
    pub avg_diffs_per_group: f64,

    /// Probability target for completing within `max_rounds`
    pub target_success_prob: f64,

    /// Round budget assumed by the parameter search
    pub max_rounds: u32,

    /// Subgroup fan-out when a group's BCH decoding fails
    pub subgroups_on_failure: u32,

    /// Base seed for the group, bin and split hashes
    pub seed: u64,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            avg_diffs_per_group: 5.0,
            target_success_prob: 0.99,
            max_rounds: 3,
            subgroups_on_failure: 3,
            seed: DEFAULT_SEED,
        }
    }
}

/// Which side of the exchange an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Not yet locked; becomes fixed at the first `decode` or
    /// `decode_check`
    Undetermined,
    /// The side that verifies decodings and recovers keys
    Initiator,
    /// The side that merges sketches and reports decodings
    Responder,
}

/// A single reconciliation endpoint.
///
/// Group state is a struct-of-arrays indexed by group ordinal: `groups`,
/// `origin_gid`, `checksums`, and the flat `xors` (one `n`-sized row per
/// group). Each round appends replacement groups (splits, requeues) at
/// the tail and then drops the processed front, so a group lives for
/// exactly one encode/decode cycle.
#[derive(Debug)]
pub struct Reconciler {
    config: PbsConfig,

    /// BCH field width
    bch_m: u32,
    /// BCH block length `2^m - 1`; bins live in `[1, bch_n - 1]`
    bch_n: usize,
    /// BCH capacity
    bch_t: usize,
    /// Residual failure bound reported by the parameter search
    residual: f64,

    /// Estimated symmetric difference size this instance was built for
    num_diffs: usize,
    /// Group count of the initial partition; the origin-group hash is
    /// always taken modulo this value
    initial_groups: usize,
    /// Groups active in the current round (the front of the arrays)
    active_groups: usize,
    /// Group count of the round the pending hint indices refer to
    prev_round_groups: usize,

    round: u32,
    role: Role,

    /// Member keys per group
    groups: Vec<Vec<u64>>,
    /// Round-0 ancestor of each group, invariant across splits
    origin_gid: Vec<usize>,
    /// Per-bin key XOR, `bch_n` entries per group
    xors: Vec<u64>,
    /// Per-group XOR of all members
    checksums: Vec<u64>,

    /// Own sketches from the latest encode, consumed by the decode step
    sketches: Vec<BchSketch>,
    /// Groups (previous numbering) that failed checksum verification,
    /// drained into the next hint message
    exceptions: Vec<u32>,
    /// Keys recovered per completed check round
    recovered: Vec<Vec<u64>>,
}

impl Reconciler {
    /// Build a reconciler for an estimated difference size `num_diffs`
    /// with default configuration.
    pub fn new(num_diffs: usize, oracle: &ParamOracle) -> Result<Self> {
        Self::with_config(num_diffs, PbsConfig::default(), oracle)
    }

    /// Build a reconciler with explicit configuration.
    ///
    /// Runs the parameter search; the residual failure bound it reports
    /// is available via [`residual_failure_bound`](Self::residual_failure_bound).
    pub fn with_config(
        num_diffs: usize,
        config: PbsConfig,
        oracle: &ParamOracle,
    ) -> Result<Self> {
        if !(config.avg_diffs_per_group.is_finite() && config.avg_diffs_per_group > 0.0) {
            return Err(Error::Config(format!(
                "avg_diffs_per_group must be positive, got {}",
                config.avg_diffs_per_group
            )));
        }
        if !(config.target_success_prob > 0.0 && config.target_success_prob < 1.0) {
            return Err(Error::Config(format!(
                "target_success_prob must be in (0, 1), got {}",
                config.target_success_prob
            )));
        }
        if config.max_rounds == 0 {
            return Err(Error::Config("max_rounds must be at least 1".into()));
        }
        if config.subgroups_on_failure < 2 {
            return Err(Error::Config(format!(
                "subgroups_on_failure must be at least 2, got {}",
                config.subgroups_on_failure
            )));
        }

        let num_diffs = num_diffs.max(1);
        let (params, residual) = oracle.best_bch_params(
            num_diffs,
            config.avg_diffs_per_group,
            config.max_rounds as usize,
            config.subgroups_on_failure as usize,
            config.target_success_prob,
        );
        let bch_n = (1usize << params.m) - 1;
        let initial_groups =
            ((num_diffs as f64 / config.avg_diffs_per_group).ceil() as usize).max(1);
        debug!(
            num_diffs,
            m = params.m,
            t = params.t,
            groups = initial_groups,
            residual,
            "reconciler created"
        );

        Ok(Self {
            config,
            bch_m: params.m,
            bch_n,
            bch_t: params.t,
            residual,
            num_diffs,
            initial_groups,
            active_groups: initial_groups,
            prev_round_groups: initial_groups,
            round: 0,
            role: Role::Undetermined,
            groups: vec![Vec::new(); initial_groups],
            origin_gid: (0..initial_groups).collect(),
            xors: vec![0; initial_groups * bch_n],
            checksums: vec![0; initial_groups],
            sketches: Vec::new(),
            exceptions: Vec::new(),
            recovered: Vec::new(),
        })
    }

    /// Place a key into its group. All adds must precede the first
    /// `encode`.
    pub fn add(&mut self, key: u64) {
        let gid = self.group_id(key);
        self.groups[gid].push(key);
    }

    /// Add a batch of keys.
    pub fn add_all(&mut self, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            self.add(key);
        }
    }

    /// Build this round's sketches for every active group.
    ///
    /// Returns the Encoding message for the peer and, on rounds after a
    /// checksum exception, the Encoding-Hint listing the affected groups
    /// (previous round numbering). The Responder calls this only for its
    /// first round; afterwards it must use
    /// [`encode_with_hint`](Self::encode_with_hint).
    pub fn encode(&mut self) -> Result<(EncodingMessage, Option<EncodingHintMessage>)> {
        if self.role == Role::Responder {
            return Err(ProtocolError::WrongRole {
                role: self.role,
                operation: "encode",
            }
            .into());
        }
        if !self.sketches.is_empty() {
            return Err(ProtocolError::AlreadyEncoded.into());
        }

        let hint = if self.exceptions.is_empty() {
            None
        } else {
            Some(EncodingHintMessage::new(
                self.prev_round_groups,
                mem::take(&mut self.exceptions),
            ))
        };

        let message = self.encode_active_groups()?;
        Ok((message, hint))
    }

    /// Responder's encode for rounds after the first: requeue the
    /// hinted groups, drop the previous round's groups, and sketch
    /// everything that remains.
    ///
    /// The BCH-failed groups from the previous `decode` were already
    /// split locally and need no hint.
    pub fn encode_with_hint(
        &mut self,
        hint: Option<&EncodingHintMessage>,
    ) -> Result<EncodingMessage> {
        if self.role != Role::Responder {
            return Err(ProtocolError::WrongRole {
                role: self.role,
                operation: "encode_with_hint",
            }
            .into());
        }
        if !self.sketches.is_empty() {
            return Err(ProtocolError::AlreadyEncoded.into());
        }

        if let Some(hint) = hint {
            for &old_gid in &hint.groups {
                let old = old_gid as usize;
                if old >= self.active_groups {
                    return Err(ProtocolError::HintIndexOutOfRange {
                        index: old_gid,
                        groups: self.active_groups,
                    }
                    .into());
                }
                let members = mem::take(&mut self.groups[old]);
                self.groups.push(members);
                self.origin_gid.push(self.origin_gid[old]);
                self.checksums.push(0);
                self.xors.resize(self.xors.len() + self.bch_n, 0);
            }
        }

        self.compact();
        self.encode_active_groups()
    }

    /// Responder: merge the peer's sketches with this round's own,
    /// decode every group, and emit the side arrays the Initiator needs
    /// (`xors` gets the per-bin key XOR of each decoded bin, `checksums`
    /// one entry per successfully decoded group).
    ///
    /// Groups whose BCH decoding fails are split locally; the Initiator
    /// observes the same failures in the returned Decoding message and
    /// splits identically.
    pub fn decode(
        &mut self,
        other: &EncodingMessage,
        xors: &mut Vec<u64>,
        checksums: &mut Vec<u64>,
    ) -> Result<DecodingMessage> {
        match self.role {
            Role::Initiator => {
                return Err(ProtocolError::WrongRole {
                    role: self.role,
                    operation: "decode",
                }
                .into())
            }
            Role::Undetermined => self.role = Role::Responder,
            Role::Responder => {}
        }
        if self.sketches.is_empty() && self.active_groups > 0 {
            return Err(ProtocolError::EncodeRequired.into());
        }
        if other.num_groups() != self.active_groups {
            return Err(ProtocolError::GroupCountMismatch {
                local: self.active_groups,
                message: other.num_groups(),
            }
            .into());
        }
        if other.field_sz != self.bch_m || other.capacity != self.bch_t {
            return Err(ProtocolError::ParameterMismatch {
                m: self.bch_m,
                t: self.bch_t,
                msg_m: other.field_sz,
                msg_t: other.capacity,
            }
            .into());
        }

        let own = mem::take(&mut self.sketches);
        let mut num_differences = Vec::with_capacity(self.active_groups);
        let mut differences = Vec::new();
        let mut failed = Vec::new();

        for (gid, mut sketch) in own.into_iter().enumerate() {
            sketch.merge(&other.sketches[gid])?;
            match sketch.decode() {
                // A decoded bin outside [1, n-1] cannot come from any
                // key, so the decode is bogus; treat it as a failure.
                Some(bins)
                    if bins
                        .iter()
                        .all(|&b| b >= 1 && (b as usize) < self.bch_n) =>
                {
                    let row = gid * self.bch_n;
                    for &bid in &bins {
                        xors.push(self.xors[row + bid as usize]);
                    }
                    checksums.push(self.checksums[gid]);
                    num_differences.push(Some(bins.len() as u32));
                    differences.extend(bins);
                }
                _ => {
                    num_differences.push(None);
                    failed.push(gid);
                }
            }
        }

        for gid in failed {
            self.three_way_split(gid);
        }

        self.round += 1;
        debug!(
            round = self.round,
            groups = self.active_groups,
            "responder decoded"
        );
        Ok(DecodingMessage::new(
            self.bch_m,
            self.bch_t,
            num_differences,
            differences,
        ))
    }

    /// Initiator: verify the Responder's decoding against local state.
    ///
    /// Per group: recover candidate keys from the XOR pairs, accept the
    /// ones whose bin and origin-group hashes check out, and compare
    /// checksums. A mismatch requeues the group (with accepted
    /// candidates folded in, so XOR cancellation removes confirmed
    /// commons next round) and schedules it for the next hint message.
    ///
    /// Returns `true` when every group verified clean and reconciliation
    /// is complete.
    pub fn decode_check(
        &mut self,
        msg: &DecodingMessage,
        xors: &[u64],
        checksums: &[u64],
    ) -> Result<bool> {
        match self.role {
            Role::Responder => {
                return Err(ProtocolError::WrongRole {
                    role: self.role,
                    operation: "decode_check",
                }
                .into())
            }
            Role::Undetermined => self.role = Role::Initiator,
            Role::Initiator => {}
        }
        if self.sketches.is_empty() && self.active_groups > 0 {
            return Err(ProtocolError::EncodeRequired.into());
        }
        if msg.num_groups() != self.active_groups {
            return Err(ProtocolError::GroupCountMismatch {
                local: self.active_groups,
                message: msg.num_groups(),
            }
            .into());
        }
        if msg.field_sz != self.bch_m || msg.capacity != self.bch_t {
            return Err(ProtocolError::ParameterMismatch {
                m: self.bch_m,
                t: self.bch_t,
                msg_m: msg.field_sz,
                msg_t: msg.capacity,
            }
            .into());
        }
        if xors.len() < msg.differences.len() {
            return Err(ProtocolError::LengthMismatch {
                kind: "xors",
                required: msg.differences.len(),
                actual: xors.len(),
            }
            .into());
        }
        let successes = msg.num_differences.iter().filter(|p| p.is_some()).count();
        if checksums.len() < successes {
            return Err(ProtocolError::LengthMismatch {
                kind: "checksums",
                required: successes,
                actual: checksums.len(),
            }
            .into());
        }

        self.sketches.clear();
        self.prev_round_groups = self.active_groups;

        // BCH failures first, so both sides append split groups in the
        // same order before any requeues.
        for gid in 0..self.active_groups {
            if msg.num_differences[gid].is_none() {
                self.three_way_split(gid);
            }
        }

        self.exceptions.clear();
        let mut round_recovered = Vec::new();
        let mut offset = 0usize;
        let mut cid = 0usize;

        for gid in 0..self.active_groups {
            let p = match msg.num_differences[gid] {
                Some(p) => p as usize,
                None => continue,
            };
            let bins = &msg.differences[offset..offset + p];
            let peer_xors = &xors[offset..offset + p];
            let peer_checksum = checksums[cid];
            offset += p;
            cid += 1;

            let row = gid * self.bch_n;
            let mut accepted = Vec::new();
            let mut local_checksum = self.checksums[gid];
            for (k, &bin) in bins.iter().enumerate() {
                let bid = bin as usize;
                if bid == 0 || bid >= self.bch_n {
                    return Err(CodecError::InvalidBinIndex {
                        bin,
                        max: self.bch_n - 1,
                    }
                    .into());
                }
                let candidate = peer_xors[k] ^ self.xors[row + bid];
                // A true difference re-hashes into the bin it was
                // decoded from and into its group's round-0 ancestor;
                // phantoms fail one of the two with high probability.
                if self.bin_id(candidate) == bid
                    && self.group_id(candidate) == self.origin_gid[gid]
                {
                    local_checksum ^= candidate;
                    accepted.push(candidate);
                }
            }

            round_recovered.extend_from_slice(&accepted);

            if local_checksum != peer_checksum {
                // Exception (a phantom slipped through, or a difference
                // went undetected): requeue the group with the accepted
                // keys folded in and tell the peer via the next hint.
                let mut members = mem::take(&mut self.groups[gid]);
                members.extend_from_slice(&accepted);
                self.groups.push(members);
                self.origin_gid.push(self.origin_gid[gid]);
                self.checksums.push(0);
                self.xors.resize(self.xors.len() + self.bch_n, 0);
                self.exceptions.push(gid as u32);
            }
        }

        debug!(
            round = self.round + 1,
            recovered = round_recovered.len(),
            exceptions = self.exceptions.len(),
            "initiator checked"
        );
        self.recovered.push(round_recovered);
        self.compact();
        self.round += 1;
        Ok(self.active_groups == 0)
    }

    /// Completed encode/decode/check cycles so far.
    pub fn rounds(&self) -> u32 {
        self.round
    }

    /// Locked role, if any.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Groups active in the current round.
    pub fn num_groups(&self) -> usize {
        self.active_groups
    }

    /// Group count of the initial partition.
    pub fn initial_num_groups(&self) -> usize {
        self.initial_groups
    }

    /// Difference estimate this instance was constructed for.
    pub fn num_diffs(&self) -> usize {
        self.num_diffs
    }

    /// BCH field width chosen by the parameter search.
    pub fn bch_m(&self) -> u32 {
        self.bch_m
    }

    /// BCH capacity chosen by the parameter search.
    pub fn bch_t(&self) -> usize {
        self.bch_t
    }

    /// Residual failure bound reported by the parameter search. Above
    /// `1 - target_success_prob` the instance is under-provisioned but
    /// still usable: extra rounds compensate.
    pub fn residual_failure_bound(&self) -> f64 {
        self.residual
    }

    /// The configuration in effect.
    pub fn config(&self) -> &PbsConfig {
        &self.config
    }

    /// Keys recovered by the most recent `decode_check` round
    /// (Initiator only; empty for the Responder).
    pub fn differences_last_round(&self) -> &[u64] {
        self.recovered.last().map_or(&[], Vec::as_slice)
    }

    /// Keys recovered in every check round so far.
    pub fn differences_all(&self) -> &[Vec<u64>] {
        &self.recovered
    }

    fn hash(key: u64, seed: u64) -> u64 {
        xxh3_64_with_seed(&key.to_le_bytes(), seed)
    }

    /// Round-0 group of a key; stable across the whole exchange.
    fn group_id(&self, key: u64) -> usize {
        (Self::hash(key, self.config.seed) % self.initial_groups as u64) as usize
    }

    /// Bin of a key for the current round; never 0.
    fn bin_id(&self, key: u64) -> usize {
        let seed = self
            .config
            .seed
            .wrapping_add(BIN_SEED_OFFSET)
            .wrapping_add(self.round as u64);
        (Self::hash(key, seed) % (self.bch_n as u64 - 1) + 1) as usize
    }

    /// Subgroup of a key when its group is split this round.
    fn split_index(&self, key: u64) -> usize {
        let seed = self
            .config
            .seed
            .wrapping_add(SPLIT_SEED_OFFSET)
            .wrapping_add(self.round as u64);
        (Self::hash(key, seed) % self.config.subgroups_on_failure as u64) as usize
    }

    /// Sketch every active group and keep a copy for the decode step.
    fn encode_active_groups(&mut self) -> Result<EncodingMessage> {
        let mut sketches = Vec::with_capacity(self.active_groups);
        for gid in 0..self.active_groups {
            sketches.push(self.encode_group(gid)?);
        }
        self.sketches = sketches.clone();
        Ok(EncodingMessage::with_sketches(
            self.bch_m, self.bch_t, sketches,
        ))
    }

    /// Fill a group's bin XORs and checksum, then sketch its bin-parity
    /// bitmap. The group's rows are zero when this runs: groups are
    /// encoded exactly once in their lifetime.
    fn encode_group(&mut self, gid: usize) -> Result<BchSketch> {
        let mut bitmap = vec![false; self.bch_n];
        let row = gid * self.bch_n;
        for i in 0..self.groups[gid].len() {
            let key = self.groups[gid][i];
            let bid = self.bin_id(key);
            bitmap[bid] ^= true;
            self.xors[row + bid] ^= key;
            self.checksums[gid] ^= key;
        }

        let mut sketch = BchSketch::create(self.bch_m, self.bch_t)?;
        for (bid, &set) in bitmap.iter().enumerate() {
            if set {
                sketch.add(bid as u64);
            }
        }
        Ok(sketch)
    }

    /// Redistribute a failed group's keys over fresh subgroups appended
    /// at the tail. Both peers observe the same failure and split with
    /// the same seed, keeping group order aligned.
    fn three_way_split(&mut self, gid: usize) {
        let fanout = self.config.subgroups_on_failure as usize;
        let base = self.groups.len();
        for _ in 0..fanout {
            self.groups.push(Vec::new());
            self.origin_gid.push(self.origin_gid[gid]);
            self.checksums.push(0);
        }
        self.xors.resize(self.xors.len() + fanout * self.bch_n, 0);

        let members = mem::take(&mut self.groups[gid]);
        for key in members {
            let idx = self.split_index(key);
            self.groups[base + idx].push(key);
        }
    }

    /// Drop the processed front of every per-group array, leaving only
    /// the groups appended this round.
    fn compact(&mut self) {
        let front = self.active_groups;
        self.groups.drain(..front);
        self.origin_gid.drain(..front);
        self.checksums.drain(..front);
        self.xors.drain(..front * self.bch_n);
        self.active_groups = self.groups.len();
    }
}
