//! Near-optimal BCH parameter search for the reconciler.
//!
//! Construction of a reconciler needs a field width `m` and a sketch
//! capacity `t`. The search enumerates `m` in 6..=14 and, per width,
//! finds the smallest `t` whose union-bound failure estimate stays below
//! `1 - target_success_prob`, then keeps the `(m, t)` minimizing the
//! transmitted-bits proxy `m * t`.
//!
//! The failure estimate models one round per group as a balls-into-bins
//! process: a group receiving `i` of the `d` differences fails its BCH
//! stage with a probability read from a multi-round Markov-chain matrix,
//! and groups with more than `t` differences are handled by the
//! split recursion, bounded separately. Per-group probabilities combine
//! into a union bound with a times-two amplification for correlation
//! between the two directions.
//!
//! The Markov matrices depend only on `(balls, bins, capacity, rounds)`
//! and are expensive, so they are memoized through [`MatrixCache`].

use statrs::distribution::{Binomial, Discrete};
use tracing::{debug, warn};

use crate::cache::MatrixCache;

/// Most balls (differences per group) the chain models; heavier groups
/// fall into the distribution tail.
pub(crate) const MAX_BALLS: usize = 200;

/// Field width search range.
const SEARCH_FIELD_MIN: u32 = 6;
const SEARCH_FIELD_MAX: u32 = 14;

/// A BCH parameter pair chosen by the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BchParams {
    /// Field width `m`; block length is `2^m - 1`
    pub m: u32,
    /// Decoding capacity `t`
    pub t: usize,
}

/// Small dense row-major matrix of probabilities.
///
/// The chain computations need nothing beyond indexed access and one
/// square multiplication, so this stays hand-rolled rather than pulling
/// in a linear-algebra crate.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub(crate) fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Rebuild from raw parts; `None` when the shape disagrees.
    pub(crate) fn from_parts(rows: usize, cols: usize, data: Vec<f64>) -> Option<Self> {
        if data.len() != rows * cols {
            return None;
        }
        Some(Self { rows, cols, data })
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn cols(&self) -> usize {
        self.cols
    }

    pub(crate) fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub(crate) fn at(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    #[inline]
    fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    fn matmul(&self, other: &Matrix) -> Matrix {
        debug_assert_eq!(self.cols, other.rows);
        let mut out = Matrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.at(i, k);
                if a == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    out.data[i * out.cols + j] += a * other.at(k, j);
                }
            }
        }
        out
    }
}

/// The parameter oracle: the search plus its matrix cache.
///
/// The cache is owned explicitly (not an ambient singleton) so tests can
/// supply a private one; share an oracle by reference across reconciler
/// instances to share its memoized matrices.
#[derive(Debug, Default)]
pub struct ParamOracle {
    cache: MatrixCache,
}

impl ParamOracle {
    /// Oracle with a memory-only cache of default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Oracle backed by the given cache (e.g. one with a disk tier).
    pub fn with_cache(cache: MatrixCache) -> Self {
        Self { cache }
    }

    /// Find the `(m, t)` minimizing `m * t` subject to the failure bound
    /// staying below `1 - target_success_prob`.
    ///
    /// Returns the chosen parameters and the residual failure bound. If
    /// no pair in the search range meets the target, the best found is
    /// returned anyway (with a warning): later protocol rounds compensate
    /// for an under-provisioned sketch.
    pub fn best_bch_params(
        &self,
        num_diffs: usize,
        avg_diffs_per_group: f64,
        max_rounds: usize,
        subgroups_on_failure: usize,
        target_success_prob: f64,
    ) -> (BchParams, f64) {
        debug_assert!(num_diffs >= 1 && max_rounds >= 1);
        let target_failure = 1.0 - target_success_prob;

        // (params, residual, cost) of the cheapest pair under the bound
        let mut best: Option<(BchParams, f64, f64)> = None;
        // (params, residual) with the smallest residual seen, if none fit
        let mut fallback: Option<(BchParams, f64)> = None;
        let note_fallback = |params: BchParams, residual: f64, fb: &mut Option<(BchParams, f64)>| {
            if fb.map_or(true, |(_, r)| residual < r) {
                *fb = Some((params, residual));
            }
        };

        for m in SEARCH_FIELD_MIN..=SEARCH_FIELD_MAX {
            let bins = (1usize << m) - 1;
            let t_min = m as usize;
            let t_max = MAX_BALLS
                .min(bins - 2)
                .min((5.0 * avg_diffs_per_group).ceil() as usize)
                .max(t_min);

            let fail = |t: usize| {
                self.failure_probability_ub(
                    num_diffs,
                    avg_diffs_per_group,
                    bins,
                    max_rounds,
                    t,
                    subgroups_on_failure,
                )
            };

            let f_min = fail(t_min);
            let (t_star, residual) = if f_min <= target_failure {
                (t_min, f_min)
            } else if t_max > t_min {
                let f_max = fail(t_max);
                if f_max > target_failure {
                    note_fallback(BchParams { m, t: t_max }, f_max, &mut fallback);
                    continue;
                }
                // Smallest t in (t_min, t_max] meeting the bound
                let (mut lo, mut hi, mut f_hi) = (t_min, t_max, f_max);
                while hi - lo > 1 {
                    let mid = lo + (hi - lo) / 2;
                    let f_mid = fail(mid);
                    if f_mid <= target_failure {
                        hi = mid;
                        f_hi = f_mid;
                    } else {
                        lo = mid;
                    }
                }
                (hi, f_hi)
            } else {
                note_fallback(BchParams { m, t: t_min }, f_min, &mut fallback);
                continue;
            };

            let cost = (t_star * m as usize) as f64;
            if best.map_or(true, |(_, _, c)| cost < c) {
                best = Some((BchParams { m, t: t_star }, residual, cost));
            }
        }

        match best {
            Some((params, residual, _)) => {
                debug!(
                    m = params.m,
                    t = params.t,
                    residual,
                    "BCH parameter search done"
                );
                (params, residual)
            }
            None => {
                // Every width in range missed the target; hand back the
                // least bad pair and let the caller decide.
                let (params, residual) =
                    fallback.expect("search range is nonempty");
                warn!(
                    m = params.m,
                    t = params.t,
                    residual,
                    target = target_failure,
                    "no BCH parameters meet the target success probability"
                );
                (params, residual)
            }
        }
    }

    /// Upper bound on the probability that reconciliation of `num_diffs`
    /// differences is incomplete after `max_rounds` rounds, for a given
    /// bin count and capacity.
    pub fn failure_probability_ub(
        &self,
        num_diffs: usize,
        avg_diffs_per_group: f64,
        bins: usize,
        max_rounds: usize,
        capacity: usize,
        subgroups_on_failure: usize,
    ) -> f64 {
        let groups = (num_diffs as f64 / avg_diffs_per_group).max(1.0);
        let balls = MAX_BALLS.min(bins - 1);
        let mr = self
            .cache
            .get_or_insert_with((balls, bins, capacity, max_rounds), || {
                compute_multi_round_matrix(balls, bins, capacity, max_rounds)
            });

        let p_group = 1.0 / groups;
        let pmf = |k: usize| binom_pmf(k as u64, num_diffs as u64, p_group);

        let mut prob_one_group = 0.0;
        let mut tail = 1.0;
        // Groups the BCH stage can cover directly
        for i in 0..capacity {
            let p = pmf(i);
            prob_one_group += p * mr.at(i + 1, max_rounds);
            tail -= p;
        }
        // Overloaded groups go through the split recursion
        for i in capacity..balls {
            let p = pmf(i);
            prob_one_group +=
                p * split_failure_bound(&mr, i, subgroups_on_failure, capacity, max_rounds - 1);
            tail -= p;
        }
        // Remaining mass: i >= balls, counted as certain failure
        prob_one_group += tail;

        2.0 * (1.0 - (1.0 - prob_one_group).powf(groups))
    }
}

/// Binomial pmf with the degenerate endpoints handled explicitly
/// (`statrs` yields NaN from `0 * ln(0)` at p = 0 or 1, and p = 1 is
/// routine here: a single group means every difference lands in it).
fn binom_pmf(k: u64, n: u64, p: f64) -> f64 {
    if p >= 1.0 {
        return if k == n { 1.0 } else { 0.0 };
    }
    if p <= 0.0 {
        return if k == 0 { 1.0 } else { 0.0 };
    }
    Binomial::new(p, n).map_or(0.0, |d| d.pmf(k))
}

/// Chernoff-style bound for a group whose `balls` differences exceed the
/// capacity and get redistributed over `subgroups` fresh groups with one
/// round fewer remaining.
fn split_failure_bound(
    mr: &Matrix,
    balls: usize,
    subgroups: usize,
    capacity: usize,
    rounds_left: usize,
) -> f64 {
    let pmf = |k: usize| binom_pmf(k as u64, balls as u64, 1.0 / subgroups as f64);

    let mut prob_one = 0.0;
    let mut tail = 1.0;
    for j in 0..capacity {
        let p = pmf(j);
        prob_one += p * mr.at(j + 1, rounds_left);
        tail -= p;
    }
    prob_one += tail;

    2.0 * (1.0 - (1.0 - prob_one).powi(subgroups as i32))
}

/// `M[i][r]` = probability that a group holding `i` differences is still
/// undecoded after `r` rounds (rows `1..=balls`, cols `1..=rounds`; row 0
/// and column 0 are zero).
fn compute_multi_round_matrix(
    balls: usize,
    bins: usize,
    capacity: usize,
    rounds: usize,
) -> Matrix {
    let m2d = compute_transition_matrix(balls, bins, capacity);

    // One-round transition T[i][j] = P(i balls leave j unresolved), with
    // 0 as the absorbing "done" state.
    let mut t_mat = Matrix::zeros(balls + 1, balls + 1);
    t_mat.set(0, 0, 1.0);
    for i in 1..=balls {
        for j in 0..=balls {
            t_mat.set(i, j, m2d.at(i, j + 1));
        }
    }

    // resolved[i-1][k] = P(i balls fully resolved within k+1 rounds)
    let mut resolved = Matrix::zeros(balls, rounds);
    let mut power = t_mat.clone();
    for round in 0..rounds {
        for i in 1..=balls {
            resolved.set(i - 1, round, power.at(i, 0));
        }
        power = power.matmul(&t_mat);
    }

    let mut out = Matrix::zeros(balls + 1, rounds + 1);
    for i in 1..=balls {
        for round in 1..=rounds {
            out.set(i, round, 1.0 - resolved.at(i - 1, round - 1));
        }
    }
    out
}

/// One-round transition probabilities from the balls-into-bins chain.
///
/// `m2d[i][j+1]` = probability that `i` balls leave exactly `j` balls
/// unresolved after one round, where a round resolves every ball that
/// landed alone in a bin, provided at most `capacity` bins are occupied
/// (the decodable region, with odd-occupancy approximated by occupancy).
fn compute_transition_matrix(balls: usize, bins: usize, capacity: usize) -> Matrix {
    debug_assert!(balls >= 1 && balls < bins && capacity <= balls);
    let n = bins;
    let m = balls;
    let width = m + 2; // b in 0..=m+1
    let height = m + 1; // a - (n - m) in 0..=m

    let mut m2d = Matrix::zeros(m + 1, m + 2);

    // plane[a_idx][b]: after x balls, a bins empty, b-1 bins with exactly
    // one ball; only a in [n-m, n] is reachable, stored as a band.
    let mut prev = vec![0.0f64; height * width];
    let mut cur = vec![0.0f64; height * width];

    // One ball: n-1 bins empty, one singleton.
    prev[(m - 1) * width + 2] = 1.0;

    let row_from_plane = |m2d: &mut Matrix, plane: &[f64], x: usize| {
        for j in 0..=x {
            let col = x - j + 1;
            let mut sum = 0.0;
            for a in (n - capacity)..=n {
                sum += plane[(a - (n - m)) * width + col];
            }
            m2d.set(x, j + 1, sum);
        }
    };
    row_from_plane(&mut m2d, &prev, 1);

    for x in 2..=m {
        cur.fill(0.0);
        for a_idx in 0..m {
            let a = n - m + a_idx;
            let enter_single = (a as f64 + 1.0) / n as f64;
            for b in 1..=(x + 1) {
                let stay = (n as f64 - a as f64 - b as f64 + 1.0) / n as f64;
                let leave_single = b as f64 / n as f64;
                let v = if b == 1 {
                    prev[a_idx * width + b + 1] * leave_single + prev[a_idx * width + b] * stay
                } else if b == m + 1 {
                    prev[(a_idx + 1) * width + b - 1] * enter_single
                        + prev[a_idx * width + b] * stay
                } else {
                    prev[(a_idx + 1) * width + b - 1] * enter_single
                        + prev[a_idx * width + b + 1] * leave_single
                        + prev[a_idx * width + b] * stay
                };
                cur[a_idx * width + b] = v;
            }
        }
        row_from_plane(&mut m2d, &cur, x);
        std::mem::swap(&mut prev, &mut cur);
    }

    // Above capacity the round resolves nothing.
    for i in (capacity + 1)..=m {
        let mut sum = 0.0;
        for col in 1..=i {
            sum += m2d.at(i, col);
        }
        m2d.set(i, i + 1, 1.0 - sum);
    }

    m2d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_basics() {
        let mut a = Matrix::zeros(2, 3);
        a.set(0, 0, 1.0);
        a.set(1, 2, 4.0);
        assert_eq!(a.at(0, 0), 1.0);
        assert_eq!(a.at(1, 2), 4.0);
        assert!(Matrix::from_parts(2, 3, vec![0.0; 5]).is_none());
        assert!(Matrix::from_parts(2, 3, vec![0.0; 6]).is_some());
    }

    #[test]
    fn test_matmul_identity() {
        let mut id = Matrix::zeros(3, 3);
        for i in 0..3 {
            id.set(i, i, 1.0);
        }
        let mut a = Matrix::zeros(3, 3);
        for i in 0..3 {
            for j in 0..3 {
                a.set(i, j, (i * 3 + j) as f64);
            }
        }
        assert_eq!(a.matmul(&id), a);
        assert_eq!(id.matmul(&a), a);
    }

    #[test]
    fn test_transition_matrix_rows_are_distributions() {
        let m2d = compute_transition_matrix(20, 63, 10);
        for i in 1..=20 {
            let sum: f64 = (1..=(i + 1)).map(|c| m2d.at(i, c)).sum();
            assert!(
                (sum - 1.0).abs() < 1e-9,
                "row {i} sums to {sum}"
            );
            for c in 0..m2d.cols() {
                let v = m2d.at(i, c);
                assert!((-1e-12..=1.0 + 1e-9).contains(&v), "m2d[{i}][{c}] = {v}");
            }
        }
        // A single ball always lands alone and resolves.
        assert!((m2d.at(1, 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_multi_round_matrix_decreases_with_rounds() {
        let mr = compute_multi_round_matrix(20, 63, 10, 3);
        for i in 1..=20 {
            for r in 1..3 {
                assert!(
                    mr.at(i, r + 1) <= mr.at(i, r) + 1e-12,
                    "failure probability must not grow with rounds (i={i}, r={r})"
                );
            }
        }
        // More balls are never easier within one round.
        for i in 1..20 {
            assert!(mr.at(i, 1) <= mr.at(i + 1, 1) + 1e-9);
        }
    }

    #[test]
    fn test_failure_bound_decreases_with_capacity() {
        let oracle = ParamOracle::new();
        let f1 = oracle.failure_probability_ub(20, 5.0, 255, 2, 9, 3);
        let f2 = oracle.failure_probability_ub(20, 5.0, 255, 2, 13, 3);
        assert!(f2 <= f1, "f({}) = {f1}, f({}) = {f2}", 9, 13);
    }

    #[test]
    fn test_search_matches_reference_point() {
        let oracle = ParamOracle::new();
        let (params, residual) = oracle.best_bch_params(20, 5.0, 2, 3, 0.99);
        assert_eq!((params.m, params.t), (8, 11), "residual {residual}");
        assert!(
            (residual - 9.36e-3).abs() < 2e-4,
            "unexpected residual {residual}"
        );
    }

    #[test]
    fn test_search_cost_monotone_in_diffs() {
        let oracle = ParamOracle::new();
        let mut last_cost = 0;
        for d in [10usize, 20, 50, 100, 200, 500] {
            let (params, _) = oracle.best_bch_params(d, 5.0, 3, 3, 0.99);
            let cost = params.m as usize * params.t;
            assert!(
                cost >= last_cost,
                "cost regressed at d={d}: {cost} < {last_cost}"
            );
            last_cost = cost;
        }
    }

    #[test]
    fn test_search_respects_capacity_floor() {
        let oracle = ParamOracle::new();
        let (params, _) = oracle.best_bch_params(100, 5.0, 3, 3, 0.99);
        assert!(params.t >= params.m as usize);
        assert!((6..=14).contains(&params.m));
        assert!(params.t <= MAX_BALLS);
    }

    #[test]
    fn test_unreachable_target_returns_best_effort() {
        let oracle = ParamOracle::new();
        // One round and a near-one success target cannot be met
        let (params, residual) = oracle.best_bch_params(1000, 5.0, 1, 3, 0.999999999);
        assert!((6..=14).contains(&params.m));
        assert!(residual > 1.0 - 0.999999999);
    }
}
