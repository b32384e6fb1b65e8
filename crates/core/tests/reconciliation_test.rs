//! Integration tests for full two-party reconciliation sessions.
//!
//! Every exchanged message crosses an in-memory "wire" as serialized
//! bytes and is re-parsed on the far side, so these tests exercise the
//! codecs together with the protocol: encode -> decode -> decode-check,
//! with hint-driven re-encoding until the Initiator reports completion.
//!
//! Correctness is judged the way the protocol defines it: a key that is
//! a true difference must be recovered an odd number of times across
//! rounds (a phantom recovered once is recovered again later and
//! cancels), and nothing outside the symmetric difference may end up
//! with an odd count.

use std::collections::{HashMap, HashSet};

use pbs_core::{
    DecodingMessage, EncodingHintMessage, EncodingMessage, ParamOracle, PbsConfig, Reconciler,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Abort threshold for a session that fails to converge.
const ROUND_LIMIT: u32 = 32;

/// Serialize and re-parse an encoding message, as the transport would.
fn over_wire_encoding(msg: &EncodingMessage) -> EncodingMessage {
    let buf = msg.write();
    assert_eq!(buf.len(), msg.serialized_size());
    EncodingMessage::parse(msg.field_sz, msg.capacity, msg.num_groups(), &buf)
        .expect("encoding message must survive the wire")
}

/// Serialize and re-parse a decoding message.
fn over_wire_decoding(msg: &DecodingMessage) -> DecodingMessage {
    let buf = msg.write();
    assert_eq!(buf.len(), msg.serialized_size());
    DecodingMessage::parse(msg.field_sz, msg.capacity, msg.num_groups(), &buf)
        .expect("decoding message must survive the wire")
}

/// Drive a complete session between an Initiator holding `left` and a
/// Responder holding `right`. Returns the round count and how often each
/// key was recovered.
fn run_session(
    left: &[u64],
    right: &[u64],
    d_hat: usize,
    config: PbsConfig,
    oracle: &ParamOracle,
) -> (u32, HashMap<u64, u32>) {
    let mut alice = Reconciler::with_config(d_hat, config, oracle).unwrap();
    let mut bob = Reconciler::with_config(d_hat, config, oracle).unwrap();
    alice.add_all(left.iter().copied());
    bob.add_all(right.iter().copied());

    let (enc, hint) = alice.encode().unwrap();
    assert!(hint.is_none(), "round 0 must not carry a hint");
    bob.encode().unwrap();

    let mut counts: HashMap<u64, u32> = HashMap::new();
    let mut enc = over_wire_encoding(&enc);
    let mut xors = Vec::new();
    let mut checksums = Vec::new();
    let mut dec = bob.decode(&enc, &mut xors, &mut checksums).unwrap();

    loop {
        let dec_wire = over_wire_decoding(&dec);
        let done = alice.decode_check(&dec_wire, &xors, &checksums).unwrap();
        for &key in alice.differences_last_round() {
            *counts.entry(key).or_default() += 1;
        }
        if done {
            break;
        }
        assert!(
            alice.rounds() < ROUND_LIMIT,
            "session did not converge within {ROUND_LIMIT} rounds"
        );

        let (enc_next, hint) = alice.encode().unwrap();
        let hint_wire = hint.map(|h| {
            let buf = h.write();
            assert_eq!(buf.len(), h.serialized_size());
            EncodingHintMessage::parse(bob.num_groups(), &buf)
                .expect("hint message must survive the wire")
        });
        bob.encode_with_hint(hint_wire.as_ref()).unwrap();
        enc = over_wire_encoding(&enc_next);
        xors.clear();
        checksums.clear();
        dec = bob.decode(&enc, &mut xors, &mut checksums).unwrap();
    }

    assert_eq!(alice.rounds(), bob.rounds(), "peers must agree on rounds");
    (alice.rounds(), counts)
}

/// The keys recovered an odd number of times must be exactly the
/// symmetric difference.
fn assert_reconciled(left: &[u64], right: &[u64], counts: &HashMap<u64, u32>) {
    let l: HashSet<u64> = left.iter().copied().collect();
    let r: HashSet<u64> = right.iter().copied().collect();
    let expected: HashSet<u64> = l.symmetric_difference(&r).copied().collect();
    let odd: HashSet<u64> = counts
        .iter()
        .filter(|(_, &c)| c % 2 == 1)
        .map(|(&k, _)| k)
        .collect();

    assert_eq!(
        odd, expected,
        "odd-recovered keys must equal the symmetric difference"
    );
}

#[test]
fn test_responder_empty() {
    let oracle = ParamOracle::new();
    let left: Vec<u64> = (1000..1010).collect();

    let (rounds, counts) = run_session(&left, &[], 10, PbsConfig::default(), &oracle);
    assert_reconciled(&left, &[], &counts);
    assert!(rounds <= 4, "took {rounds} rounds");
}

#[test]
fn test_initiator_empty() {
    let oracle = ParamOracle::new();
    let right: Vec<u64> = (20200715..20200725).collect();

    let (rounds, counts) = run_session(&[], &right, 10, PbsConfig::default(), &oracle);
    assert_reconciled(&[], &right, &counts);
    assert!(rounds <= 4, "took {rounds} rounds");
}

#[test]
fn test_balanced_no_intersection() {
    let oracle = ParamOracle::new();
    let left: Vec<u64> = (1000..1500).collect();
    let right: Vec<u64> = (1500..2000).collect();

    let (rounds, counts) = run_session(&left, &right, 1000, PbsConfig::default(), &oracle);
    assert_reconciled(&left, &right, &counts);
    assert!(rounds <= 6, "took {rounds} rounds");
}

#[test]
fn test_large_with_intersection() {
    let oracle = ParamOracle::new();
    // 10_000 shared keys, 5_000 unique per side, estimate inflated 1.2x
    let shared: Vec<u64> = (1_000_000..1_010_000).collect();
    let mut left = shared.clone();
    left.extend(2_000_000..2_005_000u64);
    let mut right = shared;
    right.extend(3_000_000..3_005_000u64);

    let d_hat = (10_000f64 * 1.2) as usize;
    let (rounds, counts) = run_session(&left, &right, d_hat, PbsConfig::default(), &oracle);
    assert_reconciled(&left, &right, &counts);
    assert!(rounds <= 6, "took {rounds} rounds");

    let odd = counts.values().filter(|&&c| c % 2 == 1).count();
    assert_eq!(odd, 10_000);
}

#[test]
fn test_symmetry_of_swapped_sides() {
    let oracle = ParamOracle::new();
    let a: Vec<u64> = (500..600).collect();
    let b: Vec<u64> = (550..650).collect();

    let (_, forward) = run_session(&a, &b, 100, PbsConfig::default(), &oracle);
    let (_, backward) = run_session(&b, &a, 100, PbsConfig::default(), &oracle);

    let odd = |m: &HashMap<u64, u32>| -> HashSet<u64> {
        m.iter()
            .filter(|(_, &c)| c % 2 == 1)
            .map(|(&k, _)| k)
            .collect()
    };
    assert_eq!(odd(&forward), odd(&backward));
}

#[test]
fn test_underestimated_difference_still_converges() {
    let oracle = ParamOracle::new();
    // 60 true differences but an estimate of 20: groups overload, the
    // split/exception machinery has to do the work.
    let left: Vec<u64> = (7000..7060).collect();

    let (rounds, counts) = run_session(&left, &[], 20, PbsConfig::default(), &oracle);
    assert_reconciled(&left, &[], &counts);
    assert!(rounds <= ROUND_LIMIT);
}

#[test]
fn test_seed_changes_partition_but_not_outcome() {
    let oracle = ParamOracle::new();
    let left: Vec<u64> = (42_000..42_080).collect();
    let right: Vec<u64> = (42_040..42_120).collect();

    for seed in [pbs_core::DEFAULT_SEED, 1, 0xFEED_F00D] {
        let config = PbsConfig {
            seed,
            ..PbsConfig::default()
        };
        let (_, counts) = run_session(&left, &right, 80, config, &oracle);
        assert_reconciled(&left, &right, &counts);
    }
}

/// Completion-rate check over many randomized trials (a lighter stand-in
/// for the full statistical property; see the ignored test below).
#[test]
fn test_completion_rate_within_round_budget() {
    let oracle = ParamOracle::new();
    let trials = 150;
    let d = 10usize;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED_2020);

    let mut within_budget = 0;
    for trial in 0..trials {
        let mut keys = HashSet::new();
        while keys.len() < d {
            keys.insert(rng.gen::<u64>());
        }
        let left: Vec<u64> = keys.into_iter().collect();
        let config = PbsConfig {
            seed: 0xA11CE + trial as u64,
            ..PbsConfig::default()
        };
        let (rounds, counts) = run_session(&left, &[], d, config, &oracle);
        assert_reconciled(&left, &[], &counts);
        if rounds <= config.max_rounds {
            within_budget += 1;
        }
    }

    // Target is 0.99; leave statistical slack for 150 trials.
    let rate = within_budget as f64 / trials as f64;
    assert!(rate >= 0.95, "completion rate {rate} below target");
}

/// Full statistical check (>= 1000 trials); slow, run explicitly with
/// `cargo test -- --ignored`.
#[test]
#[ignore]
fn test_completion_rate_many_trials() {
    let oracle = ParamOracle::new();
    let trials = 1000;
    let mut rng = ChaCha8Rng::seed_from_u64(0xDEC0DE);

    for &d in &[10usize, 100] {
        let mut within_budget = 0;
        for trial in 0..trials {
            let mut keys = HashSet::new();
            while keys.len() < d {
                keys.insert(rng.gen::<u64>());
            }
            let left: Vec<u64> = keys.into_iter().collect();
            let config = PbsConfig {
                seed: 0xB0B + trial as u64,
                ..PbsConfig::default()
            };
            let (rounds, counts) = run_session(&left, &[], d, config, &oracle);
            assert_reconciled(&left, &[], &counts);
            if rounds <= config.max_rounds {
                within_budget += 1;
            }
        }
        let rate = within_budget as f64 / trials as f64;
        assert!(rate >= 0.98, "completion rate {rate} below target for d={d}");
    }
}

#[test]
fn test_random_sets_with_intersection() {
    let oracle = ParamOracle::new();
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let mut universe = HashSet::new();
    while universe.len() < 600 {
        universe.insert(rng.gen::<u64>());
    }
    let universe: Vec<u64> = universe.into_iter().collect();

    // 400 shared, 100 unique per side
    let left: Vec<u64> = universe[..500].to_vec();
    let right: Vec<u64> = universe[100..].to_vec();

    let (_, counts) = run_session(&left, &right, 200, PbsConfig::default(), &oracle);
    assert_reconciled(&left, &right, &counts);
}
