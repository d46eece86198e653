// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hot-set selection and the epoch rotation protocol.
//!
//! A rotation publishes a new epoch in front of the serving one, waits for every worker to see it,
//! drains the old epoch's writes into the backing index and its cached values into the new view,
//! then retires and reclaims the old epoch. Each slot change is bracketed by an undo record and a
//! root record in pool 0's header.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::epoch::{EpochSnapshot, SlotOwner};
use crate::error::{Result, fatal};
use crate::index::BackingIndex;
use crate::nap::Shared;
use crate::pool::UndoKind;
use crate::sketch::FrequencySketch;
use crate::top_k::Candidate;
use crate::view::Location;

/// Number of hottest candidates compared between rounds.
const HOTTEST_TRACKED: usize = 8;

/// Thresholds deciding whether a round's candidates are worth a rotation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RotationPolicy {
    pub min_frequency: u32,
    pub min_skew: u32,
    pub max_overlap: f64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            min_frequency: 100,
            min_skew: 3,
            max_overlap: 0.75,
        }
    }
}

/// Why a round ended without a rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SkipReason {
    TooFewCandidates,
    BelowFrequencyFloor,
    UniformWorkload,
    SameHottestKeys,
    InsufficientChurn,
}

/// Outcome of [`RotationState::decide`].
#[derive(Debug, PartialEq)]
pub(crate) enum Decision {
    Skip(SkipReason),
    Rotate(Plan),
}

/// The key set of a new epoch, sorted by key, and how many of its keys are already hot.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Plan {
    pub keys: Vec<(Vec<u8>, Location)>,
    pub overlap: usize,
}

/// Bookkeeping owned by whoever drives rotations.
///
/// Only reachable through the cache's rotation mutex, which makes it the proof of exclusive
/// control over the epoch slots.
#[derive(Debug, Default)]
pub(crate) struct RotationState {
    /// Keys of the current epoch, sorted.
    hot_keys: Vec<Vec<u8>>,
    /// The hottest keys of the last round that got past the frequency checks, sorted.
    hottest: Vec<Vec<u8>>,
}

impl SlotOwner for RotationState {}

impl RotationState {
    pub(crate) fn is_hot(&self, key: &[u8]) -> bool {
        self.hot_keys.binary_search_by(|hot| hot.as_slice().cmp(key)).is_ok()
    }

    /// Applies `policy` to a round's candidates, hottest first.
    pub(crate) fn decide(&mut self, policy: &RotationPolicy, capacity: usize, ranked: &[Candidate]) -> Decision {
        if ranked.len() < HOTTEST_TRACKED {
            return Decision::Skip(SkipReason::TooFewCandidates);
        }

        let hottest = u64::from(ranked[0].frequency);
        let lowest = u64::from(ranked[ranked.len() - 1].frequency);
        if hottest < u64::from(policy.min_frequency) {
            return Decision::Skip(SkipReason::BelowFrequencyFloor);
        }
        if hottest < lowest.max(1) * u64::from(policy.min_skew) {
            return Decision::Skip(SkipReason::UniformWorkload);
        }

        let mut top: Vec<Vec<u8>> = ranked[..HOTTEST_TRACKED].iter().map(|c| c.key.clone()).collect();
        top.sort_unstable();
        if top == self.hottest {
            return Decision::Skip(SkipReason::SameHottestKeys);
        }
        self.hottest = top;

        let plan = self.plan(ranked.iter().map(|c| c.key.clone()).collect());
        #[expect(clippy::cast_precision_loss, reason = "hot-key counts are far below 2^52")]
        let too_similar = plan.overlap as f64 > policy.max_overlap * capacity as f64;
        if too_similar {
            return Decision::Skip(SkipReason::InsufficientChurn);
        }

        Decision::Rotate(plan)
    }

    /// Sorts and de-duplicates `keys` and marks the ones that are hot in the current epoch.
    pub(crate) fn plan(&self, mut keys: Vec<Vec<u8>>) -> Plan {
        keys.sort_unstable();
        keys.dedup();

        let mut overlap = 0;
        let mut hot = self.hot_keys.iter().peekable();
        let keys = keys
            .into_iter()
            .map(|key| {
                while hot.next_if(|hot| **hot < key).is_some() {}
                let location = if hot.next_if(|hot| **hot == key).is_some() {
                    overlap += 1;
                    Location::InPreviousEpoch
                } else {
                    Location::InBackingIndex
                };
                (key, location)
            })
            .collect();

        Plan { keys, overlap }
    }
}

/// Runs the rotation protocol, making `plan` the current epoch. Returns the new epoch number.
///
/// Failures to map the new epoch or to persist the undo, root or drained records leave no safe way
/// forward and abort the process.
pub(crate) fn rotate<B: BackingIndex>(shared: &Shared<B>, state: &mut RotationState, plan: Plan) -> u64 {
    let started = Instant::now();
    let Plan { keys, overlap } = plan;

    let next = EpochSnapshot::new(shared.slots.epoch() + 1, &keys, shared.layout, Arc::clone(&shared.cow))
        .unwrap_or_else(|error| fatal(&format!("mapping the value store of a new epoch failed: {error}")));
    let next = Box::new(next);
    state.hot_keys = keys.into_iter().map(|(key, _)| key).collect();

    let root = shared.slots.root(&*state);
    durable(shared.header.log(UndoKind::SwapIn, root.current, root.previous));
    let epoch = {
        let _writer = shared.fallback.write();
        shared.slots.install(next, state)
    };
    durable(shared.header.store_root(shared.slots.root(&*state)));
    durable(shared.header.truncate());

    shared.topology.wait_for_epoch(epoch);

    let (flushed, migrated) = shared.slots.previous(&*state).map_or((0, 0), |previous| {
        let flushed = previous.store().flush_to(&shared.backing);
        durable(previous.store().mark_drained());
        let migrated = shared
            .slots
            .current(&*state)
            .view()
            .migrate_from(previous.view(), &shared.backing);
        (flushed, migrated)
    });

    let root = shared.slots.root(&*state);
    durable(shared.header.log(UndoKind::Retire, root.garbage, root.previous));
    shared.slots.retire_previous(state);
    durable(shared.header.store_root(shared.slots.root(&*state)));
    durable(shared.header.truncate());

    shared.topology.wait_for_quiescence();

    // SAFETY: the quiescence wait above saw every worker leave or start a newer operation after
    // the retired snapshot was unlinked.
    drop(unsafe { shared.slots.take_garbage(state) });
    durable(shared.header.store_root(shared.slots.root(&*state)));

    tracing::info!(
        epoch,
        hot_keys = shared.slots.current(&*state).view().len(),
        overlap,
        flushed,
        migrated,
        elapsed = ?started.elapsed(),
        "rotated to a new hot-key epoch"
    );
    epoch
}

fn durable(result: Result<()>) {
    if let Err(error) = result {
        fatal(&format!("persisting rotation metadata failed: {error}"));
    }
}

/// Body of the background rotation thread.
pub(crate) fn run<B: BackingIndex>(shared: &Shared<B>, mut sketch: FrequencySketch) {
    tracing::debug!(workers = shared.topology.affinities().len(), "rotation thread started");

    while !shared.stop.load(Ordering::Acquire) {
        sketch.reset();
        let polled = sketch.poll_workloads(shared.switch_interval(), &shared.stop);
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let ranked = sketch.ranked();
        tracing::trace!(records = polled.records, idle_rounds = polled.idle_rounds, "observed a round of sampled traffic");
        let mut state = shared.rotation.lock();
        match state.decide(&shared.policy, shared.hot_keys, &ranked) {
            Decision::Skip(reason) => {
                tracing::debug!(?reason, candidates = ranked.len(), "keeping the current hot-key epoch");
            }
            Decision::Rotate(plan) => {
                rotate(shared, &mut state, plan);
            }
        }
    }

    tracing::debug!("rotation thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(frequencies: &[(&str, u32)]) -> Vec<Candidate> {
        frequencies
            .iter()
            .map(|(key, frequency)| Candidate {
                key: key.as_bytes().to_vec(),
                frequency: *frequency,
            })
            .collect()
    }

    fn skewed(prefix: &str) -> Vec<Candidate> {
        (0..10_u32)
            .map(|i| Candidate {
                key: format!("{prefix}{i}").into_bytes(),
                frequency: 10_000 - i * 900,
            })
            .collect()
    }

    fn policy() -> RotationPolicy {
        RotationPolicy::default()
    }

    #[test]
    fn too_few_candidates() {
        let mut state = RotationState::default();
        let ranked = candidates(&[("a", 1_000), ("b", 100)]);
        assert_eq!(
            state.decide(&policy(), 100, &ranked),
            Decision::Skip(SkipReason::TooFewCandidates)
        );
    }

    #[test]
    fn frequency_floor_and_skew() {
        let mut state = RotationState::default();

        let cold: Vec<_> = (0..10_u32)
            .map(|i| Candidate {
                key: format!("k{i}").into_bytes(),
                frequency: 99 - i * 9,
            })
            .collect();
        assert_eq!(
            state.decide(&policy(), 100, &cold),
            Decision::Skip(SkipReason::BelowFrequencyFloor)
        );

        let uniform: Vec<_> = (0..10_u32)
            .map(|i| Candidate {
                key: vec![u8::try_from(i).unwrap()],
                frequency: 500,
            })
            .collect();
        assert_eq!(
            state.decide(&policy(), 100, &uniform),
            Decision::Skip(SkipReason::UniformWorkload)
        );
    }

    #[test]
    fn one_hot_key_over_a_long_cold_tail_rotates() {
        let mut state = RotationState::default();

        // One key seen a hundred times, the rest once each.
        let mut ranked = vec![Candidate {
            key: b"k0".to_vec(),
            frequency: 100,
        }];
        ranked.extend((1..16_u32).map(|i| Candidate {
            key: format!("k{i}").into_bytes(),
            frequency: 1,
        }));

        let Decision::Rotate(plan) = state.decide(&policy(), 16, &ranked) else {
            panic!("expected a rotation");
        };
        assert!(plan.keys.iter().any(|(key, _)| key == b"k0"));

        ranked[0].frequency = 99;
        let mut state = RotationState::default();
        assert_eq!(
            state.decide(&policy(), 16, &ranked),
            Decision::Skip(SkipReason::BelowFrequencyFloor)
        );
    }

    #[test]
    fn rotation_plan_is_sorted_and_cold() {
        let mut state = RotationState::default();
        let Decision::Rotate(plan) = state.decide(&policy(), 100, &skewed("k")) else {
            panic!("expected a rotation");
        };

        assert_eq!(plan.overlap, 0);
        assert_eq!(plan.keys.len(), 10);
        assert!(plan.keys.windows(2).all(|pair| pair[0].0 < pair[1].0));
        assert!(plan.keys.iter().all(|(_, location)| *location == Location::InBackingIndex));
    }

    #[test]
    fn unchanged_hottest_keys_skip() {
        let mut state = RotationState::default();
        assert!(matches!(state.decide(&policy(), 100, &skewed("k")), Decision::Rotate(_)));
        assert_eq!(
            state.decide(&policy(), 100, &skewed("k")),
            Decision::Skip(SkipReason::SameHottestKeys)
        );
    }

    #[test]
    fn overlap_is_measured_against_the_hot_set() {
        let mut state = RotationState {
            hot_keys: (0..10).map(|i| format!("k{i}").into_bytes()).collect(),
            hottest: Vec::new(),
        };
        state.hot_keys.sort_unstable();

        // All ten candidates are already hot: overlap 10 exceeds 0.75 * 12.
        assert_eq!(
            state.decide(&policy(), 12, &skewed("k")),
            Decision::Skip(SkipReason::InsufficientChurn)
        );

        let Decision::Rotate(plan) = state.decide(&policy(), 100, &skewed("j")) else {
            panic!("expected a rotation");
        };
        assert_eq!(plan.overlap, 0);
    }

    #[test]
    fn plan_marks_hot_keys_as_previous() {
        let state = RotationState {
            hot_keys: vec![b"b".to_vec(), b"d".to_vec()],
            hottest: Vec::new(),
        };
        let plan = state.plan(vec![b"d".to_vec(), b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        assert_eq!(plan.overlap, 2);
        assert_eq!(
            plan.keys,
            vec![
                (b"a".to_vec(), Location::InBackingIndex),
                (b"b".to_vec(), Location::InPreviousEpoch),
                (b"d".to_vec(), Location::InPreviousEpoch),
            ]
        );
        assert!(state.is_hot(b"d"));
        assert!(!state.is_hot(b"a"));
    }
}
