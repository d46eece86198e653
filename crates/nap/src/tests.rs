// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thread_aware::affinity::{PinnedAffinity, pinned_affinities};

use crate::{BackingIndex, MemoryIndex, Nap, ValueLayout};

fn word(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

fn read_word(nap: &Nap<Arc<MemoryIndex>>, affinity: PinnedAffinity, key: &[u8]) -> Option<u64> {
    nap.get(affinity, key)
        .map(|value| u64::from_le_bytes(value.as_ref().try_into().unwrap()))
}

fn backing_word(backing: &MemoryIndex, key: &[u8]) -> Option<u64> {
    backing
        .get(key)
        .map(|value| u64::from_le_bytes(value.as_ref().try_into().unwrap()))
}

fn manual(counts: &[usize], layout: ValueLayout) -> (Vec<PinnedAffinity>, Arc<MemoryIndex>, Nap<Arc<MemoryIndex>>) {
    let affinities = pinned_affinities(counts);
    let backing = Arc::new(MemoryIndex::new());
    let nap = Nap::builder(Arc::clone(&backing))
        .affinities(&affinities)
        .value_layout(layout)
        .background_rotation(false)
        .build()
        .unwrap();
    (affinities, backing, nap)
}

#[test]
fn cold_keys_go_to_the_backing_index() {
    let (affinities, backing, nap) = manual(&[2], ValueLayout::Fixed8);

    nap.put(affinities[0], b"k", &word(5), false);
    assert_eq!(backing_word(&backing, b"k"), Some(5));
    assert_eq!(read_word(&nap, affinities[1], b"k"), Some(5));

    nap.del(affinities[1], b"k");
    assert!(backing.is_empty());
    assert_eq!(nap.get(affinities[0], b"k"), None);
}

#[test]
fn promoted_keys_are_hits() {
    let (affinities, _backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.put(affinities[0], b"hot", &word(1), false);
    nap.put(affinities[0], b"cold", &word(2), false);

    assert_eq!(nap.rotate_to([b"hot"]), 2);
    assert_eq!(nap.epoch(), 2);
    assert!(nap.is_hot(b"hot"));
    assert!(!nap.is_hot(b"cold"));

    nap.clear();
    assert_eq!(read_word(&nap, affinities[0], b"hot"), Some(1));
    assert!((nap.hit_ratio() - 1.0).abs() < f64::EPSILON);

    assert_eq!(read_word(&nap, affinities[0], b"cold"), Some(2));
    assert!((nap.hit_ratio() - 0.5).abs() < f64::EPSILON);

    nap.clear();
    assert!((nap.hit_ratio() - 0.0).abs() < f64::EPSILON);
}

#[test]
fn hot_writes_reach_the_backing_index_on_recovery() {
    let (affinities, backing, nap) = manual(&[2], ValueLayout::Fixed8);
    nap.put(affinities[0], b"k", &word(1), false);
    nap.rotate_to([b"k"]);

    nap.put(affinities[1], b"k", &word(2), true);
    assert_eq!(read_word(&nap, affinities[0], b"k"), Some(2));
    assert_eq!(backing_word(&backing, b"k"), Some(1));

    nap.recovery();
    assert_eq!(backing_word(&backing, b"k"), Some(2));
}

#[test]
fn rotation_carries_cached_values_forward() {
    let (affinities, backing, nap) = manual(&[1, 1], ValueLayout::Fixed8);
    let (near, far) = (affinities[0], affinities[1]);

    nap.rotate_to([b"a", b"b"]);
    nap.put(near, b"a", &word(10), false);
    nap.put(far, b"b", &word(20), false);

    nap.rotate_to([b"a", b"c"]);

    // `b` left the hot set and was written back; `a` moved into the new epoch.
    assert_eq!(backing_word(&backing, b"b"), Some(20));
    assert_eq!(read_word(&nap, far, b"a"), Some(10));
    assert_eq!(read_word(&nap, near, b"b"), Some(20));
    assert_eq!(nap.get(near, b"c"), None);

    nap.put(far, b"a", &word(11), true);
    nap.put(near, b"b", &word(21), true);
    assert_eq!(backing_word(&backing, b"b"), Some(21));
    assert_eq!(read_word(&nap, near, b"a"), Some(11));
}

#[test]
fn unloaded_previous_entries_come_from_the_backing_index() {
    let (affinities, backing, nap) = manual(&[1], ValueLayout::Fixed8);

    nap.rotate_to([b"a"]);
    backing.put(b"a", &word(3), false);
    nap.rotate_to([b"a", b"z"]);

    assert_eq!(read_word(&nap, affinities[0], b"a"), Some(3));
}

#[test]
fn hot_deletions_are_written_back() {
    let (affinities, backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.put(affinities[0], b"k", &word(1), false);
    nap.rotate_to([b"k"]);

    nap.del(affinities[0], b"k");
    assert_eq!(nap.get(affinities[0], b"k"), None);
    assert_eq!(backing_word(&backing, b"k"), Some(1));

    nap.rotate_to([b"other"]);
    assert_eq!(backing.get(b"k"), None);
    assert_eq!(nap.get(affinities[0], b"k"), None);

    nap.put(affinities[0], b"k", &word(2), false);
    assert_eq!(backing_word(&backing, b"k"), Some(2));
}

#[test]
fn deleting_then_rewriting_a_hot_key() {
    let (affinities, backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.rotate_to([b"k"]);

    nap.put(affinities[0], b"k", &word(1), false);
    nap.del(affinities[0], b"k");
    nap.put(affinities[0], b"k", &word(4), false);
    assert_eq!(read_word(&nap, affinities[0], b"k"), Some(4));

    nap.recovery();
    assert_eq!(backing_word(&backing, b"k"), Some(4));
}

#[test]
fn drop_writes_back_hot_values() {
    let (affinities, backing, nap) = manual(&[2], ValueLayout::Fixed8);
    nap.rotate_to([b"x", b"y"]);
    nap.put(affinities[0], b"x", &word(7), false);
    nap.put(affinities[1], b"y", &word(8), false);
    assert!(backing.is_empty());

    drop(nap);
    assert_eq!(backing_word(&backing, b"x"), Some(7));
    assert_eq!(backing_word(&backing, b"y"), Some(8));
}

#[test]
fn variable_layout_values() {
    let (affinities, backing, nap) = manual(&[1, 1], ValueLayout::Variable);
    nap.rotate_to([b"v"]);

    let largest = vec![0xAB; crate::MAX_VARIABLE_VALUE_LEN];
    nap.put(affinities[0], b"v", b"short", false);
    nap.put(affinities[1], b"v", &largest, true);
    assert_eq!(nap.get(affinities[0], b"v").as_deref(), Some(largest.as_slice()));

    nap.put(affinities[0], b"v", b"", true);
    assert_eq!(nap.get(affinities[1], b"v").as_deref(), Some(b"".as_slice()));

    nap.put(affinities[1], b"v", b"final", true);
    drop(nap);
    assert_eq!(backing.get(b"v").as_deref(), Some(b"final".as_slice()));
}

#[test]
#[should_panic(expected = "exactly 8 bytes")]
fn fixed_layout_rejects_other_sizes() {
    let (affinities, _backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.put(affinities[0], b"k", b"too long for a word", false);
}

#[test]
#[should_panic(expected = "exceed the hot-key capacity")]
fn rotation_beyond_capacity_panics() {
    let affinities = pinned_affinities(&[1]);
    let nap = Nap::builder(MemoryIndex::new())
        .affinities(&affinities)
        .hot_keys(2)
        .background_rotation(false)
        .build()
        .unwrap();
    nap.rotate_to([b"a", b"b", b"c"]);
}

#[test]
#[should_panic(expected = "at least 1")]
fn zero_sampling_interval_panics() {
    let (_affinities, _backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.set_sampling_interval(0);
}

#[test]
fn debug_shows_the_epoch() {
    let (_affinities, _backing, nap) = manual(&[1], ValueLayout::Fixed8);
    nap.rotate_to([b"k"]);
    let debug = format!("{nap:?}");
    assert!(debug.contains("epoch: 2"), "{debug}");
}

#[cfg(feature = "range")]
#[test]
fn range_queries_see_cached_hot_values() {
    let (affinities, _backing, nap) = manual(&[1], ValueLayout::Fixed8);
    let affinity = affinities[0];
    nap.rotate_to([b"a", b"b", b"c", b"d"]);

    nap.put(affinity, b"a", &word(1), false);
    nap.put(affinity, b"c", &word(3), false);
    nap.put(affinity, b"d", &word(4), false);
    nap.del(affinity, b"d");

    let found = nap.internal_query(affinity, b"b", 10);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, b"c".to_vec());
    assert_eq!(found[0].1.as_ref(), word(3).as_slice());

    assert_eq!(nap.range_query(affinity, b"", 1).len(), 1);
    assert_eq!(nap.range_query(affinity, b"", 10).len(), 2);
}

#[test]
fn workers_never_lose_their_writes_across_rotations() {
    const WORKERS: usize = 4;
    const ROUNDS: u64 = 2_000;

    testing_aids::execute_or_abandon(|| {
        let (affinities, backing, nap) = manual(&[2, 2], ValueLayout::Fixed8);
        let nap = Arc::new(nap);
        let done = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = affinities
            .iter()
            .copied()
            .enumerate()
            .map(|(worker, affinity)| {
                let nap = Arc::clone(&nap);
                std::thread::spawn(move || {
                    let keys: Vec<Vec<u8>> = (0..4).map(|i| format!("w{worker}-{i}").into_bytes()).collect();
                    for round in 1..=ROUNDS {
                        for key in &keys {
                            nap.put(affinity, key, &word(round), round > 1);
                            assert_eq!(read_word(&nap, affinity, key), Some(round));
                        }
                        let _ = nap.get(affinity, b"shared");
                    }
                    keys
                })
            })
            .collect();

        let rotator = {
            let nap = Arc::clone(&nap);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut rotations = 0_usize;
                while !done.load(Ordering::Acquire) {
                    let worker = rotations % WORKERS;
                    let keys = [
                        format!("w{worker}-0"),
                        format!("w{worker}-1"),
                        format!("w{}-2", (worker + 1) % WORKERS),
                        "shared".to_owned(),
                    ];
                    nap.rotate_to(&keys);
                    rotations += 1;
                }
                rotations
            })
        };

        let keys: Vec<Vec<Vec<u8>>> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();
        done.store(true, Ordering::Release);
        let rotations = rotator.join().unwrap();
        assert!(rotations > 0);

        let nap = Arc::into_inner(nap).unwrap();
        drop(nap);
        for key in keys.iter().flatten() {
            assert_eq!(backing_word(&backing, key), Some(ROUNDS), "{}", String::from_utf8_lossy(key));
        }
    })
    .unwrap();
}

#[test]
fn concurrent_puts_to_a_hot_key_collapse_into_the_one_in_flight() {
    testing_aids::execute_or_abandon(|| {
        let (affinities, backing, nap) = manual(&[2], ValueLayout::Fixed8);
        nap.put(affinities[0], b"k", &word(1), false);
        nap.rotate_to([b"k"]);
        nap.put(affinities[0], b"k", &word(2), true);

        std::thread::scope(|scope| {
            let collapsed = nap.while_putting(b"k", || {
                let collapsed = scope.spawn(|| nap.put(affinities[1], b"k", &word(3), true));
                std::thread::sleep(Duration::from_millis(100));
                assert!(!collapsed.is_finished(), "the second put did not wait for the first");
                collapsed
            });
            collapsed.join().unwrap();
        });

        // The waiting put returned without writing its own value.
        assert_eq!(read_word(&nap, affinities[0], b"k"), Some(2));
        nap.recovery();
        assert_eq!(backing_word(&backing, b"k"), Some(2));

        // With nothing in flight, the next put is applied.
        nap.put(affinities[1], b"k", &word(4), true);
        assert_eq!(read_word(&nap, affinities[0], b"k"), Some(4));
    })
    .unwrap();
}
