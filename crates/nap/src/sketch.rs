// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Online hot-key estimation.
//!
//! Workers drop sampled keys into per-worker ring buffers ([`SampleBuffers`]). The rotation thread
//! drains those buffers round-robin into a count-min sketch and feeds each estimate into a bounded
//! top-K heap ([`FrequencySketch`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::top_k::{Candidate, TopK};

/// Capacity of each worker's sample ring.
pub(crate) const RECORD_BUFFER_SIZE: usize = 20_000;

/// Records consumed from one worker's ring before moving to the next.
pub(crate) const BATCH_PER_THREAD: usize = 8;

/// Pause after a round that found every ring drained.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

const SKETCH_WIDTH: usize = 876_199;
const HASH_SEEDS: [u64; 3] = [931_901, 1_974_701, 7_296_907];

#[derive(Debug, Default)]
struct SampleRecord {
    /// Zero means never written.
    timestamp: u64,
    key: Vec<u8>,
}

#[derive(Debug)]
struct SampleRing {
    records: Box<[SampleRecord]>,
    next: usize,
}

impl SampleRing {
    fn new() -> Self {
        Self {
            records: (0..RECORD_BUFFER_SIZE).map(|_| SampleRecord::default()).collect(),
            next: 0,
        }
    }
}

/// One sample ring per worker slot.
#[derive(Debug)]
pub(crate) struct SampleBuffers {
    rings: Box<[Mutex<SampleRing>]>,
    origin: Instant,
}

impl SampleBuffers {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            rings: (0..workers).map(|_| Mutex::new(SampleRing::new())).collect(),
            origin: Instant::now(),
        }
    }

    /// Appends `key` to the ring of `worker`, overwriting the oldest record.
    ///
    /// The record's key buffer is reused, so steady-state sampling does not allocate. When the
    /// rotation thread is draining the same ring the sample is dropped and `false` is returned.
    pub(crate) fn record(&self, worker: usize, key: &[u8]) -> bool {
        let Some(mut ring) = self.rings[worker].try_lock() else {
            return false;
        };

        let timestamp = self.now();
        let next = ring.next;
        let record = &mut ring.records[next];
        record.key.clear();
        record.key.extend_from_slice(key);
        record.timestamp = timestamp;
        ring.next = (next + 1) % RECORD_BUFFER_SIZE;
        true
    }

    /// Nanoseconds since the buffers were created, never zero.
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos())
            .unwrap_or(u64::MAX)
            .saturating_add(1)
    }

    fn workers(&self) -> usize {
        self.rings.len()
    }
}

/// Read position of the rotation thread within one ring.
#[derive(Clone, Copy, Debug, Default)]
struct Cursor {
    index: usize,
    last_timestamp: u64,
}

/// Count-min sketch with three seeded xxh3 rows.
#[derive(Debug)]
struct CountMinSketch {
    rows: [Box<[u32]>; 3],
}

impl CountMinSketch {
    fn new() -> Self {
        Self {
            rows: std::array::from_fn(|_| vec![0; SKETCH_WIDTH].into_boxed_slice()),
        }
    }

    /// Counts one occurrence of `key` and returns its estimated frequency.
    fn increment(&mut self, key: &[u8]) -> u32 {
        let mut estimate = u32::MAX;
        for (row, seed) in self.rows.iter_mut().zip(HASH_SEEDS) {
            #[expect(clippy::cast_possible_truncation, reason = "the remainder is below SKETCH_WIDTH")]
            let column = (xxh3_64_with_seed(key, seed) % SKETCH_WIDTH as u64) as usize;
            let counter = &mut row[column];
            *counter = counter.saturating_add(1);
            estimate = estimate.min(*counter);
        }
        estimate
    }

    fn reset(&mut self) {
        for row in &mut self.rows {
            row.fill(0);
        }
    }
}

/// What one call to [`FrequencySketch::poll_workloads`] consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Polled {
    pub records: usize,
    /// Rounds that found nothing new in any ring.
    pub idle_rounds: usize,
}

/// The rotation thread's view of recent traffic.
#[derive(Debug)]
pub(crate) struct FrequencySketch {
    buffers: Arc<SampleBuffers>,
    cursors: Vec<Cursor>,
    counters: CountMinSketch,
    top_k: TopK,
}

impl FrequencySketch {
    pub(crate) fn new(buffers: Arc<SampleBuffers>, hot_keys: usize) -> Self {
        Self {
            cursors: vec![Cursor::default(); buffers.workers()],
            buffers,
            counters: CountMinSketch::new(),
            top_k: TopK::new(hot_keys),
        }
    }

    /// Clears the counters and the tracked candidates. Ring cursors are kept.
    pub(crate) fn reset(&mut self) {
        self.counters.reset();
        self.top_k.reset();
    }

    /// Drains the sample rings until `budget` elapses or `stop` is raised.
    ///
    /// Rings are visited round-robin, consuming at most [`BATCH_PER_THREAD`] records each per
    /// round. A record older than the last one consumed from its ring (or one never written) marks
    /// the end of the currently available data for that ring. A round that consumes nothing is
    /// followed by a short sleep, so idle rings are not locked away from their workers.
    pub(crate) fn poll_workloads(&mut self, budget: Duration, stop: &AtomicBool) -> Polled {
        let started = Instant::now();
        let buffers = Arc::clone(&self.buffers);
        let mut polled = Polled::default();

        loop {
            let before = polled.records;
            for (worker, ring) in buffers.rings.iter().enumerate() {
                let ring = ring.lock();
                for _ in 0..BATCH_PER_THREAD {
                    let cursor = self.cursors[worker];
                    let record = &ring.records[cursor.index];
                    if record.timestamp == 0 || record.timestamp < cursor.last_timestamp {
                        break;
                    }
                    self.access_key(&record.key);
                    self.cursors[worker] = Cursor {
                        index: (cursor.index + 1) % RECORD_BUFFER_SIZE,
                        last_timestamp: record.timestamp,
                    };
                    polled.records += 1;
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= budget || stop.load(Ordering::Acquire) {
                return polled;
            }
            if polled.records == before {
                polled.idle_rounds += 1;
                std::thread::sleep(IDLE_BACKOFF.min(budget - elapsed));
            }
        }
    }

    /// Counts one access to `key` and refreshes its top-K position.
    pub(crate) fn access_key(&mut self, key: &[u8]) {
        let estimate = self.counters.increment(key);
        self.top_k.access(key, estimate);
    }

    /// The tracked candidates, hottest first.
    pub(crate) fn ranked(&self) -> Vec<Candidate> {
        self.top_k.ranked()
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;
    use testing_aids::ZipfKeys;

    use super::*;

    fn sketch(workers: usize, hot_keys: usize) -> (Arc<SampleBuffers>, FrequencySketch) {
        let buffers = Arc::new(SampleBuffers::new(workers));
        let sketch = FrequencySketch::new(Arc::clone(&buffers), hot_keys);
        (buffers, sketch)
    }

    fn drain(sketch: &mut FrequencySketch) -> Polled {
        sketch.poll_workloads(Duration::from_millis(20), &AtomicBool::new(false))
    }

    #[test]
    fn count_min_never_underestimates() {
        let mut counters = CountMinSketch::new();
        let mut truth = HashMap::new();
        for i in 0..5_000_u32 {
            let key = (i % 37).to_le_bytes();
            let estimate = counters.increment(&key);
            let count = truth.entry(key).or_insert(0_u32);
            *count += 1;
            assert!(estimate >= *count);
        }

        counters.reset();
        assert_eq!(counters.increment(b"fresh"), 1);
    }

    #[test]
    fn polling_consumes_recorded_samples() {
        let (buffers, mut sketch) = sketch(2, 4);
        for _ in 0..30 {
            buffers.record(0, b"alpha");
        }
        for _ in 0..10 {
            buffers.record(1, b"beta");
        }

        assert_eq!(drain(&mut sketch).records, 40);

        let ranked = sketch.ranked();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].key, b"alpha");
        assert_eq!(ranked[0].frequency, 30);
        assert_eq!(ranked[1].frequency, 10);
    }

    #[test]
    fn records_are_consumed_once() {
        let (buffers, mut sketch) = sketch(1, 4);
        for _ in 0..5 {
            buffers.record(0, b"key");
        }
        drain(&mut sketch);
        drain(&mut sketch);
        assert_eq!(sketch.ranked()[0].frequency, 5);

        buffers.record(0, b"key");
        drain(&mut sketch);
        assert_eq!(sketch.ranked()[0].frequency, 6);

        sketch.reset();
        drain(&mut sketch);
        assert!(sketch.ranked().is_empty());
    }

    #[test]
    fn idle_rings_are_polled_with_backoff() {
        let (_buffers, mut sketch) = sketch(2, 4);
        let polled = sketch.poll_workloads(Duration::from_millis(20), &AtomicBool::new(false));

        assert_eq!(polled.records, 0);
        assert!(polled.idle_rounds >= 1);
        // Each idle round sleeps, so 20 ms holds at most one round per backoff.
        let bound = usize::try_from(Duration::from_millis(20).as_micros() / IDLE_BACKOFF.as_micros()).unwrap() + 1;
        assert!(polled.idle_rounds <= bound, "{} idle rounds", polled.idle_rounds);
    }

    #[test]
    fn samples_recorded_during_backoff_are_consumed() {
        let (buffers, mut sketch) = sketch(1, 4);
        let polled = std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(5));
                let mut recorded = 0;
                while recorded < 50 {
                    recorded += usize::from(buffers.record(0, b"late"));
                }
            });
            sketch.poll_workloads(Duration::from_millis(100), &AtomicBool::new(false))
        });

        assert_eq!(polled.records, 50);
        assert!(polled.idle_rounds >= 1);
        assert_eq!(sketch.ranked()[0].frequency, 50);
    }

    #[test]
    fn polling_stops_when_asked() {
        let (_buffers, mut sketch) = sketch(1, 4);
        let started = Instant::now();
        sketch.poll_workloads(Duration::from_secs(3600), &AtomicBool::new(true));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn lapped_ring_keeps_newest_samples() {
        let (buffers, mut sketch) = sketch(1, 2);
        for _ in 0..RECORD_BUFFER_SIZE + 100 {
            buffers.record(0, b"old");
        }
        drain(&mut sketch);
        let consumed = sketch.ranked()[0].frequency;
        assert!(consumed >= 100, "consumed {consumed}");
        assert!(usize::try_from(consumed).unwrap() <= RECORD_BUFFER_SIZE);
    }

    #[test]
    fn zipf_top_ten_recall() {
        const DISTINCT: usize = 10_000;
        const ACCESSES: usize = 200_000;

        let mut zipf = ZipfKeys::new(DISTINCT, 0.99, 7);
        let (_buffers, mut sketch) = sketch(1, 100);
        let mut truth: HashMap<u64, u32> = HashMap::new();

        for _ in 0..ACCESSES {
            let key = zipf.next_key();
            *truth.entry(key).or_default() += 1;
            sketch.access_key(&key.to_be_bytes());
        }

        let mut exact: Vec<_> = truth.into_iter().collect();
        exact.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let exact_top: Vec<[u8; 8]> = exact.iter().take(10).map(|(key, _)| key.to_be_bytes()).collect();

        let estimated = sketch.ranked();
        let found = estimated
            .iter()
            .take(10)
            .filter(|candidate| exact_top.iter().any(|key| key.as_slice() == candidate.key.as_slice()))
            .count();

        assert!(found >= 9, "top-10 recall was {found}/10");
    }
}
