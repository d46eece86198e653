// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thread_aware::affinity::PinnedAffinity;

use crate::builder::NapBuilder;
use crate::cow::CowAllocator;
use crate::entry_lock::PutContention;
use crate::epoch::{EpochSlots, Snapshot};
use crate::error::fatal;
use crate::index::BackingIndex;
use crate::pool::PoolHeader;
use crate::read_friendly_lock::ReadFriendlyLock;
use crate::rotation::{self, RotationPolicy, RotationState};
use crate::sketch::SampleBuffers;
use crate::spin::spin_once;
use crate::store::{FIXED_VALUE_LEN, MAX_VARIABLE_VALUE_LEN, ValueLayout};
use crate::topology::Topology;
use crate::view::{Entry, Location};

/// Attempts a `get` may retry before the cache gives up and aborts.
const MAX_GET_RETRIES: usize = 10_000;

/// State shared between the cache handle and its rotation thread.
pub(crate) struct Shared<B> {
    pub backing: B,
    pub topology: Topology,
    pub slots: EpochSlots,
    /// Keeps backing-index fallbacks from overlapping the installation of a new epoch.
    pub fallback: ReadFriendlyLock,
    pub samples: Arc<SampleBuffers>,
    pub cow: Arc<CowAllocator>,
    pub header: PoolHeader,
    pub rotation: Mutex<RotationState>,
    pub policy: RotationPolicy,
    pub layout: ValueLayout,
    pub hot_keys: usize,
    pub sampling_interval: AtomicU64,
    pub switch_interval: AtomicU64,
    pub stop: AtomicBool,
}

impl<B> Shared<B> {
    pub(crate) fn switch_interval(&self) -> Duration {
        Duration::from_nanos(self.switch_interval.load(Ordering::Relaxed))
    }
}

pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// What a hot-path handler asks the router to do next.
enum Step<R> {
    Done(R),
    /// The handler met an entry of a draining epoch; take a fresh snapshot.
    Retry,
}

/// A NUMA-aware cache of hot keys in front of a [`BackingIndex`].
///
/// `Nap` watches the keys its workers touch and periodically rotates a fixed set of the hottest
/// ones into a new *epoch*: a hot-key view plus persistent per-NUMA-node value replicas. Operations
/// on hot keys are served from the current epoch; every other key goes straight to the backing
/// index. Writes to hot keys stay in the cache until the epoch is rotated out or the cache is
/// dropped, at which point they are written back.
///
/// Every call names the calling worker through a [`PinnedAffinity`] registered with
/// [`NapBuilder::affinities`]. Different threads must use different affinities at the same time.
///
/// # Examples
///
/// ```
/// use nap::{MemoryIndex, Nap};
/// use thread_aware::affinity::pinned_affinities;
///
/// let affinities = pinned_affinities(&[2]);
/// let nap = Nap::builder(MemoryIndex::new()).affinities(&affinities).build()?;
///
/// nap.put(affinities[0], b"key", &42_u64.to_le_bytes(), false);
/// assert_eq!(nap.get(affinities[1], b"key").as_deref(), Some(42_u64.to_le_bytes().as_slice()));
///
/// nap.del(affinities[1], b"key");
/// assert_eq!(nap.get(affinities[0], b"key"), None);
/// # Ok::<(), nap::Error>(())
/// ```
pub struct Nap<B: BackingIndex> {
    shared: Arc<Shared<B>>,
    rotation: Option<JoinHandle<()>>,
}

impl<B: BackingIndex> std::fmt::Debug for Nap<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nap")
            .field("epoch", &self.epoch())
            .field("workers", &self.shared.topology.affinities().len())
            .field("numa_nodes", &self.shared.topology.numa_nodes())
            .field("layout", &self.shared.layout)
            .field("background_rotation", &self.rotation.is_some())
            .finish_non_exhaustive()
    }
}

impl<B: BackingIndex> Nap<B> {
    /// Starts configuring a cache in front of `backing`.
    #[must_use]
    pub fn builder(backing: B) -> NapBuilder<B> {
        NapBuilder::new(backing)
    }

    pub(crate) fn from_parts(shared: Arc<Shared<B>>, rotation: Option<JoinHandle<()>>) -> Self {
        Self { shared, rotation }
    }

    /// The backing index behind the cache.
    ///
    /// Writes to hot keys reach it only when their epoch is rotated out, on
    /// [`recovery`](Self::recovery), or when the cache is dropped.
    #[must_use]
    pub fn backing(&self) -> &B {
        &self.shared.backing
    }

    /// Writes `value` under `key`.
    ///
    /// `is_update` is passed through to the backing index when the key is not hot.
    ///
    /// When another worker is already writing the same hot key, this call waits for that write and
    /// returns without applying its own value: the two writes are treated as one.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is not one of the cache's workers, or if the cache uses
    /// [`ValueLayout::Fixed8`] and `value` is not exactly eight bytes long.
    ///
    /// Aborts the process if the cache uses [`ValueLayout::Variable`] and `value` is longer than
    /// [`MAX_VARIABLE_VALUE_LEN`].
    pub fn put(&self, affinity: PinnedAffinity, key: &[u8], value: &[u8], is_update: bool) {
        match self.shared.layout {
            ValueLayout::Fixed8 => assert_eq!(
                value.len(),
                FIXED_VALUE_LEN,
                "the fixed layout stores values of exactly {FIXED_VALUE_LEN} bytes"
            ),
            ValueLayout::Variable => {
                if value.len() > MAX_VARIABLE_VALUE_LEN {
                    fatal(&format!(
                        "a {}-byte value exceeds the {MAX_VARIABLE_VALUE_LEN}-byte limit of the variable layout",
                        value.len()
                    ));
                }
            }
        }

        let worker = self.shared.topology.slot_of(affinity);
        let node = affinity.memory_region_index();

        self.route(
            worker,
            key,
            None,
            |snapshot, entry| {
                let mut spins = 0;
                let mut state = loop {
                    match entry.state.try_put() {
                        Ok(state) => break state,
                        Err(PutContention::PutInFlight) => {
                            entry.state.wait_unlocked();
                            return Step::Done(());
                        }
                        Err(PutContention::Busy) => spin_once(&mut spins),
                    }
                };
                if state.migrating {
                    return Step::Retry;
                }
                if state.location == Location::InPreviousEpoch {
                    mark_migrating(snapshot, key);
                }

                let version = state.next_version();
                snapshot.current.store().update(node, worker, entry.slot(), version, Some(value));
                state.value = Bytes::copy_from_slice(value);
                state.deleted = false;
                state.advance(Location::InCurrentEpoch);
                Step::Done(())
            },
            || self.shared.backing.put(key, value, is_update),
        );
    }

    /// Reads the value of `key`.
    ///
    /// The first read of a hot key in a new epoch loads it from the draining epoch or the backing
    /// index; later reads are served from the cached copy.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is not one of the cache's workers.
    #[must_use]
    pub fn get(&self, affinity: PinnedAffinity, key: &[u8]) -> Option<Bytes> {
        let worker = self.shared.topology.slot_of(affinity);
        let backing = &self.shared.backing;

        self.route(
            worker,
            key,
            Some(MAX_GET_RETRIES),
            |snapshot, entry| {
                {
                    let state = entry.state.read();
                    if state.migrating {
                        return Step::Retry;
                    }
                    if state.location == Location::InCurrentEpoch {
                        return Step::Done(state.visible());
                    }
                }

                let mut state = entry.state.write();
                if state.migrating {
                    return Step::Retry;
                }
                match state.location {
                    Location::InCurrentEpoch => {}
                    Location::InPreviousEpoch => match snapshot.previous.and_then(|previous| previous.view().lookup(key)) {
                        Some(previous) => {
                            let mut old = previous.state.write();
                            old.migrating = true;
                            if old.location == Location::InCurrentEpoch {
                                state.value = old.value.clone();
                                state.deleted = old.deleted;
                            } else {
                                state.fill(backing.get(key));
                            }
                        }
                        None => state.fill(backing.get(key)),
                    },
                    Location::InBackingIndex => state.fill(backing.get(key)),
                }
                state.advance(Location::InCurrentEpoch);
                Step::Done(state.visible())
            },
            || backing.get(key),
        )
    }

    /// Deletes `key`.
    ///
    /// A hot key is marked deleted in the current epoch and the deletion reaches the backing index
    /// when the epoch is written back.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is not one of the cache's workers.
    pub fn del(&self, affinity: PinnedAffinity, key: &[u8]) {
        let worker = self.shared.topology.slot_of(affinity);
        let node = affinity.memory_region_index();

        self.route(
            worker,
            key,
            None,
            |snapshot, entry| {
                let mut state = entry.state.write();
                if state.migrating {
                    return Step::Retry;
                }
                if state.location == Location::InPreviousEpoch {
                    mark_migrating(snapshot, key);
                }

                let version = state.next_version();
                snapshot.current.store().update(node, worker, entry.slot(), version, None);
                state.value = Bytes::new();
                state.deleted = true;
                state.advance(Location::InCurrentEpoch);
                Step::Done(())
            },
            || self.shared.backing.del(key),
        );
    }

    /// Writes every hot value of the current epoch back to the backing index.
    ///
    /// Meant for quiescent points such as before a planned shutdown: writes racing with the
    /// write-back may or may not be included.
    pub fn recovery(&self) {
        let state = self.shared.rotation.lock();
        let current = self.shared.slots.current(&*state);
        let flushed = current.store().flush_to(&self.shared.backing);
        tracing::info!(epoch = current.epoch(), flushed, "wrote the current epoch back to the backing index");
    }

    /// The share of operations since the last [`clear`](Self::clear) that touched a hot key.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "a ratio does not need every low bit")]
    pub fn hit_ratio(&self) -> f64 {
        let (hits, operations) = self.shared.topology.counters();
        if operations == 0 {
            return 0.0;
        }
        hits as f64 / operations as f64
    }

    /// Resets the hit and operation counters.
    pub fn clear(&self) {
        self.shared.topology.clear_counters();
    }

    /// Samples one in every `interval` operations of each worker for hot-key estimation.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn set_sampling_interval(&self, interval: u64) {
        assert!(interval > 0, "the sampling interval must be at least 1");
        self.shared.sampling_interval.store(interval, Ordering::Relaxed);
    }

    /// Sets how long the next rounds of traffic observation last.
    pub fn set_switch_interval(&self, interval: Duration) {
        self.shared.switch_interval.store(duration_nanos(interval), Ordering::Relaxed);
    }

    /// The number of the serving epoch. The cache starts at epoch 1 with no hot keys.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.slots.epoch()
    }

    /// Whether `key` belongs to the serving epoch's hot set.
    #[must_use]
    pub fn is_hot(&self, key: &[u8]) -> bool {
        self.shared.rotation.lock().is_hot(key)
    }

    /// Rotates to a new epoch holding exactly `keys`, bypassing traffic observation.
    ///
    /// Blocks until the previous epoch has been drained and reclaimed. Returns the new epoch
    /// number. Mostly useful with [`NapBuilder::background_rotation`] disabled, when the caller
    /// decides what is hot.
    ///
    /// # Panics
    ///
    /// Panics if `keys` holds more distinct keys than the configured hot-key capacity.
    pub fn rotate_to<K: AsRef<[u8]>>(&self, keys: impl IntoIterator<Item = K>) -> u64 {
        let mut state = self.shared.rotation.lock();
        let plan = state.plan(keys.into_iter().map(|key| key.as_ref().to_vec()).collect());
        assert!(
            plan.keys.len() <= self.shared.hot_keys,
            "{} keys exceed the hot-key capacity of {}",
            plan.keys.len(),
            self.shared.hot_keys
        );
        rotation::rotate(&self.shared, &mut state, plan)
    }

    /// Returns up to `count` live hot values with keys at or after `start`, in key order.
    ///
    /// Only keys of the serving epoch whose value is already cached are visited, so the result is
    /// a best-effort view rather than a scan of the backing index.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is not one of the cache's workers.
    #[cfg(feature = "range")]
    #[cfg_attr(docsrs, doc(cfg(feature = "range")))]
    #[must_use]
    pub fn range_query(&self, affinity: PinnedAffinity, start: &[u8], count: usize) -> Vec<Bytes> {
        self.internal_query(affinity, start, count)
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Like [`range_query`](Self::range_query), returning keys along with the values.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` is not one of the cache's workers.
    #[cfg(feature = "range")]
    #[cfg_attr(docsrs, doc(cfg(feature = "range")))]
    #[must_use]
    pub fn internal_query(&self, affinity: PinnedAffinity, start: &[u8], count: usize) -> Vec<(Vec<u8>, Bytes)> {
        let worker = self.shared.topology.slot_of(affinity);
        let session = self.shared.topology.thread(worker).enter();

        let mut spins = 0;
        let snapshot = loop {
            match self.shared.slots.try_snapshot(&session) {
                Some(snapshot) => break snapshot,
                None => spin_once(&mut spins),
            }
        };
        session.observe(snapshot.epoch);

        snapshot
            .current
            .view()
            .scan(start, usize::MAX)
            .filter_map(|(key, entry)| {
                let state = entry.state.read();
                (state.location == Location::InCurrentEpoch && !state.deleted).then(|| (key.to_vec(), state.value.clone()))
            })
            .take(count)
            .collect()
    }

    /// Runs one operation: samples it, then hands hot keys to `hot` and everything else to `cold`.
    ///
    /// A key that is only in the draining epoch waits, outside the cache, for the drain to finish
    /// and is then routed again. `cold` runs under the fallback lock after checking that no epoch
    /// was installed since the snapshot was taken.
    fn route<R>(
        &self,
        worker: usize,
        key: &[u8],
        retry_limit: Option<usize>,
        mut hot: impl FnMut(&Snapshot<'_>, &Entry) -> Step<R>,
        cold: impl FnOnce() -> R,
    ) -> R {
        let shared = &*self.shared;
        let mut session = shared.topology.thread(worker).enter();
        if session.sequence() % shared.sampling_interval.load(Ordering::Relaxed).max(1) == 0 {
            shared.samples.record(worker, key);
        }

        let mut counted_hit = false;
        let mut retries = 0;
        let mut spins = 0;
        loop {
            let Some(snapshot) = shared.slots.try_snapshot(&session) else {
                spin_once(&mut spins);
                continue;
            };
            session.observe(snapshot.epoch);

            if let Some(entry) = snapshot.current.view().lookup(key) {
                if !counted_hit {
                    session.record_hit();
                    counted_hit = true;
                }
                if let Step::Done(result) = hot(&snapshot, entry) {
                    return result;
                }
            } else if snapshot
                .previous
                .is_some_and(|previous| previous.view().lookup(key).is_some())
            {
                session.wait_outside(|| !shared.slots.has_previous());
            } else {
                let _reader = shared.fallback.read(worker);
                if shared.slots.sequence() == snapshot.sequence {
                    return cold();
                }
            }

            retries += 1;
            if retry_limit.is_some_and(|limit| retries >= limit) {
                fatal(&format!("an operation was retried {retries} times without completing"));
            }
        }
    }
}

#[cfg(test)]
impl<B: BackingIndex> Nap<B> {
    /// Runs `during` while holding hot `key` in the put-intent state, as a put in flight would.
    pub(crate) fn while_putting<R>(&self, key: &[u8], during: impl FnOnce() -> R) -> R {
        let state = self.shared.rotation.lock();
        let entry = self
            .shared
            .slots
            .current(&*state)
            .view()
            .lookup(key)
            .expect("the key is not hot");
        let _put = entry.state.try_put().expect("the entry is not free for a put");
        during()
    }
}

/// Flags the draining epoch's entry for `key`, so that workers still on the old snapshot retry in
/// the new one.
fn mark_migrating(snapshot: &Snapshot<'_>, key: &[u8]) {
    if let Some(previous) = snapshot.previous.and_then(|previous| previous.view().lookup(key)) {
        previous.state.write().migrating = true;
    }
}

impl<B: BackingIndex> Drop for Nap<B> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(rotation) = self.rotation.take()
            && rotation.join().is_err()
        {
            tracing::error!("the rotation thread panicked");
        }

        let state = self.shared.rotation.lock();
        let previous = self.shared.slots.previous(&*state);
        let mut flushed = 0;
        for snapshot in previous.into_iter().chain([self.shared.slots.current(&*state)]) {
            flushed += snapshot.store().flush_to(&self.shared.backing);
            if let Err(error) = snapshot.store().mark_drained() {
                tracing::warn!(epoch = snapshot.epoch(), %error, "could not mark a written-back epoch as drained");
            }
        }
        tracing::info!(flushed, "nap cache stopped");
    }
}
