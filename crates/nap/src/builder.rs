// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration of a [`Nap`] cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Duration;

use parking_lot::Mutex;
use thread_aware::affinity::PinnedAffinity;

use crate::cow::CowAllocator;
use crate::epoch::{EpochSlots, EpochSnapshot};
use crate::error::{Error, Result};
use crate::index::BackingIndex;
use crate::nap::{Nap, Shared, duration_nanos};
use crate::pool::{EpochRoot, PersistentPool, PoolHeader};
use crate::read_friendly_lock::ReadFriendlyLock;
use crate::recovery;
use crate::rotation::{self, RotationPolicy, RotationState};
use crate::sketch::{FrequencySketch, SampleBuffers};
use crate::store::ValueLayout;
use crate::topology::Topology;

const DEFAULT_HOT_KEYS: usize = 100_000;
const DEFAULT_SWITCH_INTERVAL: Duration = Duration::from_secs(5);

/// Builder for configuring a [`Nap`] cache.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use nap::{MemoryIndex, Nap, ValueLayout};
/// use thread_aware::affinity::pinned_affinities;
///
/// let affinities = pinned_affinities(&[2, 2]);
/// let nap = Nap::builder(MemoryIndex::new())
///     .affinities(&affinities)
///     .hot_keys(1_000)
///     .sampling_interval(4)
///     .switch_interval(Duration::from_secs(1))
///     .value_layout(ValueLayout::Variable)
///     .build()?;
///
/// nap.put(affinities[3], b"key", b"a longer value", false);
/// assert_eq!(nap.get(affinities[0], b"key").as_deref(), Some(b"a longer value".as_slice()));
/// # Ok::<(), nap::Error>(())
/// ```
pub struct NapBuilder<B> {
    backing: B,
    affinities: Vec<PinnedAffinity>,
    hot_keys: usize,
    sampling_interval: u64,
    switch_interval: Duration,
    layout: ValueLayout,
    pool_dir: Option<PathBuf>,
    policy: RotationPolicy,
    background_rotation: bool,
}

impl<B> std::fmt::Debug for NapBuilder<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NapBuilder")
            .field("affinities", &self.affinities)
            .field("hot_keys", &self.hot_keys)
            .field("sampling_interval", &self.sampling_interval)
            .field("switch_interval", &self.switch_interval)
            .field("layout", &self.layout)
            .field("pool_dir", &self.pool_dir)
            .field("background_rotation", &self.background_rotation)
            .finish_non_exhaustive()
    }
}

impl<B: BackingIndex> NapBuilder<B> {
    /// Creates a builder in front of `backing` with default settings.
    ///
    /// You must call [`affinities()`](Self::affinities) before [`build()`](Self::build).
    ///
    /// Defaults:
    /// - `hot_keys`: 100 000
    /// - `sampling_interval`: 1 (every operation is sampled)
    /// - `switch_interval`: 5 seconds
    /// - `value_layout`: [`ValueLayout::Fixed8`]
    /// - `pool_dir`: none (anonymous memory)
    /// - `min_hot_frequency`: 100, `min_skew_ratio`: 3, `max_overlap_ratio`: 0.75
    /// - `background_rotation`: enabled
    pub(crate) fn new(backing: B) -> Self {
        Self {
            backing,
            affinities: Vec::new(),
            hot_keys: DEFAULT_HOT_KEYS,
            sampling_interval: 1,
            switch_interval: DEFAULT_SWITCH_INTERVAL,
            layout: ValueLayout::default(),
            pool_dir: None,
            policy: RotationPolicy::default(),
            background_rotation: true,
        }
    }

    /// Sets the worker affinities.
    ///
    /// Every thread calling into the cache passes one of these affinities, and no two threads may
    /// use the same affinity at the same time. The processor index of an affinity selects the
    /// worker's bookkeeping slot; its memory region index selects the NUMA replica the worker
    /// writes to.
    #[must_use]
    pub fn affinities(mut self, affinities: &[PinnedAffinity]) -> Self {
        self.affinities = affinities.to_vec();
        self
    }

    /// Sets how many keys an epoch may hold.
    #[must_use]
    pub const fn hot_keys(mut self, hot_keys: usize) -> Self {
        self.hot_keys = hot_keys;
        self
    }

    /// Samples one in every `interval` operations of each worker for hot-key estimation.
    #[must_use]
    pub const fn sampling_interval(mut self, interval: u64) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets how long each round of traffic observation lasts before a rotation is considered.
    #[must_use]
    pub const fn switch_interval(mut self, interval: Duration) -> Self {
        self.switch_interval = interval;
        self
    }

    /// Sets the persistent layout of hot values.
    #[must_use]
    pub const fn value_layout(mut self, layout: ValueLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Backs the persistent pools with files under `dir` instead of anonymous memory.
    ///
    /// Each NUMA node gets a `node-<n>` subdirectory holding that node's value replicas and
    /// copy-on-write blocks. When the cache is built, hot values an earlier process left there
    /// without writing them back are written to the backing index, and an interrupted rotation
    /// recorded there is reported and discarded.
    #[must_use]
    pub fn pool_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.pool_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Skips rotations whose hottest candidate was seen fewer than `frequency` times in a round.
    #[must_use]
    pub const fn min_hot_frequency(mut self, frequency: u32) -> Self {
        self.policy.min_frequency = frequency;
        self
    }

    /// Skips rotations unless the hottest candidate is at least `ratio` times hotter than the
    /// coldest one.
    #[must_use]
    pub const fn min_skew_ratio(mut self, ratio: u32) -> Self {
        self.policy.min_skew = ratio;
        self
    }

    /// Skips rotations whose candidates overlap the current hot set by more than `ratio` of the
    /// hot-key capacity.
    #[must_use]
    pub const fn max_overlap_ratio(mut self, ratio: f64) -> Self {
        self.policy.max_overlap = ratio;
        self
    }

    /// Enables or disables the background rotation thread.
    ///
    /// Without it, epochs only change through [`Nap::rotate_to`].
    #[must_use]
    pub const fn background_rotation(mut self, enabled: bool) -> Self {
        self.background_rotation = enabled;
        self
    }

    /// Builds the cache and, unless disabled, starts its rotation thread.
    ///
    /// # Errors
    ///
    /// Returns an error if no affinities were set, two affinities share a processor index, a
    /// setting is out of range, the pool directory cannot be recovered, prepared or mapped, or the
    /// rotation thread cannot be spawned.
    pub fn build(self) -> Result<Nap<B>> {
        if self.hot_keys == 0 {
            return Err(Error::from_message("hot_keys must be at least 1"));
        }
        if self.sampling_interval == 0 {
            return Err(Error::from_message("sampling_interval must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.policy.max_overlap) {
            return Err(Error::from_message(format!(
                "max_overlap_ratio must lie in [0, 1], got {}",
                self.policy.max_overlap
            )));
        }

        let topology = Topology::new(&self.affinities)?;
        if let Some(dir) = &self.pool_dir {
            let recovered = recovery::write_back(dir, &self.backing)?;
            if recovered.removed > 0 {
                tracing::info!(
                    epochs = recovered.epochs,
                    values = recovered.values,
                    files = recovered.removed,
                    "recovered the pools of an earlier process"
                );
            }
        }
        let pools = (0..topology.numa_nodes())
            .map(|node| PersistentPool::open(node, self.pool_dir.as_deref()))
            .collect::<Result<Vec<_>>>()?;
        let header = PoolHeader::open(&pools[0])?;
        let cow = Arc::new(CowAllocator::new(pools, topology.slots()));

        let initial = EpochSnapshot::new(1, &[], self.layout, Arc::clone(&cow))?;
        header.store_root(EpochRoot {
            current: 1,
            ..EpochRoot::default()
        })?;

        let samples = Arc::new(SampleBuffers::new(topology.slots()));
        let workers = topology.affinities().len();
        let numa_nodes = topology.numa_nodes();

        let shared = Arc::new(Shared {
            fallback: ReadFriendlyLock::new(topology.slots()),
            slots: EpochSlots::new(Box::new(initial)),
            rotation: Mutex::new(RotationState::default()),
            samples: Arc::clone(&samples),
            sampling_interval: AtomicU64::new(self.sampling_interval),
            switch_interval: AtomicU64::new(duration_nanos(self.switch_interval)),
            stop: AtomicBool::new(false),
            backing: self.backing,
            topology,
            cow,
            header,
            policy: self.policy,
            layout: self.layout,
            hot_keys: self.hot_keys,
        });

        let rotation = if self.background_rotation {
            let sketch = FrequencySketch::new(samples, self.hot_keys);
            let shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("nap-rotation".to_owned())
                    .spawn(move || rotation::run(&shared, sketch))
                    .map_err(Error::from_message)?,
            )
        } else {
            None
        };

        tracing::info!(
            workers,
            numa_nodes,
            hot_keys = self.hot_keys,
            layout = ?self.layout,
            file_backed = self.pool_dir.is_some(),
            "nap cache started"
        );

        Ok(Nap::from_parts(shared, rotation))
    }
}

#[cfg(test)]
mod tests {
    use thread_aware::affinity::pinned_affinities;

    use super::*;
    use crate::index::MemoryIndex;

    fn builder() -> NapBuilder<MemoryIndex> {
        Nap::builder(MemoryIndex::new())
            .affinities(&pinned_affinities(&[1]))
            .background_rotation(false)
    }

    #[test]
    fn defaults_build() {
        let nap = builder().build().unwrap();
        assert_eq!(nap.epoch(), 1);
        assert!((nap.hit_ratio() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        builder().hot_keys(0).build().unwrap_err();
        builder().sampling_interval(0).build().unwrap_err();
        builder().max_overlap_ratio(1.5).build().unwrap_err();
        builder().max_overlap_ratio(f64::NAN).build().unwrap_err();
        Nap::builder(MemoryIndex::new()).build().unwrap_err();
    }

    #[test]
    fn debug_lists_settings() {
        let debug = format!("{:?}", builder().hot_keys(17));
        assert!(debug.contains("hot_keys: 17"), "{debug}");
    }

    #[test]
    fn file_backed_pools_are_created_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let nap = Nap::builder(MemoryIndex::new())
            .affinities(&pinned_affinities(&[1, 1]))
            .pool_dir(dir.path())
            .build()
            .unwrap();

        assert!(dir.path().join("node-0").join("header").exists());
        assert!(dir.path().join("node-1").is_dir());
        drop(nap);
    }
}
