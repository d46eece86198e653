// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Worker identities and the per-worker liveness table.
//!
//! Every worker is identified by a [`PinnedAffinity`]: its processor index selects its liveness
//! record, sampling buffer and read-friendly lock slot, and its memory region index selects the
//! value-store replica it writes to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thread_aware::affinity::PinnedAffinity;

use crate::error::{Error, Result};
use crate::spin::spin_until;

/// Liveness record of one worker.
///
/// Written only by the owning worker (apart from [`Topology::clear_counters`]) and read by the
/// rotation thread. Cache-line aligned so that workers never share a line.
#[repr(align(64))]
#[derive(Debug, Default)]
pub(crate) struct ThreadMeta {
    epoch: AtomicU64,
    op_seq: AtomicU64,
    operations: AtomicU64,
    hits: AtomicU64,
    in_nap: AtomicBool,
}

impl ThreadMeta {
    /// Marks the worker as inside the cache and starts a new operation.
    pub(crate) fn enter(&self) -> Session<'_> {
        self.in_nap.store(true, Ordering::SeqCst);
        let sequence = self.op_seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.operations.fetch_add(1, Ordering::Relaxed);
        Session { meta: self, sequence }
    }

    pub(crate) fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Proof that a worker is marked inside the cache.
///
/// Epoch snapshots borrowed while a session is alive stay valid until the session ends or the
/// worker steps out through [`Session::wait_outside`].
#[derive(Debug)]
pub(crate) struct Session<'a> {
    meta: &'a ThreadMeta,
    sequence: u64,
}

impl Session<'_> {
    /// The operation sequence number assigned when the session started.
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Publishes the epoch this worker is operating in.
    pub(crate) fn observe(&self, epoch: u64) {
        self.meta.epoch.store(epoch, Ordering::SeqCst);
    }

    pub(crate) fn record_hit(&self) {
        self.meta.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Leaves the cache, spins until `done` holds, then re-enters.
    ///
    /// Taking `&mut self` ends every snapshot borrowed from this session before the worker stops
    /// being counted as inside.
    pub(crate) fn wait_outside(&mut self, done: impl FnMut() -> bool) {
        self.meta.in_nap.store(false, Ordering::SeqCst);
        spin_until(done);
        self.meta.in_nap.store(true, Ordering::SeqCst);
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.meta.in_nap.store(false, Ordering::SeqCst);
    }
}

/// The runtime context built once at startup from the worker affinities.
#[derive(Debug)]
pub(crate) struct Topology {
    affinities: Box<[PinnedAffinity]>,
    threads: Box<[ThreadMeta]>,
    numa_nodes: usize,
}

impl Topology {
    /// Builds the liveness table for `affinities`.
    ///
    /// The table is indexed by processor index, so processor indices must be unique.
    pub(crate) fn new(affinities: &[PinnedAffinity]) -> Result<Self> {
        if affinities.is_empty() {
            return Err(Error::from_message("at least one worker affinity is required"));
        }

        let slots = affinities.iter().map(|a| a.processor_index()).max().unwrap_or(0) + 1;
        let mut seen = vec![false; slots];
        for affinity in affinities {
            let seen = &mut seen[affinity.processor_index()];
            if *seen {
                return Err(Error::from_message(format!(
                    "processor index {} is used by more than one worker affinity",
                    affinity.processor_index()
                )));
            }
            *seen = true;
        }

        let numa_nodes = affinities.iter().map(|a| a.memory_region_index()).max().unwrap_or(0) + 1;

        Ok(Self {
            affinities: affinities.into(),
            threads: (0..slots).map(|_| ThreadMeta::default()).collect(),
            numa_nodes,
        })
    }

    pub(crate) fn affinities(&self) -> &[PinnedAffinity] {
        &self.affinities
    }

    /// Number of liveness slots, one per processor index up to the highest one in use.
    pub(crate) fn slots(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn numa_nodes(&self) -> usize {
        self.numa_nodes
    }

    /// Returns the liveness slot of `affinity`.
    ///
    /// # Panics
    ///
    /// Panics if `affinity` was not registered with the cache.
    pub(crate) fn slot_of(&self, affinity: PinnedAffinity) -> usize {
        assert!(
            self.affinities.contains(&affinity),
            "affinity {affinity:?} is not one of the cache's worker affinities"
        );
        affinity.processor_index()
    }

    pub(crate) fn thread(&self, slot: usize) -> &ThreadMeta {
        &self.threads[slot]
    }

    /// Spins until every worker has either published `epoch` or left the cache.
    pub(crate) fn wait_for_epoch(&self, epoch: u64) {
        for meta in &self.threads {
            spin_until(|| !meta.in_nap.load(Ordering::SeqCst) || meta.epoch.load(Ordering::SeqCst) == epoch);
        }
    }

    /// Spins until every worker that is inside the cache has started a newer operation.
    ///
    /// On return no worker can still hold a reference obtained before the call.
    pub(crate) fn wait_for_quiescence(&self) {
        for meta in &self.threads {
            let seen = meta.op_seq.load(Ordering::SeqCst);
            spin_until(|| !meta.in_nap.load(Ordering::SeqCst) || meta.op_seq.load(Ordering::SeqCst) != seen);
        }
    }

    /// Hits and operations summed across workers.
    pub(crate) fn counters(&self) -> (u64, u64) {
        self.threads
            .iter()
            .fold((0, 0), |(hits, ops), meta| (hits + meta.hits(), ops + meta.operations()))
    }

    pub(crate) fn clear_counters(&self) {
        for meta in &self.threads {
            meta.hits.store(0, Ordering::Relaxed);
            meta.operations.store(0, Ordering::Relaxed);
        }
    }
}
