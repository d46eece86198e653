// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Epoch snapshots and the sequence-locked slots that publish them.
//!
//! Three slots hold snapshot pointers: `current` (serving), `previous` (draining into the new
//! current during a rotation) and `garbage` (retired, waiting for quiescence). Only the rotation
//! thread changes them, bumping a sequence counter to odd before and back to even after each
//! change. Workers read all slots optimistically and retry when the counter was odd or moved.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::cow::CowAllocator;
use crate::error::Result;
use crate::persist::full_fence;
use crate::pool::EpochRoot;
use crate::store::{ValueLayout, ValueStore};
use crate::topology::Session;
use crate::view::{HotKeyView, Location};

/// The hot-key view and value store of one epoch.
#[derive(Debug)]
pub(crate) struct EpochSnapshot {
    epoch: u64,
    view: HotKeyView,
    store: ValueStore,
}

impl EpochSnapshot {
    /// Creates the snapshot of `epoch` for `keys`, mapping one value store replica in every pool of
    /// `cow`.
    pub(crate) fn new(epoch: u64, keys: &[(Vec<u8>, Location)], layout: ValueLayout, cow: Arc<CowAllocator>) -> Result<Self> {
        Ok(Self {
            epoch,
            view: HotKeyView::new(keys),
            store: ValueStore::new(epoch, keys.iter().map(|(key, _)| key.clone()).collect(), layout, cow)?,
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn view(&self) -> &HotKeyView {
        &self.view
    }

    pub(crate) fn store(&self) -> &ValueStore {
        &self.store
    }
}

/// A consistent reading of the epoch slots.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Snapshot<'a> {
    pub current: &'a EpochSnapshot,
    pub previous: Option<&'a EpochSnapshot>,
    pub epoch: u64,
    pub sequence: u64,
}

/// Proof of exclusive control over the epoch slots, held by whoever drives rotations.
pub(crate) trait SlotOwner {}

/// The sequence-locked current/previous/garbage slots.
#[derive(Debug)]
pub(crate) struct EpochSlots {
    sequence: AtomicU64,
    current: AtomicPtr<EpochSnapshot>,
    previous: AtomicPtr<EpochSnapshot>,
    garbage: AtomicPtr<EpochSnapshot>,
    epoch: AtomicU64,
}

impl EpochSlots {
    /// Publishes `initial` as the current snapshot.
    pub(crate) fn new(initial: Box<EpochSnapshot>) -> Self {
        let epoch = initial.epoch;
        Self {
            sequence: AtomicU64::new(0),
            current: AtomicPtr::new(Box::into_raw(initial)),
            previous: AtomicPtr::new(ptr::null_mut()),
            garbage: AtomicPtr::new(ptr::null_mut()),
            epoch: AtomicU64::new(epoch),
        }
    }

    /// Reads the slots once, returning `None` when a change was in progress or happened meanwhile.
    ///
    /// The returned references are tied to the caller's session: the rotation thread frees a snapshot only
    /// after every worker has left the cache or started a newer operation.
    pub(crate) fn try_snapshot<'a>(&'a self, _session: &'a Session<'_>) -> Option<Snapshot<'a>> {
        let sequence = self.sequence.load(Ordering::SeqCst);
        if sequence % 2 == 1 {
            return None;
        }

        let current = self.current.load(Ordering::SeqCst);
        let previous = self.previous.load(Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);

        full_fence();
        if self.sequence.load(Ordering::SeqCst) != sequence {
            return None;
        }

        // SAFETY: `current` is never null and, like `previous`, came from `Box::into_raw`. The caller
        // is marked inside the cache for the lifetime of `session`, and snapshots are only freed
        // after the quiescence wait has observed every such worker move on.
        let current = unsafe { &*current };
        // SAFETY: as above.
        let previous = unsafe { previous.as_ref() };

        Some(Snapshot {
            current,
            previous,
            epoch,
            sequence,
        })
    }

    /// The sequence counter, for re-validating a snapshot after acquiring a lock.
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn has_previous(&self) -> bool {
        !self.previous.load(Ordering::SeqCst).is_null()
    }

    /// The current snapshot, as seen by the slot owner.
    pub(crate) fn current<'a>(&'a self, _owner: &'a impl SlotOwner) -> &'a EpochSnapshot {
        // SAFETY: only the slot owner frees snapshots, and it cannot while `_owner` is borrowed.
        unsafe { &*self.current.load(Ordering::SeqCst) }
    }

    /// The draining snapshot, as seen by the slot owner.
    pub(crate) fn previous<'a>(&'a self, _owner: &'a impl SlotOwner) -> Option<&'a EpochSnapshot> {
        // SAFETY: see `current`.
        unsafe { self.previous.load(Ordering::SeqCst).as_ref() }
    }

    /// Epoch numbers held by the three slots, zero for empty slots.
    pub(crate) fn root(&self, owner: &impl SlotOwner) -> EpochRoot {
        let garbage = self.garbage.load(Ordering::SeqCst);
        EpochRoot {
            current: self.current(owner).epoch,
            previous: self.previous(owner).map_or(0, EpochSnapshot::epoch),
            // SAFETY: see `current`.
            garbage: unsafe { garbage.as_ref() }.map_or(0, EpochSnapshot::epoch),
        }
    }

    /// Makes `next` current and the old current previous. Returns the new epoch number.
    ///
    /// The previous slot must be empty.
    pub(crate) fn install(&self, next: Box<EpochSnapshot>, _owner: &mut impl SlotOwner) -> u64 {
        debug_assert!(!self.has_previous(), "a rotation started while another was draining");
        let epoch = next.epoch;
        let next = Box::into_raw(next);

        self.sequence.fetch_add(1, Ordering::SeqCst);
        let old = self.current.swap(next, Ordering::SeqCst);
        self.previous.store(old, Ordering::SeqCst);
        self.epoch.store(epoch, Ordering::SeqCst);
        self.sequence.fetch_add(1, Ordering::SeqCst);

        epoch
    }

    /// Moves the previous snapshot into the garbage slot.
    pub(crate) fn retire_previous(&self, _owner: &mut impl SlotOwner) {
        debug_assert!(self.garbage.load(Ordering::SeqCst).is_null(), "garbage was not reclaimed");

        self.sequence.fetch_add(1, Ordering::SeqCst);
        let previous = self.previous.swap(ptr::null_mut(), Ordering::SeqCst);
        self.garbage.store(previous, Ordering::SeqCst);
        self.sequence.fetch_add(1, Ordering::SeqCst);
    }

    /// Empties the garbage slot, handing back ownership of the retired snapshot.
    ///
    /// # Safety
    ///
    /// Every worker must have been observed outside the cache or in a newer operation since the
    /// snapshot was retired, so that no reference to it remains.
    pub(crate) unsafe fn take_garbage(&self, _owner: &mut impl SlotOwner) -> Option<Box<EpochSnapshot>> {
        let garbage = self.garbage.swap(ptr::null_mut(), Ordering::SeqCst);
        // SAFETY: the pointer came from `Box::into_raw` in `new` or `install`, it has just been
        // unlinked from the last slot that held it, and the caller guarantees no worker still uses it.
        (!garbage.is_null()).then(|| unsafe { Box::from_raw(garbage) })
    }
}

impl Drop for EpochSlots {
    fn drop(&mut self) {
        for slot in [&mut self.current, &mut self.previous, &mut self.garbage] {
            let snapshot = std::mem::replace(slot.get_mut(), ptr::null_mut());
            if !snapshot.is_null() {
                // SAFETY: `&mut self` rules out any reader, and every non-null slot owns a snapshot
                // created by `Box::into_raw`.
                drop(unsafe { Box::from_raw(snapshot) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use thread_aware::affinity::pinned_affinities;

    use super::*;
    use crate::pool::PersistentPool;
    use crate::topology::Topology;

    struct Owner;
    impl SlotOwner for Owner {}

    fn snapshot(epoch: u64, keys: &[&str]) -> Box<EpochSnapshot> {
        let cow = Arc::new(CowAllocator::new(vec![PersistentPool::open(0, None).unwrap()], 1));
        let keys: Vec<_> = keys
            .iter()
            .map(|key| (key.as_bytes().to_vec(), Location::InBackingIndex))
            .collect();
        Box::new(EpochSnapshot::new(epoch, &keys, ValueLayout::Fixed8, cow).unwrap())
    }

    #[test]
    fn rotation_moves_snapshots_through_the_slots() {
        let topology = Topology::new(&pinned_affinities(&[1])).unwrap();
        let mut owner = Owner;
        let slots = EpochSlots::new(snapshot(1, &[]));

        assert_eq!(slots.root(&owner), EpochRoot { current: 1, previous: 0, garbage: 0 });

        let epoch = slots.install(snapshot(2, &["hot"]), &mut owner);
        assert_eq!(epoch, 2);
        assert_eq!(slots.epoch(), 2);
        assert!(slots.has_previous());
        assert_eq!(slots.root(&owner), EpochRoot { current: 2, previous: 1, garbage: 0 });

        {
            let session = topology.thread(0).enter();
            let seen = slots.try_snapshot(&session).unwrap();
            assert_eq!(seen.current.epoch(), 2);
            assert_eq!(seen.previous.map(EpochSnapshot::epoch), Some(1));
            assert!(seen.current.view().lookup(b"hot").is_some());
            assert_eq!(seen.sequence, slots.sequence());
        }

        slots.retire_previous(&mut owner);
        assert!(!slots.has_previous());
        assert_eq!(slots.root(&owner), EpochRoot { current: 2, previous: 0, garbage: 1 });

        // SAFETY: no worker is inside the cache.
        let garbage = unsafe { slots.take_garbage(&mut owner) }.unwrap();
        assert_eq!(garbage.epoch(), 1);
        // SAFETY: as above.
        assert!(unsafe { slots.take_garbage(&mut owner) }.is_none());
        assert_eq!(slots.sequence(), 4);
    }

    #[test]
    fn readers_always_see_consistent_epochs() {
        let topology = Arc::new(Topology::new(&pinned_affinities(&[1])).unwrap());
        let slots = Arc::new(EpochSlots::new(snapshot(1, &[])));

        let reader = {
            let topology = Arc::clone(&topology);
            let slots = Arc::clone(&slots);
            std::thread::spawn(move || {
                let mut seen = 0;
                while seen < 20 {
                    let session = topology.thread(0).enter();
                    if let Some(snapshot) = slots.try_snapshot(&session) {
                        session.observe(snapshot.epoch);
                        assert_eq!(snapshot.current.epoch(), snapshot.epoch);
                        if let Some(previous) = snapshot.previous {
                            assert_eq!(previous.epoch() + 1, snapshot.epoch);
                        }
                        seen = snapshot.epoch;
                    }
                }
            })
        };

        let mut owner = Owner;
        for epoch in 2..=20 {
            slots.install(snapshot(epoch, &[]), &mut owner);
            topology.wait_for_epoch(epoch);
            slots.retire_previous(&mut owner);
            topology.wait_for_quiescence();
            // SAFETY: the quiescence wait above observed the only worker move on.
            drop(unsafe { slots.take_garbage(&mut owner) });
        }

        reader.join().unwrap();
    }
}
