// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control-plane half of an epoch: one lockable state entry per hot key.

use bytes::Bytes;

use crate::entry_lock::EntryLock;
use crate::index::BackingIndex;

#[cfg(not(feature = "range"))]
type EntryMap = hashbrown::HashMap<Vec<u8>, Entry>;

#[cfg(feature = "range")]
type EntryMap = std::collections::BTreeMap<Vec<u8>, Entry>;

/// Where the authoritative value of a hot key currently lives.
///
/// Within one epoch a key only moves forward: from the backing index or the previous epoch into
/// the current epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Location {
    InBackingIndex,
    InPreviousEpoch,
    InCurrentEpoch,
}

/// Mutable state of one hot key, guarded by its entry lock.
#[derive(Debug)]
pub(crate) struct EntryState {
    pub location: Location,
    pub deleted: bool,
    /// Set on an entry of a draining epoch once its key has been touched in the newer epoch.
    pub migrating: bool,
    pub value: Bytes,
    version: u64,
}

impl EntryState {
    fn new(location: Location) -> Self {
        Self {
            location,
            deleted: false,
            migrating: false,
            value: Bytes::new(),
            version: 0,
        }
    }

    /// Issues the next local version. The first version issued is 1.
    pub(crate) fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// The value a reader should see, `None` when deleted.
    pub(crate) fn visible(&self) -> Option<Bytes> {
        (!self.deleted).then(|| self.value.clone())
    }

    /// Caches `value` fetched from the backing index, treating absence as deletion.
    pub(crate) fn fill(&mut self, value: Option<Bytes>) {
        self.deleted = value.is_none();
        self.value = value.unwrap_or_default();
    }

    pub(crate) fn advance(&mut self, location: Location) {
        debug_assert!(location >= self.location, "{:?} cannot move back to {location:?}", self.location);
        self.location = location;
    }
}

/// A hot key's entry: its value-store slot and its locked state.
#[derive(Debug)]
pub(crate) struct Entry {
    slot: usize,
    pub state: EntryLock<EntryState>,
}

impl Entry {
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

/// The fixed key set of one epoch.
#[derive(Debug)]
pub(crate) struct HotKeyView {
    entries: EntryMap,
}

impl HotKeyView {
    /// Builds a view over `keys`; entry `i` owns value-store slot `i`.
    pub(crate) fn new(keys: &[(Vec<u8>, Location)]) -> Self {
        let entries = keys
            .iter()
            .enumerate()
            .map(|(slot, (key, location))| {
                (
                    key.clone(),
                    Entry {
                        slot,
                        state: EntryLock::new(EntryState::new(*location)),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn lookup(&self, key: &[u8]) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pulls every entry still marked [`Location::InPreviousEpoch`] forward from `old`.
    ///
    /// Entries whose old counterpart was never loaded take their value from `backing`, which the
    /// caller has already brought up to date with `old`'s writes. Returns the number of entries
    /// moved.
    pub(crate) fn migrate_from<B: BackingIndex + ?Sized>(&self, old: &Self, backing: &B) -> usize {
        let mut migrated = 0;
        for (key, entry) in &self.entries {
            let mut state = entry.state.write();
            if state.location != Location::InPreviousEpoch {
                continue;
            }

            match old.lookup(key) {
                Some(old_entry) => {
                    let old_state = old_entry.state.read();
                    if old_state.location == Location::InCurrentEpoch {
                        state.value = old_state.value.clone();
                        state.deleted = old_state.deleted;
                    } else {
                        state.fill(backing.get(key));
                    }
                }
                None => state.fill(backing.get(key)),
            }
            state.advance(Location::InCurrentEpoch);
            migrated += 1;
        }
        migrated
    }

    /// Entries with keys at or after `start`, in key order, at most `count` of them.
    #[cfg(feature = "range")]
    pub(crate) fn scan<'a>(&'a self, start: &[u8], count: usize) -> impl Iterator<Item = (&'a [u8], &'a Entry)> {
        use std::ops::Bound;

        self.entries
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .take(count)
            .map(|(key, entry)| (key.as_slice(), entry))
    }
}
