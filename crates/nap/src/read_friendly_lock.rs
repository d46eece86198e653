// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A reader/writer lock tuned for readers that almost never meet a writer.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::spin::spin_once;

/// One reader flag, padded to its own cache line so readers never share a line.
#[repr(align(64))]
#[derive(Debug, Default)]
struct ReaderSlot {
    held: AtomicBool,
}

impl ReaderSlot {
    fn acquire(&self) {
        let mut spins = 0;
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_once(&mut spins);
        }
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// A reader/writer lock with one reader slot per worker.
///
/// Each reader touches only its own cache line, so uncontended reads never bounce lines between
/// cores. A writer acquires every slot in turn, which makes writes expensive; they are expected to
/// be rare (one per epoch rotation).
///
/// The cache uses this lock to keep the backing-index fallback path from overlapping the start of
/// a rotation. It is public so that backing indexes can guard their own rarely-written structures
/// (such as a directory) with the same read-mostly profile.
///
/// # Examples
///
/// ```
/// use nap::ReadFriendlyLock;
///
/// let lock = ReadFriendlyLock::new(4);
///
/// {
///     let _a = lock.read(0);
///     let _b = lock.read(3);
/// }
///
/// let _writer = lock.write();
/// ```
#[derive(Debug)]
pub struct ReadFriendlyLock {
    slots: Box<[ReaderSlot]>,
}

impl ReadFriendlyLock {
    /// Creates a lock with `readers` independent reader slots.
    ///
    /// # Panics
    ///
    /// Panics if `readers` is zero.
    #[must_use]
    pub fn new(readers: usize) -> Self {
        assert!(readers > 0, "a read-friendly lock needs at least one reader slot");
        Self {
            slots: (0..readers).map(|_| ReaderSlot::default()).collect(),
        }
    }

    /// Returns the number of reader slots.
    #[must_use]
    pub fn readers(&self) -> usize {
        self.slots.len()
    }

    /// Acquires the lock for reading through reader slot `reader`.
    ///
    /// Each slot must be used by one thread at a time; a thread reading twice through the same
    /// slot deadlocks.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= readers()`.
    pub fn read(&self, reader: usize) -> ReadFriendlyReadGuard<'_> {
        let slot = &self.slots[reader];
        slot.acquire();
        ReadFriendlyReadGuard { slot }
    }

    /// Acquires the lock for writing by taking every reader slot.
    pub fn write(&self) -> ReadFriendlyWriteGuard<'_> {
        for slot in &self.slots {
            slot.acquire();
        }
        ReadFriendlyWriteGuard { lock: self }
    }
}

/// Read access to a [`ReadFriendlyLock`], released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadFriendlyReadGuard<'a> {
    slot: &'a ReaderSlot,
}

impl Drop for ReadFriendlyReadGuard<'_> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Write access to a [`ReadFriendlyLock`], released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadFriendlyWriteGuard<'a> {
    lock: &'a ReadFriendlyLock,
}

impl Drop for ReadFriendlyWriteGuard<'_> {
    fn drop(&mut self) {
        for slot in &self.lock.slots {
            slot.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn readers_do_not_block_each_other() {
        let lock = ReadFriendlyLock::new(3);
        let _first = lock.read(0);
        let _second = lock.read(1);
        let _third = lock.read(2);
        assert_eq!(lock.readers(), 3);
    }

    #[test]
    #[should_panic]
    fn zero_readers_is_rejected() {
        let _ = ReadFriendlyLock::new(0);
    }

    #[test]
    fn writer_excludes_readers() {
        const READERS: usize = 4;
        const ROUNDS: usize = 2_000;

        let lock = Arc::new(ReadFriendlyLock::new(READERS));
        // Even while no writer is inside, odd while a writer is mutating.
        let phase = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..READERS)
            .map(|reader| {
                let lock = Arc::clone(&lock);
                let phase = Arc::clone(&phase);
                std::thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let _guard = lock.read(reader);
                        assert_eq!(phase.load(Ordering::SeqCst) % 2, 0);
                    }
                })
            })
            .collect();

        for _ in 0..ROUNDS / 10 {
            let _guard = lock.write();
            phase.fetch_add(1, Ordering::SeqCst);
            std::hint::spin_loop();
            phase.fetch_add(1, Ordering::SeqCst);
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
