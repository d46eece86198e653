// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-entry lock with a distinct put-intent state.
//!
//! The lock word holds one of three writer states in its low two bits and a reader count above
//! them:
//!
//! | State       | Low bits | Meaning                                         |
//! | :---------- | :------- | :---------------------------------------------- |
//! | unlocked    | `00`     | no writer                                       |
//! | exclusive   | `01`     | a `get` resolving the entry, or a `del`         |
//! | put-intent  | `11`     | a `put` is writing; later puts may collapse     |
//!
//! Readers add [`READER`] while no writer bit is set. A put that finds another put in flight can
//! wait for it and skip its own write instead of queueing behind it.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::spin::{spin_once, spin_until};

const UNLOCKED: u32 = 0b00;
const EXCLUSIVE: u32 = 0b01;
const PUT_INTENT: u32 = 0b11;
const READER: u32 = 0b100;

/// Why [`EntryLock::try_put`] did not acquire the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PutContention {
    /// Another put holds the entry.
    PutInFlight,
    /// Readers or an exclusive holder hold the entry.
    Busy,
}

/// A spinning reader/writer lock around `T` with an extra put-intent writer state.
pub(crate) struct EntryLock<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out `&mut T` to one writer at a time and `&T` only while no writer holds
// it, the same contract as `std::sync::RwLock`.
unsafe impl<T: Send> Send for EntryLock<T> {}

// SAFETY: see above; shared access to `T` across threads requires `T: Sync`.
unsafe impl<T: Send + Sync> Sync for EntryLock<T> {}

impl<T> EntryLock<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires shared access, spinning while any writer holds the entry.
    pub(crate) fn read(&self) -> EntryReadGuard<'_, T> {
        let mut spins = 0;
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & EXCLUSIVE == 0
                && self
                    .state
                    .compare_exchange_weak(current, current + READER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return EntryReadGuard { lock: self };
            }
            spin_once(&mut spins);
        }
    }

    /// Acquires exclusive access, spinning until the entry is fully unlocked.
    pub(crate) fn write(&self) -> EntryWriteGuard<'_, T> {
        let mut spins = 0;
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return EntryWriteGuard { lock: self };
            }
            spin_once(&mut spins);
        }
    }

    /// Attempts to acquire the entry in the put-intent state without waiting.
    pub(crate) fn try_put(&self) -> Result<EntryWriteGuard<'_, T>, PutContention> {
        match self
            .state
            .compare_exchange(UNLOCKED, PUT_INTENT, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Ok(EntryWriteGuard { lock: self }),
            Err(PUT_INTENT) => Err(PutContention::PutInFlight),
            Err(_) => Err(PutContention::Busy),
        }
    }

    /// Spins until no reader or writer holds the entry.
    pub(crate) fn wait_unlocked(&self) {
        spin_until(|| self.state.load(Ordering::Acquire) == UNLOCKED);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EntryLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Shared access to the data behind an [`EntryLock`].
pub(crate) struct EntryReadGuard<'a, T> {
    lock: &'a EntryLock<T>,
}

impl<T> Deref for EntryReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the reader count is non-zero, so no writer can hold `&mut T`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for EntryReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(READER, Ordering::Release);
    }
}

/// Exclusive access to the data behind an [`EntryLock`], acquired either as exclusive or as
/// put-intent.
pub(crate) struct EntryWriteGuard<'a, T> {
    lock: &'a EntryLock<T>,
}

impl<T> Deref for EntryWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard is the only writer and readers are excluded while it lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for EntryWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard is the only writer and readers are excluded while it lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for EntryWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn readers_share_the_entry() {
        let lock = EntryLock::new(7);
        let first = lock.read();
        let second = lock.read();
        assert_eq!(*first + *second, 14);
        assert_eq!(lock.try_put().err(), Some(PutContention::Busy));
    }

    #[test]
    fn put_intent_is_reported_to_other_puts() {
        let lock = EntryLock::new(0);
        let mut guard = lock.try_put().unwrap();
        *guard = 1;

        assert_eq!(lock.try_put().err(), Some(PutContention::PutInFlight));
        drop(guard);

        assert_eq!(*lock.read(), 1);
        assert!(lock.try_put().is_ok());
    }

    #[test]
    fn exclusive_holder_is_busy_for_puts() {
        let lock = EntryLock::new(0);
        let guard = lock.write();
        assert_eq!(lock.try_put().err(), Some(PutContention::Busy));
        drop(guard);
        lock.wait_unlocked();
    }

    #[test]
    fn concurrent_writers_do_not_lose_increments() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 10_000;

        let lock = Arc::new(EntryLock::new(0_usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        *lock.write() += 1;
                        let _ = *lock.read();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.read(), THREADS * ITERATIONS);
    }
}
