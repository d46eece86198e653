// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::hint::spin_loop;
use std::thread::yield_now;

/// Spins before each yield to the scheduler.
const SPINS_PER_YIELD: u32 = 64;

/// Busy-waits until `done` returns `true`.
///
/// Waiting is never bounded or cancelled. The occasional yield only keeps oversubscribed hosts
/// making progress; it does not park the thread.
#[inline]
pub(crate) fn spin_until(mut done: impl FnMut() -> bool) {
    let mut spins = 0_u32;
    while !done() {
        spin_once(&mut spins);
    }
}

/// A single step of a spin loop, yielding every [`SPINS_PER_YIELD`] calls.
#[inline]
pub(crate) fn spin_once(spins: &mut u32) {
    *spins = spins.wrapping_add(1);
    if spins.is_multiple_of(SPINS_PER_YIELD) {
        yield_now();
    } else {
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn spin_until_observes_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || flag.store(true, Ordering::Release))
        };

        spin_until(|| flag.load(Ordering::Acquire));
        setter.join().unwrap();
    }

    #[test]
    fn spin_once_counts() {
        let mut spins = 0;
        for _ in 0..SPINS_PER_YIELD * 2 {
            spin_once(&mut spins);
        }
        assert_eq!(spins, SPINS_PER_YIELD * 2);
    }
}
