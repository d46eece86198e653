// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Durability primitives.
//!
//! Cross-thread visibility and crash durability are separate guarantees. Atomics and fences at the
//! call sites take care of the former; the helpers here write dirty cache lines back towards the
//! persistence domain and order those write-backs before any later store.

use std::sync::atomic::{Ordering, compiler_fence, fence};

/// Cache line size used for write-back granularity.
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Writes back every cache line overlapping `len` bytes starting at `start`.
///
/// Does nothing on targets without a user-mode cache-line flush instruction.
#[inline]
pub(crate) fn write_back_range(start: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let misalignment = start.addr() & (CACHE_LINE_SIZE - 1);
        let end = start.wrapping_add(len);
        let mut line = start.wrapping_sub(misalignment);
        while line < end {
            // SAFETY: `line` is on the same cache line, and therefore the same mapped page, as a byte
            // inside the caller's live allocation. `clflush` has no other requirement and SSE2 is
            // part of the x86-64 baseline.
            unsafe { core::arch::x86_64::_mm_clflush(line) };
            line = line.wrapping_add(CACHE_LINE_SIZE);
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (start, len);
    }
}

/// Orders all earlier write-backs before any later store.
#[inline]
pub(crate) fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `sfence` has no preconditions and SSE is part of the x86-64 baseline.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    fence(Ordering::SeqCst);
}

/// Prevents the compiler from reordering memory accesses across this point.
#[inline]
pub(crate) fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Full hardware fence between visibility-critical stores and loads.
#[inline]
pub(crate) fn full_fence() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Line([u64; 8]);

    #[test]
    fn persist_accepts_unaligned_and_multi_line_ranges() {
        let lines = [Line([1; 8]), Line([2; 8]), Line([3; 8])];
        let bytes = std::ptr::from_ref(&lines).cast::<u8>();

        write_back_range(bytes.wrapping_add(3), 130);
        write_back_range(bytes, 0);
        write_back_range(bytes.wrapping_add(64), 64);
        store_fence();
        compiler_barrier();
        full_fence();

        assert_eq!(lines[2].0[7], 3);
    }
}
