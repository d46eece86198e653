// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Copy-on-write buffer allocator over the persistent pools.
//!
//! Each pool is carved into 1 MiB blocks, each block into 8 KiB pages, and each page into slots of
//! one size class. A page tracks its slots in a 128-bit occupancy bitmap; pages with at least one
//! free slot sit on their class's partial list. Buffers are addressed by packed [`CowHandle`]s
//! rather than pointers so they can be stored in atomic words.

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::{PersistentPool, Region};

/// Slot sizes, in bytes, of the four size classes.
pub(crate) const SIZE_CLASSES: [usize; 4] = [64, 128, 256, 512];

/// Largest buffer the allocator can hand out.
pub(crate) const MAX_ALLOCATION: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

const BLOCK_SIZE: usize = 1 << 20;
const PAGE_SIZE: usize = 8 << 10;
const PAGES_PER_BLOCK: usize = BLOCK_SIZE / PAGE_SIZE;

/// Freed buffers each worker keeps for its next writes.
const REUSE_CACHE_SIZE: usize = 4;

const HANDLE_VALID: u64 = 1 << 63;

/// The address of one allocated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CowHandle {
    pool: u16,
    class: u8,
    page: u32,
    slot: u8,
}

impl CowHandle {
    /// Packs the handle into a non-zero word; zero is free to mean "no buffer".
    pub(crate) fn to_raw(self) -> u64 {
        HANDLE_VALID
            | u64::from(self.class) << 56
            | u64::from(self.pool) << 40
            | u64::from(self.page) << 8
            | u64::from(self.slot)
    }

    #[expect(clippy::cast_possible_truncation, reason = "each field is masked out of the packed word")]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw & HANDLE_VALID != 0).then(|| Self {
            pool: (raw >> 40) as u16,
            class: ((raw >> 56) & 0b11) as u8,
            page: (raw >> 8) as u32,
            slot: raw as u8,
        })
    }

    /// Usable bytes of the buffer.
    pub(crate) fn capacity(self) -> usize {
        SIZE_CLASSES[usize::from(self.class)]
    }

    pub(crate) fn pool(self) -> usize {
        usize::from(self.pool)
    }

    /// The index of the block holding the buffer within its pool, and the buffer's byte offset
    /// within that block.
    pub(crate) fn placement(self) -> (usize, usize) {
        let page = self.page as usize;
        let offset = (page % PAGES_PER_BLOCK) * PAGE_SIZE + usize::from(self.slot) * self.capacity();
        (page / PAGES_PER_BLOCK, offset)
    }
}

#[derive(Debug)]
struct PageMeta {
    class: usize,
    occupied: u128,
}

impl PageMeta {
    fn full_mask(&self) -> u128 {
        let slots = PAGE_SIZE / SIZE_CLASSES[self.class];
        if slots >= 128 { u128::MAX } else { (1 << slots) - 1 }
    }
}

/// Allocation state of one pool.
#[derive(Debug)]
struct Arena {
    blocks: Vec<Region>,
    pages: Vec<PageMeta>,
    partial: [Vec<u32>; SIZE_CLASSES.len()],
}

impl Arena {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            pages: Vec::new(),
            partial: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Returns a page of `class` with a free slot, carving a new page (and mapping a new block)
    /// when none is left.
    fn partial_page(&mut self, pool: &PersistentPool, class: usize) -> Result<u32> {
        if let Some(&page) = self.partial[class].last() {
            return Ok(page);
        }

        let id = self.pages.len();
        if id / PAGES_PER_BLOCK == self.blocks.len() {
            self.blocks.push(pool.map_block(BLOCK_SIZE)?);
            tracing::debug!(node = pool.node(), blocks = self.blocks.len(), "mapped copy-on-write block");
        }

        let page = u32::try_from(id).map_err(Error::from_message)?;
        self.pages.push(PageMeta { class, occupied: 0 });
        self.partial[class].push(page);
        Ok(page)
    }

    /// Validates `handle` and returns its block index and byte offset within the block.
    fn locate(&self, handle: CowHandle) -> Result<(usize, usize)> {
        let page = handle.page as usize;
        let meta = self
            .pages
            .get(page)
            .ok_or_else(|| Error::from_message(format!("{handle:?} points past the carved pages")))?;
        if meta.class != usize::from(handle.class) || meta.occupied & (1 << handle.slot) == 0 {
            return Err(Error::from_message(format!("{handle:?} does not refer to a live buffer")));
        }

        Ok(handle.placement())
    }
}

/// Per-worker cache of recently freed buffers.
#[derive(Debug, Default)]
struct ReuseCache {
    handles: [Option<CowHandle>; REUSE_CACHE_SIZE],
}

impl ReuseCache {
    fn take(&mut self, pool: usize, size: usize) -> Option<CowHandle> {
        self.handles
            .iter_mut()
            .find(|cached| cached.is_some_and(|h| h.pool() == pool && h.capacity() >= size))
            .and_then(Option::take)
    }

    /// Caches `handle`, returning whichever buffer no longer fits in the cache.
    ///
    /// A buffer displaces the first cached buffer smaller than itself.
    fn keep(&mut self, handle: CowHandle) -> Option<CowHandle> {
        if let Some(empty) = self.handles.iter_mut().find(|cached| cached.is_none()) {
            *empty = Some(handle);
            return None;
        }

        match self
            .handles
            .iter_mut()
            .find(|cached| cached.is_some_and(|h| h.capacity() < handle.capacity()))
        {
            Some(smaller) => smaller.replace(handle),
            None => Some(handle),
        }
    }
}

/// Slab allocator of copy-on-write buffers, one arena per NUMA pool.
#[derive(Debug)]
pub(crate) struct CowAllocator {
    pools: Box<[PersistentPool]>,
    arenas: Box<[Mutex<Arena>]>,
    reuse: Box<[Mutex<ReuseCache>]>,
}

impl CowAllocator {
    /// Creates an allocator over `pools` with a reuse cache for each of `workers` worker slots.
    pub(crate) fn new(pools: Vec<PersistentPool>, workers: usize) -> Self {
        Self {
            arenas: pools.iter().map(|_| Mutex::new(Arena::new())).collect(),
            pools: pools.into_boxed_slice(),
            reuse: (0..workers).map(|_| Mutex::new(ReuseCache::default())).collect(),
        }
    }

    /// The pools buffers are carved from, one per NUMA node.
    pub(crate) fn pools(&self) -> &[PersistentPool] {
        &self.pools
    }

    /// Allocates a buffer of at least `size` bytes from `pool`.
    pub(crate) fn alloc(&self, pool: usize, size: usize) -> Result<CowHandle> {
        let class = SIZE_CLASSES
            .iter()
            .position(|&class_size| size <= class_size)
            .ok_or_else(|| Error::from_message(format!("{size} bytes exceed the largest buffer of {MAX_ALLOCATION} bytes")))?;
        let persistent = self
            .pools
            .get(pool)
            .ok_or_else(|| Error::from_message(format!("pool {pool} does not exist")))?;

        let mut arena = self.arenas[pool].lock();
        let page = arena.partial_page(persistent, class)?;
        let meta = &mut arena.pages[page as usize];
        let slot = (!meta.occupied).trailing_zeros();
        meta.occupied |= 1 << slot;
        if meta.occupied == meta.full_mask() {
            arena.partial[class].pop();
        }

        Ok(CowHandle {
            pool: u16::try_from(pool).map_err(Error::from_message)?,
            class: u8::try_from(class).map_err(Error::from_message)?,
            page,
            slot: u8::try_from(slot).map_err(Error::from_message)?,
        })
    }

    /// Returns `handle` to its page.
    ///
    /// Freeing a buffer that is not live (including a second free of the same buffer) is an error
    /// and leaves the allocator unchanged.
    pub(crate) fn free(&self, handle: CowHandle) -> Result<()> {
        let mut arena = self
            .arenas
            .get(handle.pool())
            .ok_or_else(|| Error::from_message(format!("{handle:?} names an unknown pool")))?
            .lock();
        arena.locate(handle)?;

        let class = usize::from(handle.class);
        let meta = &mut arena.pages[handle.page as usize];
        let was_full = meta.occupied == meta.full_mask();
        meta.occupied &= !(1 << handle.slot);
        if was_full {
            arena.partial[class].push(handle.page);
        }
        Ok(())
    }

    /// Allocates for `worker`, preferring a buffer from its reuse cache.
    pub(crate) fn alloc_for(&self, worker: usize, pool: usize, size: usize) -> Result<CowHandle> {
        match self.reuse[worker].lock().take(pool, size) {
            Some(handle) => Ok(handle),
            None => self.alloc(pool, size),
        }
    }

    /// Releases a buffer overwritten by `worker` into its reuse cache, freeing whatever the cache
    /// displaces.
    pub(crate) fn release_from(&self, worker: usize, handle: CowHandle) -> Result<()> {
        let displaced = self.reuse[worker].lock().keep(handle);
        displaced.map_or(Ok(()), |handle| self.free(handle))
    }

    /// Copies `parts` back to back into the buffer and makes them durable.
    pub(crate) fn write(&self, handle: CowHandle, parts: &[&[u8]]) -> Result<()> {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total > handle.capacity() {
            return Err(Error::from_message(format!(
                "{total} bytes do not fit a {} byte buffer",
                handle.capacity()
            )));
        }

        let mut arena = self.arenas[handle.pool()].lock();
        let (block, offset) = arena.locate(handle)?;
        let region = &mut arena.blocks[block];

        let mut cursor = offset;
        for part in parts {
            region.bytes_mut()[cursor..cursor + part.len()].copy_from_slice(part);
            cursor += part.len();
        }
        region.persist(offset, total)
    }

    /// Runs `f` over the full contents of the buffer.
    pub(crate) fn read<R>(&self, handle: CowHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let arena = self
            .arenas
            .get(handle.pool())
            .ok_or_else(|| Error::from_message(format!("{handle:?} names an unknown pool")))?
            .lock();
        let (block, offset) = arena.locate(handle)?;
        Ok(f(&arena.blocks[block].bytes()[offset..offset + handle.capacity()]))
    }

    /// Number of live buffers in `pool`, including those parked in reuse caches.
    #[cfg(test)]
    pub(crate) fn live(&self, pool: usize) -> usize {
        self.arenas[pool]
            .lock()
            .pages
            .iter()
            .map(|page| page.occupied.count_ones() as usize)
            .sum()
    }
}
