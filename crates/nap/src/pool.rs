// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Persistent memory pools, one per NUMA node.
//!
//! A pool hands out memory-mapped regions. Without a configured directory the regions are
//! anonymous maps; with one they are file-backed maps under `<dir>/node-<n>/` and every persist
//! also synchronizes the written range with its file. Each pool holds the copy-on-write blocks
//! (`block-<i>`) and the value store replicas of live epochs (`epoch-<e>`) of its node.
//!
//! Pool 0 additionally carries a 64-byte header holding the rotation undo record (offset 0) and
//! the epoch root record (offset 32), both as little-endian `u64` words.

use std::fs::{self, File, OpenOptions};
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::{MmapMut, MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::persist;

/// Size of the pool header.
pub(crate) const HEADER_SIZE: usize = 64;

const UNDO_OFFSET: usize = 0;
const ROOT_OFFSET: usize = 32;
const WORD: usize = size_of::<u64>();

/// A mapped range of persistent memory.
#[derive(Debug)]
pub(crate) struct Region {
    map: MmapMut,
    file_backed: bool,
}

impl Region {
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Makes `len` bytes starting at `offset` durable.
    pub(crate) fn persist(&self, offset: usize, len: usize) -> Result<()> {
        let range = &self.map[offset..offset + len];
        persist::write_back_range(range.as_ptr(), range.len());
        persist::store_fence();
        if self.file_backed {
            self.map.flush_range(offset, len).map_err(Error::from_message)?;
        }
        Ok(())
    }

    fn read_word(&self, offset: usize) -> u64 {
        let mut word = [0; WORD];
        word.copy_from_slice(&self.map[offset..offset + WORD]);
        u64::from_le_bytes(word)
    }

    fn write_word(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + WORD].copy_from_slice(&value.to_le_bytes());
    }
}

/// A mapped range that many threads update in place through atomics.
///
/// The map is only ever reached through raw pointers, never through byte slices, so typed atomic
/// views of it do not alias plain references. A file-backed region removes its file when dropped.
#[derive(Debug)]
pub(crate) struct SharedRegion {
    map: ManuallyDrop<MmapRaw>,
    path: Option<PathBuf>,
}

impl SharedRegion {
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Copies `bytes` into the region at `offset`.
    ///
    /// Takes `&mut self`: the region is filled this way before any view of it is shared.
    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len(), "write past the end of a shared region");
        // SAFETY: `offset` is in bounds, as asserted above.
        let destination = unsafe { self.map.as_mut_ptr().add(offset) };
        // SAFETY: the destination range is in bounds, `&mut self` rules out any other access to the
        // map, and a mapped range cannot overlap the borrowed source slice.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), destination, bytes.len()) };
    }

    /// Views `count` values of `T` starting at `offset`.
    ///
    /// # Safety
    ///
    /// Every bit pattern, all zeroes included, must be a valid `T`, and `T` may only be mutated
    /// through shared references (atomics). Views of overlapping ranges must use the same `T`.
    pub(crate) unsafe fn view<T>(&self, offset: usize, count: usize) -> &[T] {
        assert!(
            offset + count * size_of::<T>() <= self.len(),
            "view past the end of a shared region"
        );
        // SAFETY: `offset` is in bounds, as asserted above.
        let start = unsafe { self.map.as_mut_ptr().add(offset) }.cast::<T>();
        assert!(start.is_aligned(), "misaligned view of a shared region");
        // SAFETY: the range is in bounds and aligned, lives as long as `self`, and the caller
        // vouches for the validity and aliasing requirements of `T`.
        unsafe { slice::from_raw_parts(start, count) }
    }

    /// Makes `len` bytes starting at `offset` durable.
    pub(crate) fn persist(&self, offset: usize, len: usize) -> Result<()> {
        assert!(offset + len <= self.len(), "persist past the end of a shared region");
        // SAFETY: `offset` is in bounds, as asserted above.
        let start = unsafe { self.map.as_mut_ptr().add(offset) };
        persist::write_back_range(start, len);
        persist::store_fence();
        if self.path.is_some() {
            self.map.flush_range(offset, len).map_err(Error::from_message)?;
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: the map is not touched again; unmapping first lets the file be removed on every
        // platform.
        unsafe { ManuallyDrop::drop(&mut self.map) };

        if let Some(path) = &self.path
            && let Err(error) = fs::remove_file(path)
        {
            tracing::warn!(path = %path.display(), %error, "could not remove a retired value store file");
        }
    }
}

/// The persistent memory of one NUMA node.
#[derive(Debug)]
pub(crate) struct PersistentPool {
    node: usize,
    dir: Option<PathBuf>,
    blocks_mapped: AtomicUsize,
}

impl PersistentPool {
    /// Opens the pool of `node`, under `root` when file-backed.
    ///
    /// Files an earlier process left behind are not inspected here; they must have been written
    /// back by [`recovery::write_back`](crate::recovery::write_back) first.
    pub(crate) fn open(node: usize, root: Option<&Path>) -> Result<Self> {
        let dir = match root {
            Some(root) => {
                let dir = node_dir(root, node);
                fs::create_dir_all(&dir).map_err(Error::from_message)?;
                Some(dir)
            }
            None => None,
        };

        Ok(Self {
            node,
            dir,
            blocks_mapped: AtomicUsize::new(0),
        })
    }

    pub(crate) fn node(&self) -> usize {
        self.node
    }

    /// Maps a fresh, zeroed block of `len` bytes.
    pub(crate) fn map_block(&self, len: usize) -> Result<Region> {
        let index = self.blocks_mapped.fetch_add(1, Ordering::Relaxed);
        self.map(&format!("{BLOCK_PREFIX}{index}"), len, true)
    }

    /// Maps a fresh, zeroed region of `len` bytes for the value store replica of `epoch`.
    pub(crate) fn map_store(&self, epoch: u64, len: usize) -> Result<SharedRegion> {
        let Some(dir) = &self.dir else {
            let map = MmapMut::map_anon(len).map_err(Error::from_message)?;
            return Ok(SharedRegion {
                map: ManuallyDrop::new(MmapRaw::from(map)),
                path: None,
            });
        };

        let path = dir.join(format!("{STORE_PREFIX}{epoch}"));
        let file = create_file(&path, len, true)?;
        let map = MmapOptions::new().len(len).map_raw(&file).map_err(Error::from_message)?;

        Ok(SharedRegion {
            map: ManuallyDrop::new(map),
            path: Some(path),
        })
    }

    /// Maps the pool header, keeping its previous contents when file-backed.
    fn map_header(&self) -> Result<Region> {
        self.map("header", HEADER_SIZE, false)
    }

    fn map(&self, name: &str, len: usize, truncate: bool) -> Result<Region> {
        let Some(dir) = &self.dir else {
            return Ok(Region {
                map: MmapMut::map_anon(len).map_err(Error::from_message)?,
                file_backed: false,
            });
        };

        let file = create_file(&dir.join(name), len, truncate)?;
        // SAFETY: the file lives in a directory owned by this pool and is only accessed through this
        // map for the lifetime of the process.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(Error::from_message)?;

        Ok(Region { map, file_backed: true })
    }
}

/// File name prefix of copy-on-write blocks.
pub(crate) const BLOCK_PREFIX: &str = "block-";

/// File name prefix of value store replicas.
pub(crate) const STORE_PREFIX: &str = "epoch-";

/// The directory holding the files of `node` under `root`.
pub(crate) fn node_dir(root: &Path, node: usize) -> PathBuf {
    root.join(format!("node-{node}"))
}

fn create_file(path: &Path, len: usize, truncate: bool) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .map_err(Error::from_message)?;
    file.set_len(len as u64).map_err(Error::from_message)?;
    Ok(file)
}

/// The structural swap a rotation is about to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UndoKind {
    /// A new snapshot becomes current and the old current becomes previous.
    SwapIn = 1,
    /// The previous snapshot becomes garbage.
    Retire = 2,
}

/// A durable record of an in-flight structural swap.
///
/// Snapshots are identified by their epoch numbers; zero stands for "none".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UndoRecord {
    /// Raw kind word: 0 when no swap is in flight.
    pub kind: u64,
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

/// Epoch numbers held by the current, previous and garbage slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct EpochRoot {
    pub current: u64,
    pub previous: u64,
    pub garbage: u64,
}

/// The undo log and epoch root record kept in pool 0's header.
#[derive(Debug)]
pub(crate) struct PoolHeader {
    region: Mutex<Region>,
}

impl PoolHeader {
    /// Maps the header of `pool`, discarding any interrupted swap record.
    ///
    /// Every snapshot is flushed to the backing index before its retirement is logged, and the
    /// stores an interrupted process did not drain are written back before the pools are opened,
    /// so the backing index already holds the state an interrupted rotation would roll back to.
    pub(crate) fn open(pool: &PersistentPool) -> Result<Self> {
        let header = Self {
            region: Mutex::new(pool.map_header()?),
        };

        let pending = header.undo_record();
        if pending.kind != 0 {
            tracing::warn!(
                kind = pending.kind,
                a = pending.a,
                b = pending.b,
                c = pending.c,
                "discarding the undo record of an interrupted rotation"
            );
            header.truncate()?;
        }

        Ok(header)
    }

    /// Durably records that a swap of `kind` is about to happen.
    ///
    /// The operands are persisted before the kind word, so a record is never observed with a kind
    /// but stale operands.
    pub(crate) fn log(&self, kind: UndoKind, a: u64, b: u64) -> Result<()> {
        let mut region = self.region.lock();
        region.write_word(UNDO_OFFSET + WORD, a);
        region.write_word(UNDO_OFFSET + 2 * WORD, b);
        region.write_word(UNDO_OFFSET + 3 * WORD, 0);
        region.persist(UNDO_OFFSET + WORD, 3 * WORD)?;
        persist::compiler_barrier();
        region.write_word(UNDO_OFFSET, kind as u64);
        region.persist(UNDO_OFFSET, WORD)
    }

    /// Clears the undo record.
    pub(crate) fn truncate(&self) -> Result<()> {
        let mut region = self.region.lock();
        region.write_word(UNDO_OFFSET, 0);
        region.persist(UNDO_OFFSET, WORD)
    }

    pub(crate) fn undo_record(&self) -> UndoRecord {
        let region = self.region.lock();
        UndoRecord {
            kind: region.read_word(UNDO_OFFSET),
            a: region.read_word(UNDO_OFFSET + WORD),
            b: region.read_word(UNDO_OFFSET + 2 * WORD),
            c: region.read_word(UNDO_OFFSET + 3 * WORD),
        }
    }

    pub(crate) fn store_root(&self, root: EpochRoot) -> Result<()> {
        let mut region = self.region.lock();
        region.write_word(ROOT_OFFSET, root.current);
        region.write_word(ROOT_OFFSET + WORD, root.previous);
        region.write_word(ROOT_OFFSET + 2 * WORD, root.garbage);
        region.persist(ROOT_OFFSET, 3 * WORD)
    }

    pub(crate) fn root(&self) -> EpochRoot {
        let region = self.region.lock();
        EpochRoot {
            current: region.read_word(ROOT_OFFSET),
            previous: region.read_word(ROOT_OFFSET + WORD),
            garbage: region.read_word(ROOT_OFFSET + 2 * WORD),
        }
    }
}
