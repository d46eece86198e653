// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-epoch value storage, replicated once per NUMA node.
//!
//! Slot `i` of every replica belongs to entry `i` of the epoch's hot-key view. A worker writes only
//! the replica of its own NUMA node; when the epoch retires, the newest version of every slot across
//! replicas is written back to the backing index.
//!
//! Each replica lives in a region of its node's persistent pool:
//!
//! - offset 0: header words (magic, layout, slot count, drained flag);
//! - offset 64: the slot array, [`FixedSlot`]s or packed [`CowHandle`] words;
//! - after the slots: the key table, a `u32` length and the bytes of every key in slot order.
//!
//! The magic word is persisted last, so a replica that carries it always has its keys. A drained
//! replica has been written back in full and holds nothing the backing index lacks.

use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::cow::{CowAllocator, CowHandle, MAX_ALLOCATION};
use crate::error::{Error, Result, fatal};
use crate::index::BackingIndex;
use crate::persist;
use crate::pool::{PersistentPool, SharedRegion};

/// Version bit marking a deletion.
const TOMBSTONE: u64 = 1 << 63;

/// Selector value of a fixed slot that was never written. Zeroed memory is an empty slot.
const EMPTY: u8 = 0;

/// Bytes in front of a variable-length value: version (`u64`) and length (`u32`).
const RECORD_HEADER: usize = size_of::<u64>() + size_of::<u32>();

const WORD: usize = size_of::<u64>();
const STORE_MAGIC: u64 = u64::from_le_bytes(*b"NAPSTORE");
const MAGIC_WORD: usize = 0;
const LAYOUT_WORD: usize = 1;
const SLOTS_WORD: usize = 2;
const DRAINED_WORD: usize = 3;
const HEADER_WORDS: usize = 4;
const SLOTS_OFFSET: usize = 64;
const KEY_LEN: usize = size_of::<u32>();

/// Size of the values stored with [`ValueLayout::Fixed8`].
pub const FIXED_VALUE_LEN: usize = size_of::<u64>();

/// Largest value storable with [`ValueLayout::Variable`].
pub const MAX_VARIABLE_VALUE_LEN: usize = MAX_ALLOCATION - RECORD_HEADER;

/// How hot values are laid out in persistent memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValueLayout {
    /// Exactly [`FIXED_VALUE_LEN`]-byte values in double-buffered slots, updated without
    /// allocation.
    #[default]
    Fixed8,

    /// Values of up to [`MAX_VARIABLE_VALUE_LEN`] bytes in copy-on-write buffers.
    Variable,
}

impl ValueLayout {
    fn code(self) -> u64 {
        match self {
            Self::Fixed8 => 1,
            Self::Variable => 2,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Fixed8),
            2 => Some(Self::Variable),
            _ => None,
        }
    }

    fn slot_size(self) -> usize {
        match self {
            Self::Fixed8 => size_of::<FixedSlot>(),
            Self::Variable => size_of::<AtomicU64>(),
        }
    }
}

/// A fixed-size value slot with two alternating incarnations.
///
/// A writer fills the incarnation the selector does not point at, then flips the selector. A crash
/// at any point leaves either the old or the new incarnation fully intact. The slot fits one cache
/// line, so writing back the selector's line also writes back the incarnation.
///
/// The selector holds the incarnation index plus one, so that a zeroed slot reads as empty.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct FixedSlot {
    selector: AtomicU8,
    versions: [AtomicU64; 2],
    values: [AtomicU64; 2],
}

impl FixedSlot {
    #[cfg(test)]
    fn new() -> Self {
        Self {
            selector: AtomicU8::new(EMPTY),
            versions: [AtomicU64::new(0), AtomicU64::new(0)],
            values: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Writes the inactive incarnation without publishing it. Returns the incarnation to commit.
    pub(crate) fn stage(&self, version: u64, value: u64) -> u8 {
        let next = match self.selector.load(Ordering::Acquire) {
            EMPTY => 0,
            selected => 2 - selected,
        };
        self.versions[usize::from(next)].store(version, Ordering::Relaxed);
        self.values[usize::from(next)].store(value, Ordering::Relaxed);
        next
    }

    /// Publishes a staged incarnation. The caller makes the slot durable afterwards.
    pub(crate) fn commit(&self, incarnation: u8) {
        persist::compiler_barrier();
        self.selector.store(incarnation + 1, Ordering::Release);
    }

    #[cfg(test)]
    fn update(&self, version: u64, value: u64) {
        let incarnation = self.stage(version, value);
        self.commit(incarnation);
    }

    /// The authoritative `(version, value)` pair, if the slot was ever written.
    pub(crate) fn read(&self) -> Option<(u64, u64)> {
        match self.selector.load(Ordering::Acquire) {
            EMPTY => None,
            selected => {
                let current = usize::from(selected - 1);
                Some((
                    self.versions[current].load(Ordering::Relaxed),
                    self.values[current].load(Ordering::Relaxed),
                ))
            }
        }
    }
}

/// One NUMA node's copy of a store, in that node's pool.
#[derive(Debug)]
struct Replica {
    region: SharedRegion,
    slots: usize,
}

impl Replica {
    /// Maps the replica of `epoch` in `pool` and writes its key table and header.
    fn create(pool: &PersistentPool, epoch: u64, keys: &[Vec<u8>], layout: ValueLayout) -> Result<Self> {
        let mut table = Vec::with_capacity(keys.iter().map(|key| KEY_LEN + key.len()).sum());
        for key in keys {
            let len = u32::try_from(key.len()).map_err(Error::from_message)?;
            table.extend_from_slice(&len.to_le_bytes());
            table.extend_from_slice(key);
        }

        let table_offset = SLOTS_OFFSET + keys.len() * layout.slot_size();
        let mut region = pool.map_store(epoch, table_offset + table.len())?;
        region.write_at(table_offset, &table);
        region.write_at(LAYOUT_WORD * WORD, &layout.code().to_le_bytes());
        region.write_at(SLOTS_WORD * WORD, &(keys.len() as u64).to_le_bytes());
        region.persist(0, region.len())?;

        persist::compiler_barrier();
        region.write_at(MAGIC_WORD * WORD, &STORE_MAGIC.to_le_bytes());
        region.persist(MAGIC_WORD * WORD, WORD)?;

        Ok(Self {
            region,
            slots: keys.len(),
        })
    }

    fn header(&self) -> &[AtomicU64] {
        // SAFETY: the header words are only viewed as `AtomicU64`s, which are valid for any bits.
        unsafe { self.region.view(0, HEADER_WORDS) }
    }

    fn fixed(&self) -> &[FixedSlot] {
        // SAFETY: a `FixedSlot` is made of atomics only and is valid for any bits. The slot array of a
        // fixed-layout store is only ever viewed as `FixedSlot`s.
        unsafe { self.region.view(SLOTS_OFFSET, self.slots) }
    }

    fn handles(&self) -> &[AtomicU64] {
        // SAFETY: the slot array of a variable-layout store is only ever viewed as `AtomicU64`s,
        // which are valid for any bits.
        unsafe { self.region.view(SLOTS_OFFSET, self.slots) }
    }

    fn persist_slot(&self, slot: usize, layout: ValueLayout) {
        let size = layout.slot_size();
        if let Err(error) = self.region.persist(SLOTS_OFFSET + slot * size, size) {
            fatal(&format!("persisting a hot value failed: {error}"));
        }
    }
}

/// The newest record of a slot: its version and value, `None` for a deletion.
pub(crate) type Record = (u64, Option<Vec<u8>>);

/// Picks the newest of several raw replica records and splits off the tombstone bit.
pub(crate) fn newest(records: impl IntoIterator<Item = (u64, Vec<u8>)>) -> Option<Record> {
    records
        .into_iter()
        .max_by_key(|(version, _)| version & !TOMBSTONE)
        .map(|(version, value)| (version & !TOMBSTONE, (version & TOMBSTONE == 0).then_some(value)))
}

/// Value storage of one epoch.
#[derive(Debug)]
pub(crate) struct ValueStore {
    keys: Box<[Vec<u8>]>,
    layout: ValueLayout,
    replicas: Box<[Replica]>,
    cow: Arc<CowAllocator>,
}

impl ValueStore {
    /// Creates empty storage for `keys` of `epoch`, with one replica in each pool of `cow`.
    pub(crate) fn new(epoch: u64, keys: Vec<Vec<u8>>, layout: ValueLayout, cow: Arc<CowAllocator>) -> Result<Self> {
        let replicas = cow
            .pools()
            .iter()
            .map(|pool| Replica::create(pool, epoch, &keys, layout))
            .collect::<Result<_>>()?;

        Ok(Self {
            keys: keys.into_boxed_slice(),
            layout,
            replicas,
            cow,
        })
    }

    /// Writes `value` (or a deletion when `None`) with `version` into `slot` of the replica of
    /// `node`, on behalf of `worker`, and makes it durable.
    ///
    /// The caller must hold the slot's entry lock.
    pub(crate) fn update(&self, node: usize, worker: usize, slot: usize, version: u64, value: Option<&[u8]>) {
        let stored_version = if value.is_some() { version } else { version | TOMBSTONE };
        let replica = &self.replicas[node];

        match self.layout {
            ValueLayout::Fixed8 => {
                let target = &replica.fixed()[slot];
                let incarnation = target.stage(stored_version, value.map_or(0, fixed_word));
                target.commit(incarnation);
                replica.persist_slot(slot, self.layout);
            }
            ValueLayout::Variable => {
                let value = value.unwrap_or_default();
                let Ok(len) = u32::try_from(value.len()) else {
                    fatal("value length does not fit a record header");
                };

                let handle = self
                    .cow
                    .alloc_for(worker, node, RECORD_HEADER + value.len())
                    .unwrap_or_else(|error| fatal(&format!("copy-on-write allocation failed: {error}")));
                if let Err(error) = self
                    .cow
                    .write(handle, &[&stored_version.to_le_bytes(), &len.to_le_bytes(), value])
                {
                    fatal(&format!("writing a copy-on-write record failed: {error}"));
                }

                let previous = replica.handles()[slot].swap(handle.to_raw(), Ordering::AcqRel);
                replica.persist_slot(slot, self.layout);

                if let Some(previous) = CowHandle::from_raw(previous)
                    && let Err(error) = self.cow.release_from(worker, previous)
                {
                    fatal(&format!("releasing a copy-on-write record failed: {error}"));
                }
            }
        }
    }

    /// The newest record of `slot` across all replicas.
    pub(crate) fn latest(&self, slot: usize) -> Option<Record> {
        newest(self.replicas.iter().filter_map(|replica| self.read(replica, slot)))
    }

    /// Writes the newest record of every written slot back to `backing`.
    ///
    /// Must not race with writers of this store.
    pub(crate) fn flush_to<B: BackingIndex + ?Sized>(&self, backing: &B) -> usize {
        let mut flushed = 0;
        for (slot, key) in self.keys.iter().enumerate() {
            match self.latest(slot) {
                Some((_, Some(value))) => backing.put(key, &value, true),
                Some((_, None)) => backing.del(key),
                None => continue,
            }
            flushed += 1;
        }
        flushed
    }

    /// Durably records that every value of this store has reached the backing index, so a restart
    /// does not write it back again.
    pub(crate) fn mark_drained(&self) -> Result<()> {
        for replica in &self.replicas {
            replica.header()[DRAINED_WORD].store(1, Ordering::Release);
            replica.region.persist(DRAINED_WORD * WORD, WORD)?;
        }
        Ok(())
    }

    /// Reads one replica's raw record, with the tombstone bit still in the version.
    fn read(&self, replica: &Replica, slot: usize) -> Option<(u64, Vec<u8>)> {
        match self.layout {
            ValueLayout::Fixed8 => replica.fixed()[slot]
                .read()
                .map(|(version, value)| (version, value.to_le_bytes().to_vec())),
            ValueLayout::Variable => {
                let handle = CowHandle::from_raw(replica.handles()[slot].load(Ordering::Acquire))?;
                match self.cow.read(handle, decode_record) {
                    Ok(record) => Some(record),
                    Err(error) => fatal(&format!("reading a copy-on-write record failed: {error}")),
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed_slot(&self, node: usize, slot: usize) -> &FixedSlot {
        assert_eq!(self.layout, ValueLayout::Fixed8, "store uses the variable layout");
        &self.replicas[node].fixed()[slot]
    }
}

impl Drop for ValueStore {
    fn drop(&mut self) {
        if self.layout != ValueLayout::Variable {
            return;
        }
        for replica in &self.replicas {
            for handle in replica
                .handles()
                .iter()
                .filter_map(|raw| CowHandle::from_raw(raw.load(Ordering::Acquire)))
            {
                if let Err(error) = self.cow.free(handle) {
                    fatal(&format!("freeing a retired copy-on-write record failed: {error}"));
                }
            }
        }
    }
}

/// A replica read back from the file an earlier process left behind.
#[derive(Debug)]
pub(crate) struct ReplicaImage<'a> {
    bytes: &'a [u8],
    layout: ValueLayout,
    slots: usize,
    drained: bool,
}

impl<'a> ReplicaImage<'a> {
    /// Parses a replica file. Returns `None` when the replica was never completely created.
    pub(crate) fn parse(bytes: &'a [u8]) -> Option<Self> {
        let word = |index: usize| read_u64(bytes, index * WORD);
        if word(MAGIC_WORD)? != STORE_MAGIC {
            return None;
        }

        let image = Self {
            bytes,
            layout: ValueLayout::from_code(word(LAYOUT_WORD)?)?,
            slots: usize::try_from(word(SLOTS_WORD)?).ok()?,
            drained: word(DRAINED_WORD)? != 0,
        };
        let table_offset = image.table_offset()?;
        (bytes.len() >= table_offset).then_some(image)
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.drained
    }

    /// The keys of the replica, in slot order. `None` when the key table is cut short.
    pub(crate) fn keys(&self) -> Option<Vec<Vec<u8>>> {
        let mut cursor = self.table_offset()?;
        (0..self.slots)
            .map(|_| {
                let len = self.bytes.get(cursor..cursor + KEY_LEN)?;
                let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
                let key = self.bytes.get(cursor + KEY_LEN..cursor + KEY_LEN + len)?;
                cursor += KEY_LEN + len;
                Some(key.to_vec())
            })
            .collect()
    }

    /// The raw record of `slot`, with the tombstone bit still in the version.
    ///
    /// `load` returns the contents of the copy-on-write buffer behind a handle of the variable
    /// layout.
    pub(crate) fn record(&self, slot: usize, load: impl FnOnce(CowHandle) -> Result<Vec<u8>>) -> Result<Option<(u64, Vec<u8>)>> {
        let base = SLOTS_OFFSET + slot * self.layout.slot_size();
        let word = |offset: usize| {
            read_u64(self.bytes, base + offset).ok_or_else(|| Error::from_message(format!("slot {slot} lies past the end of its replica")))
        };

        match self.layout {
            ValueLayout::Fixed8 => match self.bytes.get(base).copied() {
                Some(EMPTY) => Ok(None),
                Some(selected @ (1 | 2)) => {
                    let incarnation = usize::from(selected - 1) * WORD;
                    let version = word(offset_of!(FixedSlot, versions) + incarnation)?;
                    let value = word(offset_of!(FixedSlot, values) + incarnation)?;
                    Ok(Some((version, value.to_le_bytes().to_vec())))
                }
                other => Err(Error::from_message(format!("slot {slot} has an invalid selector {other:?}"))),
            },
            ValueLayout::Variable => match CowHandle::from_raw(word(0)?) {
                Some(handle) => {
                    let buffer = load(handle)?;
                    if buffer.len() < RECORD_HEADER {
                        return Err(Error::from_message(format!("{handle:?} holds a truncated record")));
                    }
                    Ok(Some(decode_record(&buffer)))
                }
                None => Ok(None),
            },
        }
    }

    fn table_offset(&self) -> Option<usize> {
        self.slots.checked_mul(self.layout.slot_size())?.checked_add(SLOTS_OFFSET)
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let word = bytes.get(offset..offset.checked_add(WORD)?)?;
    Some(u64::from_le_bytes(word.try_into().ok()?))
}

fn fixed_word(value: &[u8]) -> u64 {
    let mut word = [0; FIXED_VALUE_LEN];
    let len = value.len().min(FIXED_VALUE_LEN);
    word[..len].copy_from_slice(&value[..len]);
    u64::from_le_bytes(word)
}

fn decode_record(bytes: &[u8]) -> (u64, Vec<u8>) {
    let mut version = [0; 8];
    version.copy_from_slice(&bytes[..8]);
    let mut len = [0; 4];
    len.copy_from_slice(&bytes[8..RECORD_HEADER]);
    let len = (u32::from_le_bytes(len) as usize).min(bytes.len() - RECORD_HEADER);
    (u64::from_le_bytes(version), bytes[RECORD_HEADER..RECORD_HEADER + len].to_vec())
}
