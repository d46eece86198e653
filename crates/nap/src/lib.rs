// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A transparent, NUMA-aware hot-key cache with persistent memory.
//!
//! This crate provides [`Nap`], a cache that sits in front of any key-value index implementing
//! [`BackingIndex`] and absorbs the traffic of its hottest keys. It combines several techniques:
//!
//! 1. **Sampled Hot-Key Detection:** Workers drop a sample of the keys they touch into per-worker
//!    rings. A background thread folds them into a count-min sketch and a top-K heap.
//! 2. **Epoch Rotation:** When the hot set has shifted enough, the background thread publishes a
//!    new *epoch* (a fixed key set with its own value storage) through sequence-locked slots and
//!    drains the old epoch into it without stopping the workers.
//! 3. **Per-Node Replicas:** Every hot value is written to the replica of the writer's NUMA node.
//!    Readers reconcile replicas by version only when an epoch is written back.
//! 4. **Crash-Consistent Values:** Fixed-size values are double-buffered words flipped by a
//!    persisted selector; variable-size values are copy-on-write records. Both live in
//!    memory-mapped pools that can be backed by files.
//! 5. **Thread-Aware Integration:** Workers are identified by [`PinnedAffinity`] values from
//!    [`thread_aware`], which select their bookkeeping slot and their NUMA replica.
//!
//! # Architecture
//!
//! Every operation first consults the serving epoch's hot-key view:
//!
//! - **Hot key:** served from the epoch's cached value and written to the local replica.
//! - **Key only in the draining epoch:** waits for the drain to finish, then retries.
//! - **Cold key:** forwarded to the backing index under a read-friendly lock that keeps it from
//!   overlapping the installation of a new epoch.
//!
//! A worker records which epoch it is operating in and whether it is inside the cache at all.
//! The rotation thread uses these records to wait until every worker has seen a new epoch before
//! draining the old one, and until every worker has moved on before freeing it.
//!
//! | Operation | Hot key | Cold key |
//! | :--- | :--- | :--- |
//! | **`get`** | $O(1)$, cached value | backing index |
//! | **`put`** | $O(1)$, local replica write | backing index |
//! | **`del`** | $O(1)$, tombstone in local replica | backing index |
//!
//! Writes to hot keys reach the backing index when their epoch is rotated out, on
//! [`Nap::recovery`], and when the cache is dropped. With file-backed pools
//! ([`NapBuilder::pool_dir`]), the hot values of a process that stopped without dropping its cache
//! are written back when the next cache is built on the same directory.
//!
//! # Example
//!
//! ```
//! use nap::{MemoryIndex, Nap};
//! use thread_aware::affinity::pinned_affinities;
//!
//! // Two NUMA nodes with two processors each.
//! let affinities = pinned_affinities(&[2, 2]);
//!
//! let nap = Nap::builder(MemoryIndex::new())
//!     .affinities(&affinities)
//!     .background_rotation(false)
//!     .build()?;
//!
//! // Cold keys go straight to the backing index.
//! nap.put(affinities[0], b"k0", &1_u64.to_le_bytes(), false);
//! assert!(!nap.is_hot(b"k0"));
//!
//! // Make `k0` hot by hand; normally the background thread decides.
//! nap.rotate_to([b"k0"]);
//! assert!(nap.is_hot(b"k0"));
//!
//! // The first read pulls the value in, writes stay in the cache.
//! assert_eq!(nap.get(affinities[2], b"k0").as_deref(), Some(1_u64.to_le_bytes().as_slice()));
//! nap.put(affinities[3], b"k0", &2_u64.to_le_bytes(), true);
//! assert_eq!(nap.get(affinities[1], b"k0").as_deref(), Some(2_u64.to_le_bytes().as_slice()));
//! # Ok::<(), nap::Error>(())
//! ```
//!
//! # Features
//!
//! - `range`: keeps hot-key views ordered and adds [`Nap::range_query`] and
//!   [`Nap::internal_query`], best-effort scans over the serving epoch's cached values.

mod builder;
mod cow;
mod entry_lock;
mod epoch;
mod error;
mod index;
mod nap;
mod persist;
mod pool;
mod read_friendly_lock;
mod recovery;
mod rotation;
mod sketch;
mod spin;
mod store;
mod top_k;
mod topology;
mod view;

pub use builder::NapBuilder;
pub use error::{Error, Result};
pub use index::{BackingIndex, MemoryIndex};
pub use nap::Nap;
pub use read_friendly_lock::{ReadFriendlyLock, ReadFriendlyReadGuard, ReadFriendlyWriteGuard};
pub use store::{FIXED_VALUE_LEN, MAX_VARIABLE_VALUE_LEN, ValueLayout};

// Re-export thread_aware types for convenience
pub use thread_aware::affinity::PinnedAffinity;

#[cfg(test)]
mod tests;
