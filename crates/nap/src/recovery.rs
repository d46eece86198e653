// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Write-back of the hot values an earlier process left in file-backed pools.
//!
//! A process that stops without dropping its cache leaves the value store replicas of its live
//! epochs behind, along with the copy-on-write blocks their records point into. Before new pools
//! are opened, every store that was not drained is written back to the backing index, oldest epoch
//! first, and all of those files are removed.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::cow::CowHandle;
use crate::error::{Error, Result};
use crate::index::BackingIndex;
use crate::pool::{BLOCK_PREFIX, STORE_PREFIX, node_dir};
use crate::store::{ReplicaImage, newest};

/// What a write-back found under a pool directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Recovered {
    /// Epochs whose stores were written back.
    pub epochs: usize,
    /// Values and deletions written to the backing index.
    pub values: usize,
    /// Replica and block files removed.
    pub removed: usize,
}

/// Writes the undrained stores found under `root` back to `backing` and removes every replica and
/// block file.
///
/// Within a store, the newest record of each key across replicas wins. Stores are replayed in epoch
/// order, so a key hot in two interrupted epochs ends up with the newer epoch's value.
pub(crate) fn write_back<B: BackingIndex + ?Sized>(root: &Path, backing: &B) -> Result<Recovered> {
    let mut stores: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    let mut stale = Vec::new();

    for dir in node_dirs(root)? {
        for entry in fs::read_dir(&dir).map_err(Error::from_message)? {
            let path = entry.map_err(Error::from_message)?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            if let Some(epoch) = name.strip_prefix(STORE_PREFIX).and_then(|epoch| epoch.parse().ok()) {
                stores.entry(epoch).or_default().push(path.clone());
                stale.push(path);
            } else if name.starts_with(BLOCK_PREFIX) {
                stale.push(path);
            }
        }
    }

    let mut recovered = Recovered::default();
    let mut blocks = Blocks::new(root);
    for (epoch, paths) in &stores {
        let files = paths
            .iter()
            .map(|path| fs::read(path).map_err(Error::from_message))
            .collect::<Result<Vec<_>>>()?;
        let images: Vec<_> = files.iter().filter_map(|bytes| ReplicaImage::parse(bytes)).collect();

        // A store missing a replica was never installed; one with a drained replica was written back
        // in full before it was marked.
        if images.len() < files.len() || images.iter().any(ReplicaImage::is_drained) {
            continue;
        }

        let keys = images[0]
            .keys()
            .ok_or_else(|| Error::from_message(format!("the key table of epoch {epoch} is cut short")))?;
        let mut values = 0;
        for (slot, key) in keys.iter().enumerate() {
            let mut records = Vec::with_capacity(images.len());
            for image in &images {
                if let Some(record) = image.record(slot, |handle| blocks.load(handle))? {
                    records.push(record);
                }
            }

            match newest(records) {
                Some((_, Some(value))) => backing.put(key, &value, true),
                Some((_, None)) => backing.del(key),
                None => continue,
            }
            values += 1;
        }

        tracing::info!(epoch, keys = keys.len(), values, "wrote back the hot values of an interrupted epoch");
        recovered.epochs += 1;
        recovered.values += values;
    }

    for path in stale {
        fs::remove_file(&path).map_err(Error::from_message)?;
        recovered.removed += 1;
    }

    Ok(recovered)
}

/// The `node-<n>` directories under `root`, none when `root` does not exist yet.
fn node_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(Error::from_message(error)),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(Error::from_message)?.path();
        let is_node = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("node-"))
            .is_some_and(|node| node.parse::<usize>().is_ok());
        if is_node && path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

/// Copy-on-write blocks read from disk on first use.
#[derive(Debug)]
struct Blocks<'a> {
    root: &'a Path,
    loaded: HashMap<(usize, usize), Vec<u8>>,
}

impl<'a> Blocks<'a> {
    fn new(root: &'a Path) -> Self {
        Self {
            root,
            loaded: HashMap::new(),
        }
    }

    /// The full contents of the buffer behind `handle`.
    fn load(&mut self, handle: CowHandle) -> Result<Vec<u8>> {
        let (block, offset) = handle.placement();
        let id = (handle.pool(), block);
        if !self.loaded.contains_key(&id) {
            let path = node_dir(self.root, handle.pool()).join(format!("{BLOCK_PREFIX}{block}"));
            let bytes = fs::read(&path).map_err(|error| Error::from_message(format!("{}: {error}", path.display())))?;
            self.loaded.insert(id, bytes);
        }

        self.loaded
            .get(&id)
            .and_then(|bytes| bytes.get(offset..offset + handle.capacity()))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::from_message(format!("{handle:?} lies past the end of its block")))
    }
}
