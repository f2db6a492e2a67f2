// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Per-tuple-buffer on-disk backing: one append-only file plus a physical
//! offset map, compacted when fragmentation grows large.

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{BufferManagerError, Result};
use crate::file_store::{FileStore, StorageManager};
use crate::tuple_batch::TupleBatch;
use crate::types::Type;

/// File length above which compaction becomes eligible.
pub const COMPACTION_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024;
/// Fraction of the file that must be dead space before compaction runs.
pub const COMPACTION_WASTE_RATIO: f64 = 0.75;
/// Buffer size used for both batch writes and compaction copies.
const IO_BUFFER_BYTES: usize = 16 * 1024;

struct Inner {
    file: Arc<dyn FileStore>,
    /// `batch_id -> (offset, length)`. Invariant: every entry's
    /// `[offset, offset+length)` lies within `[0, file_len)`.
    physical_map: HashMap<u64, (u64, u64), RandomState>,
    file_len: u64,
    unused_space: u64,
    compaction_generation: u64,
}

/// One tuple source's spill file. Readers take the compaction lock's read
/// side while consuming serialized bytes; the compactor takes the write
/// side (§5 tier 4). Ordinary appends also take the write side, since a
/// single append-only file requires writers to be serialized with respect
/// to both each other and the compactor.
pub struct BatchStore {
    id: String,
    storage_manager: Arc<dyn StorageManager>,
    inner: RwLock<Inner>,
    next_batch_id: AtomicU64,
}

impl BatchStore {
    pub fn new(id: String, storage_manager: Arc<dyn StorageManager>) -> Result<Self> {
        let file = storage_manager.create_file_store(&format!("{id}.batch"))?;
        let file_len = file.length()?;
        Ok(BatchStore {
            id,
            storage_manager,
            inner: RwLock::new(Inner {
                file,
                physical_map: HashMap::default(),
                file_len,
                unused_space: 0,
                compaction_generation: 0,
            }),
            next_batch_id: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens a subordinate file store for auxiliary data (e.g. ordered-tree
    /// key pages), under a name derived from this store's id.
    pub fn create_storage(&self, prefix: &str) -> Result<Arc<dyn FileStore>> {
        self.storage_manager
            .create_file_store(&format!("{}.{prefix}", self.id))
    }

    /// Writes `batch`'s row payload to the backing file, compacting first
    /// if the store has crossed the fragmentation threshold. Returns the
    /// `(offset, length)` recorded in the physical map.
    pub fn write_batch(&self, batch_id: u64, batch: &mut TupleBatch, types: &[Type]) -> Result<(u64, u64)> {
        let mut inner = self.inner.write();
        self.maybe_compact_locked(&mut inner)?;

        let offset = inner.file_len;
        let expected_len = batch.encoded_len(types) as u64;
        {
            let out = inner.file.create_output_stream()?;
            let mut writer = BufWriter::with_capacity(IO_BUFFER_BYTES, out);
            batch.encode(types, &mut writer)?;
            writer.flush()?;
        }
        inner.file_len += expected_len;
        inner.physical_map.insert(batch_id, (offset, expected_len));
        Ok((offset, expected_len))
    }

    /// Reads and decodes the batch stored at `batch_id`.
    pub fn read_batch(&self, batch_id: u64, types: &[Type]) -> Result<TupleBatch> {
        let inner = self.inner.read();
        let (offset, length) = *inner
            .physical_map
            .get(&batch_id)
            .ok_or_else(|| BufferManagerError::not_found(batch_id.to_string()))?;
        let mut buf = vec![0u8; length as usize];
        inner.file.read_fully(offset, &mut buf)?;
        drop(inner);
        TupleBatch::decode(&mut BufReader::with_capacity(IO_BUFFER_BYTES, &buf[..]), types)
    }

    /// Frees a batch's slot, incrementing `unused_space`. Called from the
    /// cleanup hook when a `ManagedBatch` is removed.
    pub fn free_batch(&self, batch_id: u64) {
        let mut inner = self.inner.write();
        if let Some((_, length)) = inner.physical_map.remove(&batch_id) {
            inner.unused_space += length;
        }
    }

    pub fn file_len(&self) -> u64 {
        self.inner.read().file_len
    }

    pub fn unused_space(&self) -> u64 {
        self.inner.read().unused_space
    }

    pub fn live_batch_count(&self) -> usize {
        self.inner.read().physical_map.len()
    }

    /// Deletes the underlying file. Called when the owning tuple buffer is
    /// fully removed.
    pub fn remove(&self) -> Result<()> {
        self.inner.read().file.remove()
    }

    fn should_compact_locked(inner: &Inner) -> bool {
        inner.file_len > COMPACTION_THRESHOLD_BYTES
            && (inner.unused_space as f64) > COMPACTION_WASTE_RATIO * inner.file_len as f64
    }

    fn maybe_compact_locked(&self, inner: &mut Inner) -> Result<()> {
        if Self::should_compact_locked(inner) {
            self.compact_locked(inner)?;
        }
        Ok(())
    }

    /// Rewrites the backing file keeping only live mapped regions, in
    /// ascending offset order, through a 16 KiB buffer. Unconditional; the
    /// fragmentation predicate is checked by callers.
    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.compaction_generation += 1;
        let new_name = format!("{}.batch.c{}", self.id, inner.compaction_generation);
        let new_file = self.storage_manager.create_file_store(&new_name)?;

        let mut ids: Vec<u64> = inner.physical_map.keys().copied().collect();
        ids.sort_by_key(|id| inner.physical_map[id].0);

        let mut running_offset = 0u64;
        let mut new_map = HashMap::with_capacity_and_hasher(ids.len(), RandomState::default());
        {
            let out = new_file.create_output_stream()?;
            let mut writer = BufWriter::with_capacity(IO_BUFFER_BYTES, out);
            let mut copy_buf = vec![0u8; IO_BUFFER_BYTES];
            for id in ids {
                let (offset, length) = inner.physical_map[&id];
                let mut remaining = length;
                let mut src_offset = offset;
                while remaining > 0 {
                    let chunk = remaining.min(IO_BUFFER_BYTES as u64) as usize;
                    inner.file.read_fully(src_offset, &mut copy_buf[..chunk])?;
                    writer.write_all(&copy_buf[..chunk])?;
                    src_offset += chunk as u64;
                    remaining -= chunk as u64;
                }
                new_map.insert(id, (running_offset, length));
                running_offset += length;
            }
            writer.flush()?;
        }

        let old_file = std::mem::replace(&mut inner.file, new_file);
        old_file.remove()?;
        inner.physical_map = new_map;
        inner.file_len = running_offset;
        inner.unused_space = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn force_compact(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.compact_locked(&mut inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::LocalStorageManager;
    use crate::types::Value;

    fn store() -> (tempfile::TempDir, BatchStore) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(LocalStorageManager::new(dir.path()).unwrap());
        let store = BatchStore::new("tb-1".into(), mgr).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        let types = vec![Type::I64];
        let id = store.next_batch_id();
        let mut batch = TupleBatch::new(0, vec![vec![Value::I64(42)]], types.clone());
        store.write_batch(id, &mut batch, &types).unwrap();

        let read_back = store.read_batch(id, &types).unwrap();
        assert_eq!(read_back.rows(), batch.rows());
    }

    #[test]
    fn free_batch_accounts_unused_space() {
        let (_dir, store) = store();
        let types = vec![Type::I64];
        let id = store.next_batch_id();
        let mut batch = TupleBatch::new(0, vec![vec![Value::I64(1)]], types.clone());
        let (_, len) = store.write_batch(id, &mut batch, &types).unwrap();
        store.free_batch(id);
        assert_eq!(store.unused_space(), len);
        assert_eq!(store.live_batch_count(), 0);
    }

    #[test]
    fn physical_map_invariant_holds_after_writes() {
        let (_dir, store) = store();
        let types = vec![Type::I64];
        for i in 0..20 {
            let id = store.next_batch_id();
            let mut batch = TupleBatch::new(i, vec![vec![Value::I64(i)]], types.clone());
            store.write_batch(id, &mut batch, &types).unwrap();
        }
        let inner = store.inner.read();
        let sum: u64 = inner.physical_map.values().map(|(_, len)| *len).sum();
        assert_eq!(sum + inner.unused_space, inner.file_len);
    }

    #[test]
    fn compaction_shrinks_file_and_preserves_data() {
        let (_dir, store) = store();
        let types = vec![Type::Bytes];
        let payload = vec![7u8; 200_000];
        let mut ids = Vec::new();
        for i in 0..400 {
            let id = store.next_batch_id();
            let mut batch = TupleBatch::new(i, vec![vec![Value::Bytes(payload.clone())]], types.clone());
            store.write_batch(id, &mut batch, &types).unwrap();
            ids.push(id);
        }
        let pre_len = store.file_len();
        for &id in ids.iter().step_by(2) {
            store.free_batch(id);
        }
        store.force_compact().unwrap();
        let post_len = store.file_len();
        assert!(post_len <= pre_len, "compaction should not grow the file");
        assert!((post_len as f64) < (pre_len as f64) * 0.75);

        for &id in ids.iter().skip(1).step_by(2) {
            let batch = store.read_batch(id, &types).unwrap();
            assert_eq!(batch.rows()[0][0], Value::Bytes(payload.clone()));
        }
    }
}
