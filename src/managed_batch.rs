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

//! The mediating entity between a [`TupleBatch`] and its spill slot.
//!
//! Holds a non-owning `store_id` rather than an `Arc<BatchStore>` back to
//! its store: callers that already hold the owning `Arc<BatchStore>` pass
//! it in explicitly to `get_batch`/`persist`, which keeps `BatchStore` free
//! of any reference back to the batches it backs and avoids the reference
//! cycle the original design's `CleanupHook` worked around (§9).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::batch_store::BatchStore;
use crate::error::Result;
use crate::lob_manager::LobManager;
use crate::soft_cache::{SoftCache, SoftCacheKey};
use crate::tuple_batch::TupleBatch;
use crate::types::Type;

enum Slot {
    Active(TupleBatch),
    NotActive,
}

/// Lifecycle of a single batch: resident in memory, demoted to the
/// second-chance cache, or present only on disk.
pub struct ManagedBatch {
    id: u64,
    store_id: String,
    begin_row: i64,
    size_estimate_kb: AtomicU64,
    prefers_memory: bool,
    has_lobs: bool,
    slot: Mutex<Slot>,
    persistent: AtomicBool,
}

impl ManagedBatch {
    pub fn new_resident(
        id: u64,
        store_id: String,
        begin_row: i64,
        batch: TupleBatch,
        size_estimate_kb: u64,
        prefers_memory: bool,
        has_lobs: bool,
    ) -> Self {
        ManagedBatch {
            id,
            store_id,
            begin_row,
            size_estimate_kb: AtomicU64::new(size_estimate_kb),
            prefers_memory,
            has_lobs,
            slot: Mutex::new(Slot::Active(batch)),
            persistent: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Overwrites the size estimate. Called once by the buffer manager
    /// immediately after construction, before the batch is registered in
    /// the eviction index, once the real `SizeUtility` estimate (which
    /// depends on `value_cache_enabled`) is known.
    pub fn set_size_estimate_kb(&self, kb: u64) {
        self.size_estimate_kb.store(kb, Ordering::Release);
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn begin_row(&self) -> i64 {
        self.begin_row
    }

    pub fn size_estimate_kb(&self) -> u64 {
        self.size_estimate_kb.load(Ordering::Acquire)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// True while this batch is counted in `active_batch_kb`: resident or
    /// cached, never reclaimable/disk-only.
    pub fn is_active(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Active(_))
    }

    fn soft_cache_key(&self) -> SoftCacheKey {
        (self.store_id.clone(), self.id)
    }

    /// §4.E `get_batch`: returns the live batch, resurrects it from the
    /// second-chance cache, or rematerializes it from disk.
    ///
    /// Charging `active_batch_kb` on repromotion is the caller's
    /// responsibility (it owns the eviction-lock-protected counter); this
    /// returns `Ok(true)` when the caller should charge because a demoted
    /// batch was just repromoted to active.
    pub fn get_batch(
        &self,
        cache: bool,
        store: &BatchStore,
        soft_cache: &SoftCache,
        types: &[Type],
        lob_manager: Option<&LobManager>,
        lob_column_indexes: &[usize],
    ) -> Result<(TupleBatch, bool)> {
        let mut slot = self.slot.lock();
        if let Slot::Active(batch) = &*slot {
            return Ok((batch.clone(), false));
        }

        if cache {
            if let Some(batch) = soft_cache.take(&self.soft_cache_key()) {
                let promoted = batch.clone();
                *slot = Slot::Active(batch);
                return Ok((promoted, true));
            }
        } else if let Some(mut batch) = soft_cache.peek(&self.soft_cache_key()) {
            self.maybe_rewrite_lobs(&mut batch, lob_manager, lob_column_indexes)?;
            return Ok((batch, false));
        }

        let mut batch = store.read_batch(self.id, types)?;
        batch.set_begin_row(self.begin_row);
        batch.strip_types();
        self.maybe_rewrite_lobs(&mut batch, lob_manager, lob_column_indexes)?;

        if cache {
            let promoted = batch.clone();
            *slot = Slot::Active(batch);
            return Ok((promoted, true));
        }
        Ok((batch, false))
    }

    fn maybe_rewrite_lobs(
        &self,
        batch: &mut TupleBatch,
        lob_manager: Option<&LobManager>,
        lob_column_indexes: &[usize],
    ) -> Result<()> {
        if !self.has_lobs || lob_column_indexes.is_empty() {
            return Ok(());
        }
        if let Some(lobs) = lob_manager {
            for row in batch.rows() {
                let missing = lobs.rewrite(row, lob_column_indexes)?;
                if !missing.is_empty() {
                    return Err(crate::error::BufferManagerError::lob_missing(format!(
                        "{:?}",
                        missing
                    )));
                }
            }
        }
        Ok(())
    }

    /// §4.E `persist`: writes the batch to disk (no-op if already
    /// persistent or not currently active) and demotes the in-memory slot.
    ///
    /// Returns `true` if this call charged a fresh write (so the caller
    /// knows a file grew), `false` on an idempotent no-op.
    pub fn persist(
        &self,
        store: &BatchStore,
        soft_cache: &SoftCache,
        types: &[Type],
        use_weak_references: bool,
    ) -> Result<bool> {
        let mut slot = self.slot.lock();
        let batch = match std::mem::replace(&mut *slot, Slot::NotActive) {
            Slot::Active(batch) => batch,
            Slot::NotActive => return Ok(false),
        };

        let wrote = if !self.is_persistent() {
            let mut batch = batch;
            store.write_batch(self.id, &mut batch, types)?;
            self.persistent.store(true, Ordering::Release);
            self.demote(batch, soft_cache, use_weak_references);
            true
        } else {
            self.demote(batch, soft_cache, use_weak_references);
            false
        };
        Ok(wrote)
    }

    fn demote(&self, batch: TupleBatch, soft_cache: &SoftCache, use_weak_references: bool) {
        let should_cache = self.prefers_memory || !use_weak_references;
        if should_cache {
            soft_cache.insert(self.soft_cache_key(), batch, self.size_estimate_kb());
        }
    }

    /// Removes this batch's on-disk slot and drops any cached payload.
    /// Invoked from the owning tuple buffer's cleanup hook.
    pub fn cleanup(&self, store: &BatchStore, soft_cache: &SoftCache) {
        soft_cache.remove(&self.soft_cache_key());
        if self.is_persistent() {
            store.free_batch(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::LocalStorageManager;
    use crate::types::Value;
    use std::sync::Arc;

    fn fixtures() -> (tempfile::TempDir, BatchStore, SoftCache) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(LocalStorageManager::new(dir.path()).unwrap());
        let store = BatchStore::new("tb".into(), mgr).unwrap();
        (dir, store, SoftCache::new(1024))
    }

    #[test]
    fn persist_then_get_round_trips() {
        let (_dir, store, cache) = fixtures();
        let types = vec![Type::I64];
        let mb = ManagedBatch::new_resident(
            store.next_batch_id(),
            store.id().to_string(),
            0,
            TupleBatch::new(0, vec![vec![Value::I64(5)]], types.clone()),
            1,
            true,
            false,
        );
        assert!(mb.persist(&store, &cache, &types, true).unwrap());
        assert!(!mb.is_active());
        assert!(mb.is_persistent());

        let (batch, charged) = mb.get_batch(true, &store, &cache, &types, None, &[]).unwrap();
        assert_eq!(batch.rows()[0][0], Value::I64(5));
        assert!(charged);
        assert!(mb.is_active());
    }

    #[test]
    fn persist_is_idempotent() {
        let (_dir, store, cache) = fixtures();
        let types = vec![Type::I64];
        let mb = ManagedBatch::new_resident(
            store.next_batch_id(),
            store.id().to_string(),
            0,
            TupleBatch::new(0, vec![vec![Value::I64(1)]], types.clone()),
            1,
            false,
            false,
        );
        mb.persist(&store, &cache, &types, true).unwrap();
        let len_after_first = store.file_len();
        // Repromote then persist again: second persist must not rewrite.
        mb.get_batch(true, &store, &cache, &types, None, &[]).unwrap();
        mb.persist(&store, &cache, &types, true).unwrap();
        assert_eq!(store.file_len(), len_after_first);
    }

    #[test]
    fn a_non_caching_read_leaves_the_soft_cache_entry_for_the_next_reader() {
        let (_dir, store, cache) = fixtures();
        let types = vec![Type::I64];
        let mb = ManagedBatch::new_resident(
            store.next_batch_id(),
            store.id().to_string(),
            0,
            TupleBatch::new(0, vec![vec![Value::I64(9)]], types.clone()),
            1,
            true,
            false,
        );
        mb.persist(&store, &cache, &types, true).unwrap();
        assert!(cache.contains(&(store.id().to_string(), mb.id())));

        let (first, charged) = mb.get_batch(false, &store, &cache, &types, None, &[]).unwrap();
        assert_eq!(first.rows()[0][0], Value::I64(9));
        assert!(!charged);
        assert!(cache.contains(&(store.id().to_string(), mb.id())));

        let (second, _) = mb.get_batch(false, &store, &cache, &types, None, &[]).unwrap();
        assert_eq!(second.rows()[0][0], Value::I64(9));
    }

    #[test]
    fn weak_eviction_drops_payload_when_not_prefers_memory() {
        let (_dir, store, cache) = fixtures();
        let types = vec![Type::I64];
        let mb = ManagedBatch::new_resident(
            store.next_batch_id(),
            store.id().to_string(),
            0,
            TupleBatch::new(0, vec![vec![Value::I64(1)]], types.clone()),
            1,
            false,
            false,
        );
        mb.persist(&store, &cache, &types, true).unwrap();
        assert_eq!(cache.used_kb(), 0);
        // Still readable from disk.
        let (batch, _) = mb.get_batch(false, &store, &cache, &types, None, &[]).unwrap();
        assert_eq!(batch.rows()[0][0], Value::I64(1));
    }
}
