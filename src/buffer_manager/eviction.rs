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

//! The eviction lock (§5 tier 2): an insertion-ordered map of stores with
//! active batches, and the per-store LRU-by-position tie-break rule.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::batch_store::BatchStore;
use crate::managed_batch::ManagedBatch;
use crate::types::Type;

struct StoreEntry {
    store: Arc<BatchStore>,
    schema: Arc<Vec<Type>>,
    batches: BTreeMap<i64, Arc<ManagedBatch>>,
    last_used: i64,
}

/// A selected eviction victim, with everything `ManagedBatch::persist` needs.
pub struct Victim {
    pub store: Arc<BatchStore>,
    pub schema: Arc<Vec<Type>>,
    pub batch: Arc<ManagedBatch>,
}

#[derive(Default)]
struct Inner {
    stores: IndexMap<String, StoreEntry>,
    active_batch_kb: u64,
}

/// Tracks every currently-active (resident or cached) batch, grouped by
/// owning store, in insertion order so the map's head is always the
/// least-recently-touched store.
pub struct EvictionIndex {
    inner: Mutex<Inner>,
}

impl Default for EvictionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionIndex {
    pub fn new() -> Self {
        EvictionIndex {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn active_batch_kb(&self) -> u64 {
        self.inner.lock().active_batch_kb
    }

    /// Registers a newly-active batch, charging its size and moving its
    /// store to the most-recently-used end.
    pub fn register(&self, store: &Arc<BatchStore>, schema: &Arc<Vec<Type>>, batch: Arc<ManagedBatch>, size_kb: u64) {
        let mut inner = self.inner.lock();
        inner.active_batch_kb += size_kb;
        let begin_row = batch.begin_row();
        let store_id = store.id().to_string();

        let mut entry = inner.stores.shift_remove(&store_id).unwrap_or_else(|| StoreEntry {
            store: store.clone(),
            schema: schema.clone(),
            batches: BTreeMap::new(),
            last_used: begin_row,
        });
        entry.last_used = begin_row;
        entry.batches.insert(begin_row, batch);
        inner.stores.insert(store_id, entry);
    }

    /// Marks `store_id` most-recently-used and records `last_used`, per
    /// §4.E `get_batch` step 1. A no-op if the store has no active batches
    /// (e.g. it was just fully evicted).
    pub fn touch(&self, store_id: &str, last_used: i64) {
        let mut inner = self.inner.lock();
        if let Some(mut entry) = inner.stores.shift_remove(store_id) {
            entry.last_used = last_used;
            inner.stores.insert(store_id.to_string(), entry);
        }
    }

    /// Removes `batch` from its store's active set, decrementing
    /// `active_batch_kb`. Drops the store entry entirely once it has no
    /// remaining active batches.
    pub fn unregister(&self, store_id: &str, begin_row: i64, size_kb: u64) {
        let mut inner = self.inner.lock();
        inner.active_batch_kb = inner.active_batch_kb.saturating_sub(size_kb);
        if let Some(entry) = inner.stores.get_mut(store_id) {
            entry.batches.remove(&begin_row);
            if entry.batches.is_empty() {
                inner.stores.shift_remove(store_id);
            }
        }
    }

    /// Picks a victim from the least-recently-used store (the head of the
    /// insertion-ordered map), applying the forward-scan tie-break rule
    /// within it: the greatest key `<= last_used - 1`, or the largest key
    /// if none precedes `last_used`. Removes the victim from the index.
    pub fn evict_one(&self) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let (store_id, entry) = inner.stores.get_index_mut(0).map(|(k, v)| (k.clone(), v))?;

        let cutoff = entry.last_used - 1;
        let victim_key = entry
            .batches
            .range(..=cutoff)
            .next_back()
            .map(|(k, _)| *k)
            .or_else(|| entry.batches.keys().next_back().copied())?;
        let batch = entry.batches.remove(&victim_key)?;
        let store = entry.store.clone();
        let schema = entry.schema.clone();
        let size_kb = batch.size_estimate_kb();

        if entry.batches.is_empty() {
            inner.stores.shift_remove(&store_id);
        }
        inner.active_batch_kb = inner.active_batch_kb.saturating_sub(size_kb);

        Some(Victim { store, schema, batch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::LocalStorageManager;
    use crate::tuple_batch::TupleBatch;
    use crate::types::Value;

    fn fixture_store(id: &str, dir: &std::path::Path) -> Arc<BatchStore> {
        let mgr = Arc::new(LocalStorageManager::new(dir).unwrap());
        Arc::new(BatchStore::new(id.to_string(), mgr).unwrap())
    }

    fn fixture_batch(store: &Arc<BatchStore>, begin_row: i64) -> Arc<ManagedBatch> {
        let types = vec![Type::I64];
        Arc::new(ManagedBatch::new_resident(
            store.next_batch_id(),
            store.id().to_string(),
            begin_row,
            TupleBatch::new(begin_row, vec![vec![Value::I64(begin_row)]], types),
            1,
            true,
            false,
        ))
    }

    #[test]
    fn evicts_from_the_least_recently_used_store_first() {
        let dir = tempfile::tempdir().unwrap();
        let index = EvictionIndex::new();
        let schema = Arc::new(vec![Type::I64]);

        let store_a = fixture_store("a", dir.path());
        let store_b = fixture_store("b", dir.path());
        index.register(&store_a, &schema, fixture_batch(&store_a, 0), 10);
        index.register(&store_b, &schema, fixture_batch(&store_b, 0), 10);

        let victim = index.evict_one().unwrap();
        assert_eq!(victim.store.id(), "a");
    }

    #[test]
    fn tie_break_prefers_the_batch_before_the_read_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let index = EvictionIndex::new();
        let schema = Arc::new(vec![Type::I64]);
        let store = fixture_store("s", dir.path());

        for row in [0, 5, 10, 20] {
            index.register(&store, &schema, fixture_batch(&store, row), 1);
        }
        index.touch("s", 10);

        let victim = index.evict_one().unwrap();
        assert_eq!(victim.batch.begin_row(), 5);
    }

    #[test]
    fn tie_break_falls_back_to_the_largest_key_when_none_precede_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let index = EvictionIndex::new();
        let schema = Arc::new(vec![Type::I64]);
        let store = fixture_store("s", dir.path());

        for row in [5, 10, 20] {
            index.register(&store, &schema, fixture_batch(&store, row), 1);
        }
        index.touch("s", 0);

        let victim = index.evict_one().unwrap();
        assert_eq!(victim.batch.begin_row(), 20);
    }

    #[test]
    fn store_entry_is_dropped_once_fully_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let index = EvictionIndex::new();
        let schema = Arc::new(vec![Type::I64]);
        let store = fixture_store("s", dir.path());
        index.register(&store, &schema, fixture_batch(&store, 0), 4);

        assert!(index.evict_one().is_some());
        assert!(index.evict_one().is_none());
        assert_eq!(index.active_batch_kb(), 0);
    }
}
