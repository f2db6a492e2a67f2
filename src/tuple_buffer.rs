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

//! An ordered, immutable-after-close sequence of [`TupleBatch`]es.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::batch_store::BatchStore;
use crate::error::{BufferManagerError, Result};
use crate::lob_manager::LobManager;
use crate::managed_batch::ManagedBatch;
use crate::tuple_batch::TupleBatch;
use crate::types::{Row, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleBufferState {
    Open,
    Closed,
    Removed,
}

/// An ordered sequence of batches identified by a unique, monotonic string
/// id. Rows are appended until `close`; the buffer is read-only afterward.
/// Its owning handle's `Drop` runs the cleanup hook deterministically,
/// standing in for the original design's finalizer-driven `CleanupHook`
/// (§9 design note).
pub struct TupleBuffer {
    id: String,
    schema: Arc<Vec<Type>>,
    batch_size: usize,
    prefers_memory: bool,
    has_lobs: bool,
    forward_only: bool,
    lob_manager: Option<Arc<LobManager>>,
    lob_column_indexes: Vec<usize>,
    store: Arc<BatchStore>,
    row_count: AtomicI64,
    state: Mutex<TupleBufferState>,
    batches: RwLock<BTreeMap<i64, Arc<ManagedBatch>>>,
    cleanup_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("id", &self.id)
            .field("batch_size", &self.batch_size)
            .field("prefers_memory", &self.prefers_memory)
            .field("has_lobs", &self.has_lobs)
            .field("forward_only", &self.forward_only)
            .field("lob_column_indexes", &self.lob_column_indexes)
            .field("row_count", &self.row_count)
            .finish_non_exhaustive()
    }
}

impl TupleBuffer {
    pub(crate) fn new(
        id: String,
        schema: Vec<Type>,
        batch_size: usize,
        prefers_memory: bool,
        forward_only: bool,
        store: Arc<BatchStore>,
        lob_manager: Option<Arc<LobManager>>,
    ) -> Self {
        let has_lobs = schema.iter().any(|t| *t == Type::Lob);
        let lob_column_indexes = schema
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == Type::Lob)
            .map(|(i, _)| i)
            .collect();
        TupleBuffer {
            id,
            schema: Arc::new(schema),
            batch_size,
            prefers_memory,
            has_lobs,
            forward_only,
            lob_manager,
            lob_column_indexes,
            store,
            row_count: AtomicI64::new(0),
            state: Mutex::new(TupleBufferState::Open),
            batches: RwLock::new(BTreeMap::new()),
            cleanup_hook: Mutex::new(None),
        }
    }

    pub(crate) fn install_cleanup_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.cleanup_hook.lock() = Some(hook);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &[Type] {
        &self.schema
    }

    pub fn schema_arc(&self) -> Arc<Vec<Type>> {
        self.schema.clone()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn prefers_memory(&self) -> bool {
        self.prefers_memory
    }

    pub fn has_lobs(&self) -> bool {
        self.has_lobs
    }

    pub fn forward_only(&self) -> bool {
        self.forward_only
    }

    pub fn row_count(&self) -> i64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TupleBufferState {
        *self.state.lock()
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    pub fn lob_manager(&self) -> Option<&Arc<LobManager>> {
        self.lob_manager.as_ref()
    }

    pub fn lob_column_indexes(&self) -> &[usize] {
        &self.lob_column_indexes
    }

    fn require_open(&self) -> Result<()> {
        if *self.state.lock() != TupleBufferState::Open {
            return Err(BufferManagerError::closed(self.id.clone()));
        }
        Ok(())
    }

    /// Appends `rows` as a new resident batch. `rows.len()` must not exceed
    /// `batch_size`. Returns the new managed batch for the caller (the
    /// buffer manager) to account and register in the eviction index.
    pub fn append(&self, rows: Vec<Row>) -> Result<Arc<ManagedBatch>> {
        self.require_open()?;
        if rows.len() > self.batch_size {
            return Err(BufferManagerError::format(format!(
                "batch of {} rows exceeds batch_size {}",
                rows.len(),
                self.batch_size
            )));
        }
        let begin_row = self.row_count.fetch_add(rows.len() as i64, Ordering::AcqRel);
        let has_lobs = self.has_lobs && rows.iter().any(|r| r.iter().any(|v| v.is_lob()));
        let batch = TupleBatch::new(begin_row, rows, self.schema.as_ref().clone());
        let batch_len = batch.len() as u64;
        let managed = Arc::new(ManagedBatch::new_resident(
            self.store.next_batch_id(),
            self.store.id().to_string(),
            begin_row,
            batch,
            batch_len, // placeholder, caller overwrites with a real KB estimate before charging
            self.prefers_memory,
            has_lobs,
        ));
        self.batches.write().insert(begin_row, managed.clone());
        Ok(managed)
    }

    /// Closes the buffer: no further appends are accepted.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == TupleBufferState::Open {
            *state = TupleBufferState::Closed;
        }
    }

    /// Marks the buffer removed, runs its cleanup hook, and returns whether
    /// this call actually performed the removal (idempotent).
    pub fn remove(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TupleBufferState::Removed {
            return false;
        }
        *state = TupleBufferState::Removed;
        drop(state);
        if let Some(hook) = self.cleanup_hook.lock().take() {
            hook();
        }
        true
    }

    /// Looks up the batch covering `row`, i.e. the entry with the greatest
    /// `begin_row <= row` whose range contains it.
    pub fn batch_covering(&self, row: i64) -> Option<Arc<ManagedBatch>> {
        self.batches
            .read()
            .range(..=row)
            .next_back()
            .map(|(_, mb)| mb.clone())
    }

    pub fn batch_at(&self, begin_row: i64) -> Option<Arc<ManagedBatch>> {
        self.batches.read().get(&begin_row).cloned()
    }

    /// All batches in row order, for snapshotting via `StateCodec`.
    pub fn batches_in_order(&self) -> Vec<Arc<ManagedBatch>> {
        self.batches.read().values().cloned().collect()
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if let Some(hook) = self.cleanup_hook.lock().take() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::LocalStorageManager;
    use crate::types::Value;

    fn buffer() -> (tempfile::TempDir, TupleBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(LocalStorageManager::new(dir.path()).unwrap());
        let store = Arc::new(BatchStore::new("tb-x".into(), mgr).unwrap());
        let tb = TupleBuffer::new("tb-x".into(), vec![Type::I64], 4, true, false, store, None);
        (dir, tb)
    }

    #[test]
    fn append_tracks_contiguous_ranges() {
        let (_dir, tb) = buffer();
        let b1 = tb.append(vec![vec![Value::I64(1)], vec![Value::I64(2)]]).unwrap();
        let b2 = tb.append(vec![vec![Value::I64(3)]]).unwrap();
        assert_eq!(b1.begin_row(), 0);
        assert_eq!(b2.begin_row(), 2);
        assert_eq!(tb.row_count(), 3);
    }

    #[test]
    fn append_after_close_fails() {
        let (_dir, tb) = buffer();
        tb.close();
        assert!(tb.append(vec![vec![Value::I64(1)]]).is_err());
    }

    #[test]
    fn rejects_oversized_batches() {
        let (_dir, tb) = buffer();
        let rows = (0..10).map(|i| vec![Value::I64(i)]).collect();
        assert!(tb.append(rows).is_err());
    }

    #[test]
    fn remove_runs_cleanup_hook_once() {
        let (_dir, tb) = buffer();
        let ran = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran2 = ran.clone();
        tb.install_cleanup_hook(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(tb.remove());
        assert!(!tb.remove());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
