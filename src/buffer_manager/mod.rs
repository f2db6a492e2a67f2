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

//! The public entry point: reservation pool, eviction loop, and the
//! registry of live tuple buffers, wired together.

pub mod eviction;
pub mod reserve;

use log::{debug, warn};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::batch_store::BatchStore;
use crate::config::ResolvedConfig;
use crate::error::{BufferManagerError, Result};
use crate::file_store::{FileStore, StorageManager};
use crate::lob_manager::LobManager;
use crate::size_utility::SizeUtility;
use crate::soft_cache::SoftCache;
use crate::state_codec::StateCodec;
use crate::tuple_buffer::TupleBuffer;
use crate::tuple_buffer_registry::TupleBufferRegistry;
use crate::types::{Row, Type};

use eviction::EvictionIndex;
use reserve::{ReserveMode, ReservePool};

/// Fraction of `max_reserve_kb` above which the eviction loop turns the
/// value cache back on, and below which it turns it off (§4.F).
const VALUE_CACHE_ENABLE_FRACTION: f64 = 0.25;
const VALUE_CACHE_DISABLE_FRACTION: f64 = 0.125;
/// Eviction stops once `active_batch_kb` drops to this fraction of the
/// reserve ceiling, leaving headroom so the loop doesn't re-trigger on the
/// very next admission.
const EVICTION_TARGET_FRACTION: f64 = 0.8;

/// The two batch stores backing an ordered-tree index: leaf pages and key
/// pages. The tree structure itself is a contract this crate doesn't
/// implement (§1 scope).
pub struct StreeStores {
    pub leaf: Arc<BatchStore>,
    pub key: Arc<BatchStore>,
}

pub struct BufferManager {
    config: ResolvedConfig,
    storage_manager: Arc<dyn StorageManager>,
    size_utility: SizeUtility,
    soft_cache: SoftCache,
    registry: Arc<TupleBufferRegistry>,
    eviction: Arc<EvictionIndex>,
    reserve: ReservePool,
    lob_manager: Arc<LobManager>,
    value_cache_enabled: AtomicBool,
    next_buffer_id: AtomicU64,
}

impl BufferManager {
    pub fn new(config: ResolvedConfig, storage_manager: Arc<dyn StorageManager>) -> Self {
        let soft_cache_kb = config.soft_cache_kb;
        let reserve = ReservePool::new(config.max_reserve_kb);
        BufferManager {
            config,
            storage_manager,
            size_utility: SizeUtility::new(),
            soft_cache: SoftCache::new(soft_cache_kb),
            registry: Arc::new(TupleBufferRegistry::new()),
            eviction: Arc::new(EvictionIndex::new()),
            reserve,
            lob_manager: Arc::new(LobManager::new()),
            value_cache_enabled: AtomicBool::new(true),
            next_buffer_id: AtomicU64::new(0),
        }
    }

    /// `initialize()`: builds a manager from a not-yet-resolved config and
    /// the host's total memory, resolving `Auto` knobs (§4.F).
    pub fn initialize(
        config: crate::config::BufferManagerConfig,
        storage_manager: Arc<dyn StorageManager>,
        total_system_kb: u64,
    ) -> Self {
        Self::new(config.resolve(total_system_kb), storage_manager)
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn lob_manager(&self) -> &Arc<LobManager> {
        &self.lob_manager
    }

    pub fn is_value_cache_enabled(&self) -> bool {
        self.value_cache_enabled.load(Ordering::Acquire)
    }

    pub fn set_value_cache_enabled(&self, enabled: bool) {
        self.value_cache_enabled.store(enabled, Ordering::Release);
    }

    /// `get_schema_size`: KB for one `processor_batch_size` batch of
    /// `schema`.
    pub fn get_schema_size(&self, schema: &[Type]) -> u64 {
        self.size_utility
            .schema_size_kb(schema, self.config.processor_batch_size, self.is_value_cache_enabled())
    }

    pub fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        self.storage_manager.create_file_store(name)
    }

    /// Allocates a fresh id, a `BatchStore`, and an open tuple buffer.
    pub fn create_tuple_buffer(&self, schema: Vec<Type>, prefers_memory: bool, forward_only: bool) -> Result<Arc<TupleBuffer>> {
        let id = format!("tb-{}", self.next_buffer_id.fetch_add(1, Ordering::Relaxed));
        self.create_tuple_buffer_with_id(id, schema, self.config.processor_batch_size, prefers_memory, forward_only)
    }

    fn create_tuple_buffer_with_id(
        &self,
        id: String,
        schema: Vec<Type>,
        batch_size: usize,
        prefers_memory: bool,
        forward_only: bool,
    ) -> Result<Arc<TupleBuffer>> {
        let store = Arc::new(BatchStore::new(id.clone(), self.storage_manager.clone())?);
        let has_lobs = schema.iter().any(|t| *t == Type::Lob);
        let lob_manager = has_lobs.then(|| self.lob_manager.clone());

        let buffer = Arc::new(TupleBuffer::new(
            id.clone(),
            schema,
            batch_size,
            prefers_memory,
            forward_only,
            store.clone(),
            lob_manager,
        ));

        let registry = self.registry.clone();
        let hook_id = id.clone();
        let hook_store = store;
        buffer.install_cleanup_hook(Box::new(move || {
            registry.remove(&hook_id);
            if let Err(e) = hook_store.remove() {
                warn!("failed to remove backing store for tuple buffer {hook_id}: {e}");
            }
        }));

        self.registry.add(buffer.clone());
        debug!("created tuple buffer {id}");
        Ok(buffer)
    }

    /// Allocates the leaf and key batch stores for an ordered-tree index.
    pub fn create_stree(&self, id_prefix: &str, _key_length: usize) -> Result<StreeStores> {
        let leaf = Arc::new(BatchStore::new(format!("{id_prefix}.leaf"), self.storage_manager.clone())?);
        let key = Arc::new(BatchStore::new(format!("{id_prefix}.key"), self.storage_manager.clone())?);
        Ok(StreeStores { leaf, key })
    }

    /// Appends `rows` to `buffer` as a new batch, charges the real KB
    /// estimate (overwriting the placeholder `TupleBuffer::append` records),
    /// registers it in the eviction index, and runs one eviction pass.
    pub fn append_rows(&self, buffer: &Arc<TupleBuffer>, rows: Vec<Row>) -> Result<()> {
        let managed = buffer.append(rows)?;
        let size_kb = self
            .size_utility
            .estimate_kb(buffer.schema(), managed.size_estimate_kb() as usize, self.is_value_cache_enabled());
        managed.set_size_estimate_kb(size_kb);
        self.eviction.register(buffer.store(), &buffer.schema_arc(), managed, size_kb);
        self.persist_batch_references();
        Ok(())
    }

    /// Reads the batch covering `row`. If the batch is currently on disk or
    /// in the soft cache, `cache=true` repromotes it to active and charges
    /// `active_batch_kb`.
    pub fn get_batch(&self, buffer: &TupleBuffer, row: i64, cache: bool) -> Result<crate::tuple_batch::TupleBatch> {
        let managed = buffer
            .batch_covering(row)
            .ok_or_else(|| BufferManagerError::not_found(format!("no batch covers row {row}")))?;
        self.eviction.touch(managed.store_id(), managed.begin_row());

        let (batch, charged) = managed.get_batch(
            cache,
            buffer.store(),
            &self.soft_cache,
            buffer.schema(),
            buffer.lob_manager().map(|m| m.as_ref()),
            buffer.lob_column_indexes(),
        )?;
        if charged {
            self.eviction
                .register(buffer.store(), &buffer.schema_arc(), managed.clone(), managed.size_estimate_kb());
            self.persist_batch_references();
        }
        Ok(batch)
    }

    pub fn get_tuple_buffer(&self, id: &str) -> Option<Arc<TupleBuffer>> {
        self.registry.get(id)
    }

    pub fn add_tuple_buffer(&self, buffer: Arc<TupleBuffer>) {
        self.registry.add(buffer);
    }

    pub fn distribute_tuple_buffer(&self, id: &str, buffer: Arc<TupleBuffer>) {
        self.registry.distribute(id, buffer);
    }

    /// Removes a tuple buffer: frees its active batches' eviction
    /// accounting, cleans up every managed batch, then runs the buffer's
    /// cleanup hook (registry removal, backing file deletion).
    pub fn remove_tuple_buffer(&self, id: &str) -> bool {
        let Some(buffer) = self.registry.get(id) else {
            return false;
        };
        for managed in buffer.batches_in_order() {
            if managed.is_active() {
                self.eviction
                    .unregister(managed.store_id(), managed.begin_row(), managed.size_estimate_kb());
            }
            managed.cleanup(buffer.store(), &self.soft_cache);
        }
        buffer.remove()
    }

    pub fn reserve_buffers(&self, count_kb: u64, mode: ReserveMode) -> Result<u64> {
        let granted = self.reserve.reserve(count_kb, mode)?;
        self.persist_batch_references();
        Ok(granted)
    }

    pub fn release_buffers(&self, count_kb: u64) {
        self.reserve.release(count_kb);
        self.persist_batch_references();
    }

    /// Serializes every live tuple buffer via `StateCodec`.
    pub fn get_state<W: Write>(&self, out: &mut W) -> Result<()> {
        let buffers = self.registry.all();
        let pairs: Vec<(&TupleBuffer, &SoftCache)> = buffers.iter().map(|b| (b.as_ref(), &self.soft_cache)).collect();
        StateCodec::write_state(out, &pairs)
    }

    pub fn get_state_for<W: Write>(&self, id: &str, out: &mut W) -> Result<()> {
        let buffer = self.registry.get(id).ok_or_else(|| BufferManagerError::not_found(id))?;
        StateCodec::write_buffer(out, &buffer, &self.soft_cache)
    }

    /// Restores every buffer in a snapshot stream and hands the caller the
    /// strong references: the registry only tracks buffers weakly, so a
    /// restored buffer the caller doesn't keep is reclaimed immediately.
    pub fn set_state<R: Read>(&self, input: &mut R) -> Result<Vec<Arc<TupleBuffer>>> {
        let decoded = StateCodec::read_state(input, Some(&self.lob_manager))?;
        decoded.into_iter().map(|buffer| self.install_decoded(buffer)).collect()
    }

    /// Restores one named buffer from a snapshot stream. Refuses (leaves no
    /// partially-built buffer installed) if any batch's LOB references
    /// cannot be resolved against the local `LobManager`.
    pub fn restore_cached_results<R: Read>(&self, id: &str, input: &mut R) -> Result<Arc<TupleBuffer>> {
        let mut decoded = StateCodec::read_buffer(input, Some(&self.lob_manager))?;
        decoded.id = id.to_string();
        self.install_decoded(decoded)
    }

    pub fn set_state_for<R: Read>(&self, id: &str, input: &mut R) -> Result<Arc<TupleBuffer>> {
        self.restore_cached_results(id, input)
    }

    fn install_decoded(&self, decoded: crate::state_codec::DecodedBuffer) -> Result<Arc<TupleBuffer>> {
        let buffer = self.create_tuple_buffer_with_id(decoded.id, decoded.schema, decoded.batch_size, decoded.prefers_memory, false)?;
        for batch in decoded.batches {
            self.append_rows(&buffer, batch.rows().to_vec())?;
        }
        buffer.close();
        Ok(buffer)
    }

    /// §4.F `persist_batch_references`: while `active_batch_kb` exceeds 80%
    /// of the reserve ceiling, evict the coldest batch and persist it
    /// outside the eviction lock. Also toggles `value_cache_enabled` based
    /// on the live-memory fraction of `max_reserve_kb`.
    fn persist_batch_references(&self) {
        let max_reserve_kb = self.config.max_reserve_kb as f64;
        if max_reserve_kb > 0.0 {
            let fraction = self.eviction.active_batch_kb() as f64 / max_reserve_kb;
            if fraction > VALUE_CACHE_ENABLE_FRACTION {
                self.set_value_cache_enabled(true);
            } else if fraction < VALUE_CACHE_DISABLE_FRACTION {
                self.set_value_cache_enabled(false);
            }
        }

        let ceiling = self.reserve.available_kb();
        let target = ((ceiling as f64) * EVICTION_TARGET_FRACTION) as i64;
        while (self.eviction.active_batch_kb() as i64) > target.max(0) {
            let Some(victim) = self.eviction.evict_one() else {
                break;
            };
            let result = victim
                .batch
                .persist(&victim.store, &self.soft_cache, &victim.schema, self.config.use_weak_references);
            match result {
                Ok(_) => debug!("persisted batch {} from store {}", victim.batch.id(), victim.store.id()),
                Err(e) => warn!(
                    "failed to persist batch {} from store {}: {e}",
                    victim.batch.id(),
                    victim.store.id()
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferManagerConfig;
    use crate::file_store::LocalStorageManager;
    use crate::types::Value;

    fn manager(dir: &std::path::Path, max_reserve_kb: u64) -> BufferManager {
        let storage = Arc::new(LocalStorageManager::new(dir).unwrap());
        let config = BufferManagerConfig::new()
            .with_processor_batch_size(8)
            .with_max_reserve_kb(max_reserve_kb)
            .with_soft_cache_kb(max_reserve_kb)
            .resolve(0);
        BufferManager::new(config, storage)
    }

    #[test]
    fn basic_spill_keeps_active_kb_under_the_reserve() {
        let dir = tempfile::tempdir().unwrap();
        let bm = manager(dir.path(), 8);
        let buffer = bm.create_tuple_buffer(vec![Type::Bytes], false, false).unwrap();

        for i in 0..200i64 {
            bm.append_rows(&buffer, vec![vec![Value::Bytes(vec![7u8; 900])]]).unwrap();
            assert!(bm.eviction.active_batch_kb() <= bm.config.max_reserve_kb + 64, "row {i}");
        }
    }

    #[test]
    fn reading_an_evicted_batch_reproduces_its_content() {
        let dir = tempfile::tempdir().unwrap();
        let bm = manager(dir.path(), 4);
        let buffer = bm.create_tuple_buffer(vec![Type::I64], false, false).unwrap();

        for i in 0..50i64 {
            bm.append_rows(&buffer, vec![vec![Value::I64(i)]]).unwrap();
        }
        let batch = bm.get_batch(&buffer, 3, true).unwrap();
        assert_eq!(batch.rows()[0][0], Value::I64(3));
    }

    #[test]
    fn remove_tuple_buffer_frees_accounting_and_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let bm = manager(dir.path(), 64);
        let buffer = bm.create_tuple_buffer(vec![Type::I64], false, false).unwrap();
        bm.append_rows(&buffer, vec![vec![Value::I64(1)]]).unwrap();

        assert!(bm.remove_tuple_buffer(buffer.id()));
        assert!(bm.get_tuple_buffer(buffer.id()).is_none());
        assert_eq!(bm.eviction.active_batch_kb(), 0);
    }

    #[test]
    fn state_round_trips_through_a_fresh_manager() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let bm_a = manager(dir_a.path(), 256);
        let buffer = bm_a.create_tuple_buffer(vec![Type::I64, Type::Str], true, false).unwrap();
        bm_a.append_rows(&buffer, vec![vec![Value::I64(1), Value::Str("x".into())]]).unwrap();
        bm_a.append_rows(&buffer, vec![vec![Value::I64(2), Value::Str("y".into())]]).unwrap();
        buffer.close();

        let mut snapshot = Vec::new();
        bm_a.get_state(&mut snapshot).unwrap();

        let bm_b = manager(dir_b.path(), 256);
        let restored_buffers = bm_b.set_state(&mut &snapshot[..]).unwrap();

        let restored = bm_b.get_tuple_buffer(buffer.id()).unwrap();
        assert_eq!(restored.row_count(), 2);
        let batch = bm_b.get_batch(&restored, 0, true).unwrap();
        assert_eq!(batch.rows()[1][1], Value::Str("y".into()));
        drop(restored_buffers);
    }

    #[test]
    fn dropping_the_last_strong_reference_reclaims_the_buffer_without_explicit_removal() {
        let dir = tempfile::tempdir().unwrap();
        let bm = manager(dir.path(), 64);
        let buffer = bm.create_tuple_buffer(vec![Type::I64], false, false).unwrap();
        let id = buffer.id().to_string();
        bm.append_rows(&buffer, vec![vec![Value::I64(1)]]).unwrap();
        assert!(bm.get_tuple_buffer(&id).is_some());

        drop(buffer);

        assert!(bm.get_tuple_buffer(&id).is_none());
    }

    #[test]
    fn restore_refuses_a_buffer_with_unresolvable_lobs() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let bm_a = manager(dir_a.path(), 256);
        let buffer = bm_a.create_tuple_buffer(vec![Type::Lob], true, false).unwrap();
        bm_a.append_rows(&buffer, vec![vec![Value::Lob(7)]]).unwrap();

        let mut snapshot = Vec::new();
        bm_a.get_state_for(buffer.id(), &mut snapshot).unwrap();

        let bm_b = manager(dir_b.path(), 256);
        let err = bm_b.restore_cached_results("restored", &mut &snapshot[..]).unwrap_err();
        assert!(matches!(err, BufferManagerError::LobMissing(_)));
        assert!(bm_b.get_tuple_buffer("restored").is_none());
    }
}
