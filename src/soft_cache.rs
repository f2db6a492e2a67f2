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

//! A bounded second-chance cache standing in for the host runtime's
//! GC-opportunistic soft/weak references (see the design note in
//! `SPEC_FULL.md` §9).
//!
//! Evicted batches are inserted here rather than simply dropped so that a
//! subsequent read can skip disk I/O while memory is plentiful; under its
//! own size pressure the cache may drop entries at any time, same as the
//! original soft-reference behavior.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tuple_batch::TupleBatch;

/// Key identifying a cached batch: the owning store's id plus the batch id
/// within that store.
pub type SoftCacheKey = (String, u64);

struct Entry {
    batch: TupleBatch,
    size_kb: u64,
}

/// LRU-ordered, KB-budgeted cache of evicted batches.
pub struct SoftCache {
    budget_kb: u64,
    used_kb: Mutex<u64>,
    entries: Mutex<IndexMap<SoftCacheKey, Entry>>,
    reference_hit: AtomicU64,
    reference_miss: AtomicU64,
}

impl SoftCache {
    pub fn new(budget_kb: u64) -> Self {
        SoftCache {
            budget_kb,
            used_kb: Mutex::new(0),
            entries: Mutex::new(IndexMap::new()),
            reference_hit: AtomicU64::new(0),
            reference_miss: AtomicU64::new(0),
        }
    }

    /// Inserts `batch` at the MRU end, evicting from the LRU end until back
    /// under `budget_kb` (including the case where `size_kb` alone exceeds
    /// the budget: the new entry is then evicted immediately on the next
    /// insert's pass, but is briefly visible to an in-flight `take`).
    pub fn insert(&self, key: SoftCacheKey, batch: TupleBatch, size_kb: u64) {
        if self.budget_kb == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        let mut used = self.used_kb.lock();

        if let Some(old) = entries.shift_remove(&key) {
            *used -= old.size_kb;
        }
        entries.insert(key, Entry { batch, size_kb });
        *used += size_kb;

        while *used > self.budget_kb {
            match entries.shift_remove_index(0) {
                Some((_, evicted)) => *used -= evicted.size_kb,
                None => break,
            }
        }
    }

    /// Removes and returns the cached batch for `key`, if present. A single
    /// `take` consumes the entry; callers that want it to stay resident
    /// reinsert via promotion to the store's active set.
    pub fn take(&self, key: &SoftCacheKey) -> Option<TupleBatch> {
        let mut entries = self.entries.lock();
        match entries.shift_remove(key) {
            Some(entry) => {
                *self.used_kb.lock() -= entry.size_kb;
                self.reference_hit.fetch_add(1, Ordering::Relaxed);
                Some(entry.batch)
            }
            None => {
                self.reference_miss.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Clones the cached batch for `key` without consuming the entry, moving
    /// it to the MRU end as its second chance. Used by a non-caching read
    /// that wants the content but shouldn't defeat the cache for the next
    /// reader.
    pub fn peek(&self, key: &SoftCacheKey) -> Option<TupleBatch> {
        let mut entries = self.entries.lock();
        match entries.shift_remove(key) {
            Some(entry) => {
                let batch = entry.batch.clone();
                let size_kb = entry.size_kb;
                entries.insert(key.clone(), Entry { batch: entry.batch, size_kb });
                self.reference_hit.fetch_add(1, Ordering::Relaxed);
                Some(batch)
            }
            None => {
                self.reference_miss.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn remove(&self, key: &SoftCacheKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.shift_remove(key) {
            *self.used_kb.lock() -= entry.size_kb;
        }
    }

    pub fn used_kb(&self) -> u64 {
        *self.used_kb.lock()
    }

    pub fn reference_hits(&self) -> u64 {
        self.reference_hit.load(Ordering::Relaxed)
    }

    pub fn reference_misses(&self) -> u64 {
        self.reference_miss.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn contains(&self, key: &SoftCacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn batch(begin: i64) -> TupleBatch {
        TupleBatch::new(begin, vec![], vec![Type::I64])
    }

    #[test]
    fn evicts_lru_when_over_budget() {
        let cache = SoftCache::new(10);
        cache.insert(("s".into(), 1), batch(0), 6);
        cache.insert(("s".into(), 2), batch(1), 6);
        assert!(!cache.contains(&("s".into(), 1)));
        assert!(cache.contains(&("s".into(), 2)));
        assert!(cache.used_kb() <= 10);
    }

    #[test]
    fn take_is_single_use() {
        let cache = SoftCache::new(100);
        cache.insert(("s".into(), 1), batch(0), 5);
        assert!(cache.take(&("s".into(), 1)).is_some());
        assert!(cache.take(&("s".into(), 1)).is_none());
        assert_eq!(cache.reference_hits(), 1);
        assert_eq!(cache.reference_misses(), 1);
    }

    #[test]
    fn peek_leaves_the_entry_in_place_for_a_later_read() {
        let cache = SoftCache::new(100);
        cache.insert(("s".into(), 1), batch(0), 5);
        assert!(cache.peek(&("s".into(), 1)).is_some());
        assert!(cache.peek(&("s".into(), 1)).is_some());
        assert!(cache.contains(&("s".into(), 1)));
        assert_eq!(cache.reference_hits(), 2);
    }

    #[test]
    fn zero_budget_never_caches() {
        let cache = SoftCache::new(0);
        cache.insert(("s".into(), 1), batch(0), 1);
        assert!(cache.take(&("s".into(), 1)).is_none());
    }
}
