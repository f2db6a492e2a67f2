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

//! Configuration knobs for the buffer manager, builder-style in the manner
//! of `SortPreservingMergeExec::with_fetch`.

const BYTES_PER_KB: u64 = 1024;
const ONE_GIB_KB: u64 = 1024 * 1024;
const HEADROOM_KB: u64 = 300 * 1024;

/// Either an explicit value or "auto", resolved against the host's total
/// memory at `BufferManagerConfig::resolve` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    Auto,
    Fixed(T),
}

#[derive(Debug, Clone)]
pub struct BufferManagerConfig {
    pub connector_batch_size: usize,
    pub processor_batch_size: usize,
    pub max_reserve_kb: Setting<u64>,
    pub max_processing_kb: Setting<u64>,
    pub max_active_plans: u32,
    pub use_weak_references: bool,
    pub soft_cache_kb: Setting<u64>,
    pub compaction_threshold_bytes: u64,
    pub compaction_waste_ratio: f64,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        BufferManagerConfig {
            connector_batch_size: 256,
            processor_batch_size: 256,
            max_reserve_kb: Setting::Auto,
            max_processing_kb: Setting::Auto,
            max_active_plans: 20,
            use_weak_references: true,
            soft_cache_kb: Setting::Auto,
            compaction_threshold_bytes: crate::batch_store::COMPACTION_THRESHOLD_BYTES,
            compaction_waste_ratio: crate::batch_store::COMPACTION_WASTE_RATIO,
        }
    }
}

impl BufferManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector_batch_size(mut self, size: usize) -> Self {
        self.connector_batch_size = size;
        self
    }

    pub fn with_processor_batch_size(mut self, size: usize) -> Self {
        self.processor_batch_size = size;
        self
    }

    pub fn with_max_reserve_kb(mut self, kb: u64) -> Self {
        self.max_reserve_kb = Setting::Fixed(kb);
        self
    }

    pub fn with_max_processing_kb(mut self, kb: u64) -> Self {
        self.max_processing_kb = Setting::Fixed(kb);
        self
    }

    pub fn with_max_active_plans(mut self, n: u32) -> Self {
        self.max_active_plans = n;
        self
    }

    pub fn with_use_weak_references(mut self, weak: bool) -> Self {
        self.use_weak_references = weak;
        self
    }

    pub fn with_soft_cache_kb(mut self, kb: u64) -> Self {
        self.soft_cache_kb = Setting::Fixed(kb);
        self
    }

    /// §4.F `initialize()`: resolves `Auto` knobs against `total_system_kb`
    /// (the host's total RAM, in KB).
    pub fn resolve(&self, total_system_kb: u64) -> ResolvedConfig {
        let max_reserve_kb = match self.max_reserve_kb {
            Setting::Fixed(kb) => kb,
            Setting::Auto => auto_max_reserve_kb(total_system_kb),
        };
        let max_processing_kb = match self.max_processing_kb {
            Setting::Fixed(kb) => kb,
            Setting::Auto => auto_max_processing_kb(
                total_system_kb,
                self.processor_batch_size,
                self.max_active_plans,
            ),
        };
        let soft_cache_kb = match self.soft_cache_kb {
            Setting::Fixed(kb) => kb,
            Setting::Auto => max_reserve_kb / 10,
        };
        ResolvedConfig {
            connector_batch_size: self.connector_batch_size,
            processor_batch_size: self.processor_batch_size,
            max_reserve_kb,
            max_processing_kb,
            max_active_plans: self.max_active_plans,
            use_weak_references: self.use_weak_references,
            soft_cache_kb,
            compaction_threshold_bytes: self.compaction_threshold_bytes,
            compaction_waste_ratio: self.compaction_waste_ratio,
        }
    }
}

/// 75% of RAM above 1 GiB plus 50% of the first GiB, minus a 300 MiB
/// headroom, floored at 1 KB.
fn auto_max_reserve_kb(total_system_kb: u64) -> u64 {
    let first_gib = total_system_kb.min(ONE_GIB_KB);
    let above_gib = total_system_kb.saturating_sub(ONE_GIB_KB);
    let raw = first_gib / 2 + (above_gib * 3) / 4;
    raw.saturating_sub(HEADROOM_KB).max(BYTES_PER_KB)
}

/// `max(8 * processor_batch_size, 10% of RAM / max_active_plans)`, where
/// the first term is itself expressed in KB (one KB per row as a floor).
fn auto_max_processing_kb(total_system_kb: u64, processor_batch_size: usize, max_active_plans: u32) -> u64 {
    let per_plan = total_system_kb / 10 / max_active_plans.max(1) as u64;
    let floor = 8 * processor_batch_size as u64;
    per_plan.max(floor)
}

/// A fully-resolved configuration, with every `Setting` knob pinned.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub connector_batch_size: usize,
    pub processor_batch_size: usize,
    pub max_reserve_kb: u64,
    pub max_processing_kb: u64,
    pub max_active_plans: u32,
    pub use_weak_references: bool,
    pub soft_cache_kb: u64,
    pub compaction_threshold_bytes: u64,
    pub compaction_waste_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reserve_scales_with_ram() {
        let small = auto_max_reserve_kb(2 * ONE_GIB_KB);
        let large = auto_max_reserve_kb(16 * ONE_GIB_KB);
        assert!(large > small);
    }

    #[test]
    fn resolve_respects_fixed_overrides() {
        let cfg = BufferManagerConfig::new().with_max_reserve_kb(1024);
        let resolved = cfg.resolve(16 * ONE_GIB_KB);
        assert_eq!(resolved.max_reserve_kb, 1024);
        assert_eq!(resolved.soft_cache_kb, 102);
    }

    #[test]
    fn processing_ceiling_has_a_floor() {
        let kb = auto_max_processing_kb(0, 256, 20);
        assert_eq!(kb, 8 * 256);
    }
}
