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

//! Estimates the in-memory footprint of a batch, in KB.
//!
//! The estimate need not be exact; it must be monotonically consistent in
//! the number of rows and columns so eviction decisions stay stable across
//! repeated calls on the same schema.

use crate::types::Type;

/// Per-row header overhead (row number bookkeeping, object framing).
const ROW_HEADER_BYTES: usize = 36;
/// Per-column overhead added on top of the declared width (null bitmap bit,
/// value-object header when the value cache is disabled).
const COLUMN_OVERHEAD_BYTES: usize = 8;
/// Extra per-column overhead incurred only when duplicate-value caching is
/// off and every cell carries its own boxed value.
const UNCACHED_VALUE_OVERHEAD_BYTES: usize = 8;

/// Stateless estimator: given a row's column types, returns a KB estimate
/// for a batch of `row_count` such rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeUtility;

impl SizeUtility {
    pub fn new() -> Self {
        SizeUtility
    }

    /// Estimates the footprint, in KB, of a batch of `row_count` rows with
    /// the given column types. `value_cache_enabled` lets string/bytes
    /// columns assume shared storage of duplicate values, shrinking the
    /// per-column overhead; this is injected by the caller rather than read
    /// from global state (see the design note on `value_cache_enabled`).
    pub fn estimate_kb(&self, types: &[Type], row_count: usize, value_cache_enabled: bool) -> u64 {
        if row_count == 0 || types.is_empty() {
            return 1;
        }
        let mut bytes_per_row = ROW_HEADER_BYTES;
        for ty in types {
            bytes_per_row += ty.declared_width() + COLUMN_OVERHEAD_BYTES;
            if !value_cache_enabled {
                bytes_per_row += UNCACHED_VALUE_OVERHEAD_BYTES;
            }
        }
        let total_bytes = bytes_per_row.saturating_mul(row_count);
        let kb = (total_bytes as u64).div_ceil(1024);
        kb.max(1)
    }

    /// `BufferManager::get_schema_size`: KB for one `processor_batch_size`
    /// batch of this schema.
    pub fn schema_size_kb(&self, types: &[Type], processor_batch_size: usize, value_cache_enabled: bool) -> u64 {
        self.estimate_kb(types, processor_batch_size, value_cache_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_is_monotonic_in_row_count() {
        let su = SizeUtility::new();
        let types = vec![Type::I64, Type::Str];
        let small = su.estimate_kb(&types, 10, true);
        let large = su.estimate_kb(&types, 1000, true);
        assert!(large > small);
    }

    #[test]
    fn estimate_is_monotonic_in_column_count() {
        let su = SizeUtility::new();
        let narrow = su.estimate_kb(&[Type::I64], 256, true);
        let wide = su.estimate_kb(&[Type::I64, Type::Str, Type::Bytes], 256, true);
        assert!(wide > narrow);
    }

    #[test]
    fn never_returns_zero() {
        let su = SizeUtility::new();
        assert_eq!(su.estimate_kb(&[], 0, true), 1);
        assert!(su.estimate_kb(&[Type::Bool], 1, true) >= 1);
    }

    #[test]
    fn disabling_value_cache_increases_estimate() {
        let su = SizeUtility::new();
        let types = vec![Type::Str, Type::Str];
        let cached = su.estimate_kb(&types, 256, true);
        let uncached = su.estimate_kb(&types, 256, false);
        assert!(uncached > cached);
    }
}
