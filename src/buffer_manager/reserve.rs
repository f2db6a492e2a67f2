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

//! The admission lock (§5 tier 1): a signed KB budget, `reserve_batch_kb`,
//! consumed by operator scratch reservations and doubling as the ceiling
//! the eviction loop trims `active_batch_kb` against.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{BufferManagerError, Result};

/// Initial backoff spin count for `Wait` reservations. Halved each time the
/// condvar wakes without satisfying the request, down to a floor of 1 spin
/// (so the wait keeps polling at the tightest interval rather than settling
/// into a fixed cadence) — ported as-is, see the design note in
/// `SPEC_FULL.md` §9.
const INITIAL_WAIT_COUNT: u32 = 16;
const BASE_BACKOFF: Duration = Duration::from_millis(5);
/// Upper bound on how many times a `Wait` reservation will spin before
/// surfacing `Interrupted`; guards against waiting forever on a pool that
/// will never be released into.
const MAX_WAIT_SPINS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveMode {
    /// Block until the full amount is available.
    Wait,
    /// Grant the full amount unconditionally, driving the pool negative if
    /// necessary.
    Force,
    /// Grant `min(count, max(reserve_batch_kb, 0))` and return immediately.
    NoWait,
}

pub struct ReservePool {
    max_reserve_kb: i64,
    reserve_batch_kb: Mutex<i64>,
    freed: Condvar,
}

impl ReservePool {
    pub fn new(max_reserve_kb: u64) -> Self {
        let max_reserve_kb = max_reserve_kb as i64;
        ReservePool {
            max_reserve_kb,
            reserve_batch_kb: Mutex::new(max_reserve_kb),
            freed: Condvar::new(),
        }
    }

    pub fn max_reserve_kb(&self) -> u64 {
        self.max_reserve_kb as u64
    }

    pub fn available_kb(&self) -> i64 {
        *self.reserve_batch_kb.lock()
    }

    /// Reserves `count_kb` against the pool under `mode`. Returns the
    /// amount actually granted (always `count_kb` for `Wait`/`Force`, up to
    /// `count_kb` for `NoWait`).
    pub fn reserve(&self, count_kb: u64, mode: ReserveMode) -> Result<u64> {
        let count_kb = count_kb as i64;
        let mut guard = self.reserve_batch_kb.lock();
        let granted = match mode {
            ReserveMode::Force => {
                *guard -= count_kb;
                count_kb
            }
            ReserveMode::NoWait => {
                let grant = count_kb.min((*guard).max(0));
                *guard -= grant;
                grant
            }
            ReserveMode::Wait => {
                let mut wait_count = INITIAL_WAIT_COUNT;
                let mut spins = 0u32;
                while *guard < count_kb {
                    if spins >= MAX_WAIT_SPINS {
                        return Err(BufferManagerError::Interrupted(format!(
                            "reserve_buffers({count_kb}) timed out after {spins} spins"
                        )));
                    }
                    let timeout = BASE_BACKOFF * wait_count.max(1);
                    self.freed.wait_for(&mut guard, timeout);
                    wait_count = (wait_count / 2).max(1);
                    spins += 1;
                }
                *guard -= count_kb;
                count_kb
            }
        };
        Ok(granted as u64)
    }

    pub fn release(&self, count_kb: u64) {
        let mut guard = self.reserve_batch_kb.lock();
        *guard += count_kb as i64;
        drop(guard);
        self.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn nowait_grants_a_partial_amount_when_short() {
        let pool = ReservePool::new(10);
        let granted = pool.reserve(100, ReserveMode::NoWait).unwrap();
        assert_eq!(granted, 10);
        assert_eq!(pool.available_kb(), 0);
    }

    #[test]
    fn force_drives_the_pool_negative() {
        let pool = ReservePool::new(10);
        let granted = pool.reserve(50, ReserveMode::Force).unwrap();
        assert_eq!(granted, 50);
        assert_eq!(pool.available_kb(), -40);
    }

    #[test]
    fn wait_unblocks_on_release() {
        let pool = Arc::new(ReservePool::new(10));
        pool.reserve(10, ReserveMode::Force).unwrap();
        assert_eq!(pool.available_kb(), 0);

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.reserve(5, ReserveMode::Wait).unwrap());

        thread::sleep(Duration::from_millis(20));
        pool.release(5);
        assert_eq!(waiter.join().unwrap(), 5);
    }

    #[test]
    fn release_after_force_overdraw_restores_capacity() {
        let pool = ReservePool::new(10);
        pool.reserve(30, ReserveMode::Force).unwrap();
        pool.release(30);
        assert_eq!(pool.available_kb(), 10);
    }
}
