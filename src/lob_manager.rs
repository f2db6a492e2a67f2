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

//! Tracks large-object references embedded in tuples and rewrites them on
//! read.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{LobRef, Row, Value};

/// A backing byte stream for one large object. Kept boxed behind a mutex so
/// a single `LobManager` can be shared across reader threads.
pub trait LobStream: Send {
    fn read_all(&mut self) -> std::io::Result<Vec<u8>>;
}

impl<R: Read + Send> LobStream for R {
    fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Maps LOB reference ids to their backing streams. Shared by every batch
/// belonging to tuple buffers whose schema has `has_lobs = true`.
#[derive(Default)]
pub struct LobManager {
    streams: Mutex<HashMap<LobRef, Arc<Mutex<Box<dyn LobStream>>>>>,
}

impl LobManager {
    pub fn new() -> Self {
        LobManager {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a backing stream for `id`, replacing any prior registration.
    pub fn register(&self, id: LobRef, stream: Box<dyn LobStream>) {
        self.streams.lock().insert(id, Arc::new(Mutex::new(stream)));
    }

    pub fn contains(&self, id: LobRef) -> bool {
        self.streams.lock().contains_key(&id)
    }

    /// Walks `lob_column_indexes` in `row`, registering any LOB reference
    /// not already known. Streams for newly-seen ids are expected to have
    /// been registered by the caller beforehand (scan only records which
    /// ids are now live; it does not fabricate storage for them).
    pub fn scan(&self, row: &Row, lob_column_indexes: &[usize]) -> Vec<LobRef> {
        let mut seen = Vec::new();
        let known = self.streams.lock();
        for &idx in lob_column_indexes {
            if let Some(Value::Lob(id)) = row.get(idx) {
                if !known.contains_key(id) {
                    seen.push(*id);
                }
            }
        }
        seen
    }

    /// After deserialization, verifies every LOB reference at
    /// `lob_column_indexes` resolves to a registered stream. Returns the
    /// set of missing ids (empty if all resolve).
    pub fn rewrite(&self, row: &Row, lob_column_indexes: &[usize]) -> Result<Vec<LobRef>> {
        let known = self.streams.lock();
        let mut missing = Vec::new();
        for &idx in lob_column_indexes {
            if let Some(Value::Lob(id)) = row.get(idx) {
                if !known.contains_key(id) {
                    missing.push(*id);
                }
            }
        }
        Ok(missing)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
