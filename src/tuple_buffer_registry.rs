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

//! A non-owning index of tuple buffers by id, used for distributed lookup.
//!
//! The registry never extends a buffer's lifetime: entries hold a `Weak`,
//! the idiomatic stand-in for the original's weak-reference-plus-queue
//! scheme (§9). Callers hold the strong `Arc`; once the last one is dropped
//! the entry's `upgrade()` starts returning `None`, and is pruned on the
//! next registry access rather than lingering until an explicit `remove`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::tuple_buffer::TupleBuffer;

#[derive(Default)]
pub struct TupleBufferRegistry {
    entries: RwLock<HashMap<String, Weak<TupleBuffer>>>,
}

impl TupleBufferRegistry {
    pub fn new() -> Self {
        TupleBufferRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drains dead entries before any read or write, per §4.F/§4.G.
    fn prune(&self) {
        self.entries.write().retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn add(&self, buffer: Arc<TupleBuffer>) {
        self.prune();
        self.entries
            .write()
            .insert(buffer.id().to_string(), Arc::downgrade(&buffer));
    }

    pub fn get(&self, id: &str) -> Option<Arc<TupleBuffer>> {
        self.prune();
        self.entries.read().get(id).and_then(Weak::upgrade)
    }

    /// Installs `buffer` under `id`, overwriting any existing entry. Used
    /// when a buffer is redistributed from another node.
    pub fn distribute(&self, id: &str, buffer: Arc<TupleBuffer>) {
        self.prune();
        self.entries
            .write()
            .insert(id.to_string(), Arc::downgrade(&buffer));
    }

    pub fn remove(&self, id: &str) -> Option<Arc<TupleBuffer>> {
        self.prune();
        self.entries.write().remove(id).and_then(|weak| weak.upgrade())
    }

    pub fn len(&self) -> usize {
        self.prune();
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.prune();
        self.entries.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<TupleBuffer>> {
        self.prune();
        self.entries.read().values().filter_map(Weak::upgrade).collect()
    }
}
