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

//! A tuple-batch buffer manager for a federated query engine.
//!
//! Query operators append row batches to a [`tuple_buffer::TupleBuffer`]
//! obtained from [`buffer_manager::BufferManager`]; the manager tracks how
//! much memory those batches occupy against a configurable reserve budget,
//! spilling the coldest batches to disk through a [`batch_store::BatchStore`]
//! once the budget is exceeded, and resurrects them on demand, optionally
//! by way of a second-chance [`soft_cache::SoftCache`].

pub mod batch_store;
pub mod buffer_manager;
pub mod config;
pub mod error;
pub mod file_store;
pub mod lob_manager;
pub mod managed_batch;
pub mod size_utility;
pub mod soft_cache;
pub mod state_codec;
pub mod tuple_batch;
pub mod tuple_buffer;
pub mod tuple_buffer_registry;
pub mod types;

pub use buffer_manager::reserve::ReserveMode;
pub use buffer_manager::BufferManager;
pub use config::BufferManagerConfig;
pub use error::{BufferManagerError, Result};
pub use types::{Row, Type, Value};
