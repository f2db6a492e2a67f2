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

//! Error type shared by every component of the buffer manager.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T, E = BufferManagerError> = std::result::Result<T, E>;

/// Errors raised by the tuple-batch buffer manager.
///
/// The eviction loop swallows and logs [`BufferManagerError::Io`] and
/// [`BufferManagerError::Format`] raised from `persist` (the batch stays
/// resident and the next eviction pass retries); every other path
/// propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum BufferManagerError {
    /// Storage error during read, write or compaction.
    #[error("buffer manager I/O error: {0}")]
    Io(#[from] io::Error),

    /// Deserialization failure: unexpected tag or truncated stream.
    #[error("malformed batch stream: {0}")]
    Format(String),

    /// Physical map lookup for a batch that was concurrently removed.
    ///
    /// Signals a logic bug in the caller holding a dangling reference;
    /// this should never occur under correct use.
    #[error("batch {0} not found in physical map")]
    NotFound(String),

    /// A waiter in `reserve_buffers(Wait)` was interrupted or timed out.
    #[error("reservation wait interrupted: {0}")]
    Interrupted(String),

    /// Operation attempted on a removed tuple buffer.
    #[error("tuple buffer {0} is closed")]
    Closed(String),

    /// A LOB reference could not be resolved against the local `LobManager`.
    #[error("missing large object reference: {0}")]
    LobMissing(String),
}

impl BufferManagerError {
    pub fn format<S: Into<String>>(msg: S) -> Self {
        BufferManagerError::Format(msg.into())
    }

    pub fn not_found<S: Into<String>>(id: S) -> Self {
        BufferManagerError::NotFound(id.into())
    }

    pub fn closed<S: Into<String>>(id: S) -> Self {
        BufferManagerError::Closed(id.into())
    }

    pub fn lob_missing<S: Into<String>>(id: S) -> Self {
        BufferManagerError::LobMissing(id.into())
    }
}
