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

//! Column type tags and tuple values.
//!
//! Tuple batches are row-major: each row is a fixed-width ordered sequence
//! of [`Value`]s, one per column, whose [`Type`] is declared by the owning
//! tuple buffer's schema.

use crate::error::{BufferManagerError, Result};

/// A large-object reference id carried inline in a tuple in place of payload
/// bytes. Resolved against a [`crate::lob_manager::LobManager`] on read.
pub type LobRef = u64;

/// Column type tag. One byte on the wire (see [`crate::state_codec`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    I64,
    F32,
    F64,
    Bool,
    Str,
    Bytes,
    Lob,
}

impl Type {
    /// Declared-width hint in bytes, used by [`crate::size_utility`].
    /// Variable-width types return a representative average rather than a
    /// true minimum or maximum.
    pub fn declared_width(&self) -> usize {
        match self {
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 => 8,
            Type::Bool => 1,
            Type::Str => 32,
            Type::Bytes => 64,
            Type::Lob => 8,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Type::I32 => 0,
            Type::I64 => 1,
            Type::F32 => 2,
            Type::F64 => 3,
            Type::Bool => 4,
            Type::Str => 5,
            Type::Bytes => 6,
            Type::Lob => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Type::I32,
            1 => Type::I64,
            2 => Type::F32,
            3 => Type::F64,
            4 => Type::Bool,
            5 => Type::Str,
            6 => Type::Bytes,
            7 => Type::Lob,
            other => {
                return Err(BufferManagerError::format(format!(
                    "unknown column type tag {other}"
                )))
            }
        })
    }
}

/// A single tuple cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Lob(LobRef),
}

impl Value {
    pub fn type_of(&self) -> Option<Type> {
        match self {
            Value::Null => None,
            Value::I32(_) => Some(Type::I32),
            Value::I64(_) => Some(Type::I64),
            Value::F32(_) => Some(Type::F32),
            Value::F64(_) => Some(Type::F64),
            Value::Bool(_) => Some(Type::Bool),
            Value::Str(_) => Some(Type::Str),
            Value::Bytes(_) => Some(Type::Bytes),
            Value::Lob(_) => Some(Type::Lob),
        }
    }

    pub fn is_lob(&self) -> bool {
        matches!(self, Value::Lob(_))
    }
}

/// One fixed-width row: one [`Value`] per column, in schema order.
pub type Row = Vec<Value>;
