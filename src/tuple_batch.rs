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

//! Defines [`TupleBatch`], the unit of buffering and spilling.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{BufferManagerError, Result};
use crate::types::{Row, Type, Value};

/// A contiguous block of up to `processor_batch_size` rows.
///
/// Immutable once constructed. `begin_row` plus `len()` describe this
/// batch's slice of its owning tuple buffer's row space; ranges within one
/// tuple buffer are non-overlapping and contiguous.
#[derive(Debug, Clone)]
pub struct TupleBatch {
    begin_row: i64,
    rows: Vec<Row>,
    /// Column types, stripped once known by context (e.g. after the first
    /// read, when the owning `TupleBuffer`'s schema already pins them).
    types: Option<Vec<Type>>,
    serialized_once: bool,
}

impl TupleBatch {
    pub fn new(begin_row: i64, rows: Vec<Row>, types: Vec<Type>) -> Self {
        TupleBatch {
            begin_row,
            rows,
            types: Some(types),
            serialized_once: false,
        }
    }

    pub fn begin_row(&self) -> i64 {
        self.begin_row
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn end_row(&self) -> i64 {
        self.begin_row + self.rows.len() as i64
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn types(&self) -> Option<&[Type]> {
        self.types.as_deref()
    }

    /// Drops the on-wire type descriptors once the caller's schema already
    /// pins them, per the data model's "may be stripped once known by
    /// context" note.
    pub fn strip_types(&mut self) {
        self.types = None;
    }

    pub fn set_begin_row(&mut self, begin_row: i64) {
        self.begin_row = begin_row;
    }

    pub fn has_been_serialized(&self) -> bool {
        self.serialized_once
    }

    /// True if any row carries a LOB-typed value.
    pub fn has_lobs(&self) -> bool {
        self.rows
            .iter()
            .any(|row| row.iter().any(Value::is_lob))
    }

    /// Writes this batch's row payload: `begin_row: i64, len: u32`, then
    /// each row as a tagged sequence of values. `types` must match the
    /// column schema in order; used both to size fixed-width numerics and
    /// to validate on decode.
    pub fn encode<W: Write>(&mut self, types: &[Type], out: &mut W) -> Result<()> {
        out.write_i64::<LittleEndian>(self.begin_row)?;
        out.write_u32::<LittleEndian>(self.rows.len() as u32)?;
        for row in &self.rows {
            for (col, value) in row.iter().enumerate() {
                let declared = types.get(col).copied();
                encode_value(out, value, declared)?;
            }
        }
        self.serialized_once = true;
        Ok(())
    }

    pub fn decode<R: Read>(input: &mut R, types: &[Type]) -> Result<Self> {
        let begin_row = input.read_i64::<LittleEndian>()?;
        let n_rows = input.read_u32::<LittleEndian>()? as usize;
        let mut rows = Vec::with_capacity(n_rows);
        for _ in 0..n_rows {
            let mut row = Vec::with_capacity(types.len());
            for declared in types {
                row.push(decode_value(input, *declared)?);
            }
            rows.push(row);
        }
        Ok(TupleBatch {
            begin_row,
            rows,
            types: Some(types.to_vec()),
            serialized_once: true,
        })
    }

    /// Estimated on-wire length in bytes for `types`, used to size the
    /// buffered writer and to cross-check the physical map after a write.
    pub fn encoded_len(&self, types: &[Type]) -> usize {
        let mut total = 8 + 4; // begin_row + row count
        for row in &self.rows {
            for (col, value) in row.iter().enumerate() {
                let declared = types.get(col).copied();
                total += encoded_value_len(value, declared);
            }
        }
        total
    }
}

const NULL_TAG: u8 = 0xFF;

fn encode_value<W: Write>(out: &mut W, value: &Value, declared: Option<Type>) -> Result<()> {
    if matches!(value, Value::Null) {
        out.write_u8(NULL_TAG)?;
        return Ok(());
    }
    let tag = value.type_of().unwrap_or_else(|| declared.unwrap_or(Type::I64));
    out.write_u8(tag.tag())?;
    match value {
        Value::Null => unreachable!(),
        Value::I32(v) => out.write_i32::<LittleEndian>(*v)?,
        Value::I64(v) => out.write_i64::<LittleEndian>(*v)?,
        Value::F32(v) => out.write_f32::<LittleEndian>(*v)?,
        Value::F64(v) => out.write_f64::<LittleEndian>(*v)?,
        Value::Bool(v) => out.write_u8(*v as u8)?,
        Value::Str(s) => {
            out.write_u32::<LittleEndian>(s.len() as u32)?;
            out.write_all(s.as_bytes())?;
        }
        Value::Bytes(b) => {
            out.write_u32::<LittleEndian>(b.len() as u32)?;
            out.write_all(b)?;
        }
        Value::Lob(id) => out.write_u64::<LittleEndian>(*id)?,
    }
    Ok(())
}

fn decode_value<R: Read>(input: &mut R, _declared: Type) -> Result<Value> {
    let tag = input.read_u8()?;
    if tag == NULL_TAG {
        return Ok(Value::Null);
    }
    let ty = Type::from_tag(tag)?;
    Ok(match ty {
        Type::I32 => Value::I32(input.read_i32::<LittleEndian>()?),
        Type::I64 => Value::I64(input.read_i64::<LittleEndian>()?),
        Type::F32 => Value::F32(input.read_f32::<LittleEndian>()?),
        Type::F64 => Value::F64(input.read_f64::<LittleEndian>()?),
        Type::Bool => Value::Bool(input.read_u8()? != 0),
        Type::Str => {
            let len = input.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            input.read_exact(&mut buf).map_err(io_to_format)?;
            Value::Str(String::from_utf8(buf).map_err(|e| BufferManagerError::format(e.to_string()))?)
        }
        Type::Bytes => {
            let len = input.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            input.read_exact(&mut buf).map_err(io_to_format)?;
            Value::Bytes(buf)
        }
        Type::Lob => Value::Lob(input.read_u64::<LittleEndian>()?),
    })
}

fn io_to_format(e: io::Error) -> BufferManagerError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        BufferManagerError::format("truncated batch stream")
    } else {
        BufferManagerError::Io(e)
    }
}

fn encoded_value_len(value: &Value, declared: Option<Type>) -> usize {
    if matches!(value, Value::Null) {
        return 1;
    }
    1 + match value.type_of().unwrap_or_else(|| declared.unwrap_or(Type::I64)) {
        Type::I32 | Type::F32 => 4,
        Type::I64 | Type::F64 | Type::Lob => 8,
        Type::Bool => 1,
        Type::Str => {
            if let Value::Str(s) = value {
                4 + s.len()
            } else {
                4
            }
        }
        Type::Bytes => {
            if let Value::Bytes(b) = value {
                4 + b.len()
            } else {
                4
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_rows() {
        let types = vec![Type::I64, Type::Str, Type::Bool];
        let rows = vec![
            vec![Value::I64(1), Value::Str("a".into()), Value::Bool(true)],
            vec![Value::Null, Value::Str("bb".into()), Value::Bool(false)],
        ];
        let mut batch = TupleBatch::new(10, rows.clone(), types.clone());
        let mut buf = Vec::new();
        batch.encode(&types, &mut buf).unwrap();
        assert_eq!(buf.len(), batch.encoded_len(&types));

        let decoded = TupleBatch::decode(&mut &buf[..], &types).unwrap();
        assert_eq!(decoded.begin_row(), 10);
        assert_eq!(decoded.rows(), rows.as_slice());
    }

    #[test]
    fn detects_lobs() {
        let types = vec![Type::Lob];
        let batch = TupleBatch::new(0, vec![vec![Value::Lob(42)]], types);
        assert!(batch.has_lobs());
    }
}
