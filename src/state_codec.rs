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

//! Binary wire format used to snapshot and restore the set of live tuple
//! buffers, for replicating cached results to another node.
//!
//! Layout (little-endian): magic `u32`, version `u8`, then per buffer:
//! `id_len: u32, id, row_count: i64, batch_size: u32, n_types: u16, types,
//! prefers_memory: u8, n_batches: u32`, then per batch `begin_row: i64,
//! len: u32, row payload` (the same tagged-value encoding `TupleBatch`
//! itself uses).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{BufferManagerError, Result};
use crate::lob_manager::LobManager;
use crate::soft_cache::SoftCache;
use crate::tuple_batch::TupleBatch;
use crate::tuple_buffer::TupleBuffer;
use crate::types::Type;

const MAGIC: u32 = 0x5442_5453;
const VERSION: u8 = 1;

/// One buffer's metadata plus its decoded batches, ready for replay into a
/// fresh `TupleBuffer` via `BufferManager::create_tuple_buffer` + `append`.
#[derive(Debug)]
pub struct DecodedBuffer {
    pub id: String,
    pub schema: Vec<Type>,
    pub batch_size: usize,
    pub prefers_memory: bool,
    pub batches: Vec<TupleBatch>,
}

pub struct StateCodec;

impl StateCodec {
    /// Serializes every buffer in `buffers`, in the order given.
    pub fn write_state<W: Write>(out: &mut W, buffers: &[(&TupleBuffer, &SoftCache)]) -> Result<()> {
        out.write_u32::<LittleEndian>(MAGIC)?;
        out.write_u8(VERSION)?;
        out.write_u32::<LittleEndian>(buffers.len() as u32)?;
        for (buffer, soft_cache) in buffers {
            Self::write_buffer(out, buffer, soft_cache)?;
        }
        Ok(())
    }

    /// Serializes one buffer: metadata followed by every batch's row
    /// content, fetched via `get_batch` (promoting nothing: `cache=false`).
    pub fn write_buffer<W: Write>(out: &mut W, buffer: &TupleBuffer, soft_cache: &SoftCache) -> Result<()> {
        let id_bytes = buffer.id().as_bytes();
        out.write_u32::<LittleEndian>(id_bytes.len() as u32)?;
        out.write_all(id_bytes)?;
        out.write_i64::<LittleEndian>(buffer.row_count())?;
        out.write_u32::<LittleEndian>(buffer.batch_size() as u32)?;
        out.write_u16::<LittleEndian>(buffer.schema().len() as u16)?;
        for ty in buffer.schema() {
            out.write_u8(ty.tag())?;
        }
        out.write_u8(buffer.prefers_memory() as u8)?;

        let managed = buffer.batches_in_order();
        out.write_u32::<LittleEndian>(managed.len() as u32)?;
        let store = buffer.store();
        let lob_manager = buffer.lob_manager().map(|m| m.as_ref());
        let lob_indexes = buffer.lob_column_indexes();
        for mb in &managed {
            let (mut batch, _charged) = mb.get_batch(false, store, soft_cache, buffer.schema(), lob_manager, lob_indexes)?;
            batch.encode(buffer.schema(), out)?;
        }
        Ok(())
    }

    /// Deserializes the buffers written by `write_state`.
    pub fn read_state<R: Read>(input: &mut R, lob_manager: Option<&LobManager>) -> Result<Vec<DecodedBuffer>> {
        let magic = input.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(BufferManagerError::format(format!("bad state magic {magic:#x}")));
        }
        let version = input.read_u8()?;
        if version != VERSION {
            return Err(BufferManagerError::format(format!("unsupported state version {version}")));
        }
        let n_buffers = input.read_u32::<LittleEndian>()?;
        let mut buffers = Vec::with_capacity(n_buffers as usize);
        for _ in 0..n_buffers {
            buffers.push(Self::read_buffer(input, lob_manager)?);
        }
        Ok(buffers)
    }

    /// Deserializes one buffer. Eagerly validates LOB references against
    /// `lob_manager` (§4.C/§4.F `restore_cached_results`): a missing
    /// reference aborts this buffer's restore rather than installing a
    /// partially-resolved one.
    pub fn read_buffer<R: Read>(input: &mut R, lob_manager: Option<&LobManager>) -> Result<DecodedBuffer> {
        let id_len = input.read_u32::<LittleEndian>()? as usize;
        let mut id_buf = vec![0u8; id_len];
        input.read_exact(&mut id_buf)?;
        let id = String::from_utf8(id_buf).map_err(|e| BufferManagerError::format(e.to_string()))?;

        let row_count = input.read_i64::<LittleEndian>()?;
        let batch_size = input.read_u32::<LittleEndian>()? as usize;
        let n_types = input.read_u16::<LittleEndian>()?;
        let mut schema = Vec::with_capacity(n_types as usize);
        for _ in 0..n_types {
            schema.push(Type::from_tag(input.read_u8()?)?);
        }
        let prefers_memory = input.read_u8()? != 0;

        let has_lobs = schema.iter().any(|t| *t == Type::Lob);
        let lob_column_indexes: Vec<usize> = schema
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == Type::Lob)
            .map(|(i, _)| i)
            .collect();

        let n_batches = input.read_u32::<LittleEndian>()?;
        let mut batches = Vec::with_capacity(n_batches as usize);
        for _ in 0..n_batches {
            let batch = TupleBatch::decode(input, &schema)?;
            if has_lobs {
                if let Some(lobs) = lob_manager {
                    for row in batch.rows() {
                        let missing = lobs.rewrite(row, &lob_column_indexes)?;
                        if !missing.is_empty() {
                            return Err(BufferManagerError::lob_missing(format!(
                                "buffer {id}: {missing:?}"
                            )));
                        }
                    }
                } else {
                    return Err(BufferManagerError::lob_missing(format!(
                        "buffer {id} carries LOB columns but no LobManager was supplied"
                    )));
                }
            }
            batches.push(batch);
        }

        let _ = row_count; // informational; reconstructed row count comes from replayed appends
        Ok(DecodedBuffer {
            id,
            schema,
            batch_size,
            prefers_memory,
            batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_store::BatchStore;
    use crate::file_store::LocalStorageManager;
    use crate::types::Value;
    use std::sync::Arc;

    fn buffer_with_rows() -> (tempfile::TempDir, TupleBuffer, SoftCache) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(LocalStorageManager::new(dir.path()).unwrap());
        let store = Arc::new(BatchStore::new("tb-1".into(), mgr).unwrap());
        let tb = TupleBuffer::new("tb-1".into(), vec![Type::I64, Type::Str], 4, true, false, store, None);
        tb.append(vec![
            vec![Value::I64(1), Value::Str("a".into())],
            vec![Value::I64(2), Value::Str("b".into())],
        ])
        .unwrap();
        (dir, tb, SoftCache::new(1024))
    }

    #[test]
    fn round_trips_buffer_metadata_and_rows() {
        let (_dir, tb, cache) = buffer_with_rows();
        let mut buf = Vec::new();
        StateCodec::write_buffer(&mut buf, &tb, &cache).unwrap();

        let decoded = StateCodec::read_buffer(&mut &buf[..], None).unwrap();
        assert_eq!(decoded.id, "tb-1");
        assert_eq!(decoded.schema, vec![Type::I64, Type::Str]);
        assert_eq!(decoded.batches.len(), 1);
        assert_eq!(decoded.batches[0].rows()[1][0], Value::I64(2));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; 16];
        let err = StateCodec::read_state(&mut &bytes[..], None).unwrap_err();
        assert!(matches!(err, BufferManagerError::Format(_)));
    }

    #[test]
    fn missing_lob_manager_refuses_restore_of_lob_bearing_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(LocalStorageManager::new(dir.path()).unwrap());
        let store = Arc::new(BatchStore::new("tb-lob".into(), mgr).unwrap());
        let lobs = Arc::new(LobManager::new());
        let tb = TupleBuffer::new(
            "tb-lob".into(),
            vec![Type::Lob],
            4,
            true,
            false,
            store,
            Some(lobs.clone()),
        );
        tb.append(vec![vec![Value::Lob(1)]]).unwrap();

        let cache = SoftCache::new(1024);
        let mut buf = Vec::new();
        StateCodec::write_buffer(&mut buf, &tb, &cache).unwrap();

        let err = StateCodec::read_buffer(&mut &buf[..], None).unwrap_err();
        assert!(matches!(err, BufferManagerError::LobMissing(_)));
    }
}
