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

//! The `FileStore`/`StorageManager` contract this crate consumes, plus a
//! `std::fs`-backed production implementation.
//!
//! This is the lowest-numbered, outermost lock tier (§5 tier 5): a
//! [`LocalFileStore`] serializes writers on its own monitor but lets reads
//! proceed concurrently, since each read opens its own file descriptor.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Append-only random-access byte store with a cleanup hook.
///
/// Consumed by [`crate::batch_store::BatchStore`] as its one subordinate
/// file and by [`crate::buffer_manager::BufferManager::create_file_store`].
pub trait FileStore: Send + Sync {
    fn length(&self) -> Result<u64>;

    /// Reads exactly `buf.len()` bytes starting at `offset`; fails with
    /// `Io` on a short read.
    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Opens a writer positioned at the current end of the file. Only one
    /// writer is live at a time per store (tier-5 monitor).
    fn create_output_stream(&self) -> Result<Box<dyn Write + Send>>;

    /// Opens a reader positioned at `offset`.
    fn create_input_stream(&self, offset: u64) -> Result<Box<dyn Read + Send>>;

    /// Explicit deletion of the backing file.
    fn remove(&self) -> Result<()>;

    /// Truncates (or, if growing, extends with zeros) the backing file to
    /// `len` bytes. Used by compaction's file swap.
    fn truncate(&self, len: u64) -> Result<()>;

    fn name(&self) -> &str;
}

/// A `std::fs::File`-backed [`FileStore`].
///
/// The per-store monitor (§5 tier 5) guards `truncate`, which is the only
/// operation that cannot rely on the OS's atomic `O_APPEND` writes for
/// correctness; ordinary appends are serialized by the kernel.
pub struct LocalFileStore {
    path: PathBuf,
    name: String,
    write_lock: Mutex<()>,
}

impl LocalFileStore {
    pub fn open(path: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self> {
        let path = path.into();
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(LocalFileStore {
            path,
            name: name.into(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader_handle(&self) -> io::Result<File> {
        OpenOptions::new().read(true).open(&self.path)
    }
}

impl FileStore for LocalFileStore {
    fn length(&self) -> Result<u64> {
        Ok(self.reader_handle()?.metadata()?.len())
    }

    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.reader_handle()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn create_output_stream(&self) -> Result<Box<dyn Write + Send>> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Box::new(file))
    }

    fn create_input_stream(&self, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut file = self.reader_handle()?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file))
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let _lock = self.write_lock.lock();
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(len)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for [`FileStore`]s, keyed by opaque name. Names are derived from
/// monotonic buffer ids and are never reused within a run.
pub trait StorageManager: Send + Sync {
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>>;
}

/// Resolves names under a configured base directory.
pub struct LocalStorageManager {
    base_dir: PathBuf,
}

impl LocalStorageManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(LocalStorageManager { base_dir })
    }
}

impl StorageManager for LocalStorageManager {
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        let path = self.base_dir.join(name);
        Ok(Arc::new(LocalFileStore::open(path, name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_through_a_local_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::open(dir.path().join("batches.bin"), "batches.bin").unwrap();

        {
            let mut out = store.create_output_stream().unwrap();
            out.write_all(b"hello world").unwrap();
            out.flush().unwrap();
        }

        assert_eq!(store.length().unwrap(), 11);
        let mut buf = vec![0u8; 5];
        store.read_fully(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let mut reader = store.create_input_stream(0).unwrap();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"hello world");
    }

    #[test]
    fn truncate_shrinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::open(dir.path().join("f.bin"), "f.bin").unwrap();
        {
            let mut out = store.create_output_stream().unwrap();
            out.write_all(&[0u8; 100]).unwrap();
        }
        store.truncate(10).unwrap();
        assert_eq!(store.length().unwrap(), 10);
    }

    #[test]
    fn remove_deletes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        let store = LocalFileStore::open(&path, "gone.bin").unwrap();
        store.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn local_storage_manager_creates_named_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LocalStorageManager::new(dir.path()).unwrap();
        let store = mgr.create_file_store("tb-1").unwrap();
        assert_eq!(store.name(), "tb-1");
        assert_eq!(store.length().unwrap(), 0);
    }
}
