// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-slot record store.
//!
//! Layout: `slot_0 ++ slot_1 ++ … ++ slot_{cap-1} ++ u64`, where each slot
//! is a `u64` tag header followed by `record_size` vector bytes and the
//! trailing `u64` terminates the final slot's successor header. A slot is
//! unused (header [`INVALID_TAG`], everything past the first such header
//! is unused too), live, or tombstoned (header [`DELETED_TAG`]).
//!
//! Reads go through a shared read-only mmap; writes go through positioned
//! writes on the same file, so the kernel page cache keeps concurrent
//! readers coherent. The store is best-effort durable: nothing is fsync'd
//! between writes, and on reopen without the `.info` sidecar the free-list
//! and upper bound are rebuilt from the slot headers themselves.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::error;

use ivory_core::{Error, Result, DELETED_TAG, INVALID_TAG, SLOT_HEADER_SIZE};

/// One live record, borrowed from the store's mmap.
#[derive(Clone, Copy, Debug)]
pub struct Record<'a> {
    pub tag: u64,
    pub data: &'a [u8],
}

/// Outcome of probing one slot during a sequential scan.
#[derive(Debug)]
pub enum Scan<'a> {
    Ok(Record<'a>),
    Deleted,
    Finished,
}

struct StoreState {
    /// Index of the first slot whose header is [`INVALID_TAG`].
    upper: u64,
    /// Tombstoned slot indices; `first()` is the preferred reuse target.
    deleted: BTreeSet<u32>,
}

pub struct RecordStore {
    path: PathBuf,
    record_size: u64,
    slot_size: u64,
    capacity: u64,
    file: File,
    map: Mmap,
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// Creates the data file sized for `initial_count` slots and marks
    /// slot 0 as the terminator. Fails if the file already exists.
    pub fn create(path: &Path, record_size: u64, initial_count: u64) -> Result<()> {
        let slot_size = SLOT_HEADER_SIZE + record_size;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let total = initial_count * slot_size + SLOT_HEADER_SIZE;
        file.set_len(total).map_err(|e| Error::io(path, e))?;
        file.write_all_at(&INVALID_TAG.to_le_bytes(), 0)
            .map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    /// Opens an existing store. The `.info` sidecar, when present, is
    /// consumed (read then deleted) so stale state is never trusted after
    /// a crash; without it the slot headers are rescanned.
    pub fn open(path: &Path, record_size: u64) -> Result<Self> {
        let slot_size = SLOT_HEADER_SIZE + record_size;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;

        let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
        if len < SLOT_HEADER_SIZE || (len - SLOT_HEADER_SIZE) % slot_size != 0 {
            return Err(Error::Invariant(format!(
                "data file '{}' has invalid size {len} for record size {record_size}",
                path.display()
            )));
        }
        let capacity = (len - SLOT_HEADER_SIZE) / slot_size;

        let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;

        let mut store = RecordStore {
            path: path.to_path_buf(),
            record_size,
            slot_size,
            capacity,
            file,
            map,
            state: Mutex::new(StoreState {
                upper: 0,
                deleted: BTreeSet::new(),
            }),
        };

        if !store.read_info()? {
            store.rescan();
        }
        Ok(store)
    }

    /// Persists the `.info` sidecar (tmp file + atomic rename). Called on
    /// clean shutdown; skipping it only costs a rescan on next open.
    pub fn uninit(&self) -> Result<()> {
        self.write_info()
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn upper_record_id(&self) -> u64 {
        self.state.lock().upper
    }

    pub fn deleted_count(&self) -> u64 {
        self.state.lock().deleted.len() as u64
    }

    /// Live records: every slot below the upper bound minus tombstones.
    pub fn records_count(&self) -> u64 {
        let state = self.state.lock();
        state.upper - state.deleted.len() as u64
    }

    pub fn is_deleted(&self, record_id: u32) -> bool {
        self.state.lock().deleted.contains(&record_id)
    }

    /// Looks up a live record by slot index.
    pub fn get(&self, record_id: u64) -> Result<Record<'_>> {
        if record_id >= self.upper_record_id() {
            return Err(Error::NotFound(format!(
                "record id {record_id} out of range in store at '{}'",
                self.path.display()
            )));
        }

        let offset = (record_id * self.slot_size) as usize;
        let tag = self.header_at(offset);
        if tag == INVALID_TAG || tag == DELETED_TAG {
            return Err(Error::NotFound(format!(
                "record id {record_id} is not a live record in store at '{}'",
                self.path.display()
            )));
        }

        Ok(Record {
            tag,
            data: self.vector_at(offset),
        })
    }

    /// Probes one slot; the usual driver is `for id in 0.. { match scan(id) … }`.
    pub fn scan(&self, record_id: u64) -> Scan<'_> {
        if record_id >= self.upper_record_id() {
            return Scan::Finished;
        }

        let offset = (record_id * self.slot_size) as usize;
        match self.header_at(offset) {
            INVALID_TAG => Scan::Finished,
            DELETED_TAG => Scan::Deleted,
            tag => Scan::Ok(Record {
                tag,
                data: self.vector_at(offset),
            }),
        }
    }

    /// Stores a record, preferring the smallest tombstoned slot and
    /// appending otherwise. Returns the assigned record id.
    pub fn put(&self, tag: u64, bytes: &[u8]) -> Result<u32> {
        if bytes.len() as u64 > self.record_size {
            return Err(Error::Validation(format!(
                "invalid data size {} for record in store at '{}'",
                bytes.len(),
                self.path.display()
            )));
        }

        let mut state = self.state.lock();

        if let Some(&reused) = state.deleted.first() {
            // The successor header is already in place, so only the slot
            // itself is rewritten.
            let mut buf = vec![0u8; self.slot_size as usize];
            buf[..8].copy_from_slice(&tag.to_le_bytes());
            buf[8..8 + bytes.len()].copy_from_slice(bytes);
            self.write_at(reused as u64 * self.slot_size, &buf)?;
            state.deleted.remove(&reused);
            return Ok(reused);
        }

        if state.upper >= self.capacity {
            return Err(Error::Capacity(format!(
                "no space left to insert new record in store at '{}'",
                self.path.display()
            )));
        }

        // Append: write the slot plus the following terminator header.
        let record_id = state.upper;
        let mut buf = vec![0u8; (self.slot_size + SLOT_HEADER_SIZE) as usize];
        buf[..8].copy_from_slice(&tag.to_le_bytes());
        buf[8..8 + bytes.len()].copy_from_slice(bytes);
        buf[self.slot_size as usize..].copy_from_slice(&INVALID_TAG.to_le_bytes());
        self.write_at(record_id * self.slot_size, &buf)?;
        state.upper += 1;
        Ok(record_id as u32)
    }

    /// Overwrites the vector region of a live slot; the tag is unchanged.
    pub fn update(&self, record_id: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != self.record_size {
            return Err(Error::Validation(format!(
                "invalid data size {} for record update in store at '{}'",
                bytes.len(),
                self.path.display()
            )));
        }
        if record_id >= self.upper_record_id() {
            return Err(Error::NotFound(format!(
                "record id {record_id} out of range in store at '{}'",
                self.path.display()
            )));
        }

        let offset = record_id * self.slot_size;
        let tag = self.header_at(offset as usize);
        if tag == DELETED_TAG || tag == INVALID_TAG {
            return Err(Error::Validation(format!(
                "cannot update deleted or invalid record id {record_id} in store at '{}'",
                self.path.display()
            )));
        }

        self.write_at(offset + SLOT_HEADER_SIZE, bytes)
    }

    /// Tombstones a slot and adds it to the free-list.
    pub fn delete(&self, record_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if record_id >= state.upper {
            return Err(Error::NotFound(format!(
                "record id {record_id} out of range in store at '{}'",
                self.path.display()
            )));
        }

        self.write_at(record_id * self.slot_size, &DELETED_TAG.to_le_bytes())?;
        state.deleted.insert(record_id as u32);
        Ok(())
    }

    fn header_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.map[offset..offset + 8].try_into().unwrap())
    }

    fn vector_at(&self, offset: usize) -> &[u8] {
        let start = offset + SLOT_HEADER_SIZE as usize;
        &self.map[start..start + self.record_size as usize]
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        // write_all_at retries short writes and EINTR like a pwrite loop.
        self.file.write_all_at(data, offset).map_err(|e| {
            error!(path = %self.path.display(), offset, "record store write failed: {e}");
            Error::io(&self.path, e)
        })
    }

    fn info_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".info");
        PathBuf::from(os)
    }

    /// Returns whether the sidecar was present and consumed.
    fn read_info(&mut self) -> Result<bool> {
        let info_path = self.info_path();
        let file = match File::open(&info_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(&info_path, e)),
        };

        // Consume it up front: if this process dies before the next clean
        // shutdown, the rescan path is authoritative.
        fs::remove_file(&info_path).map_err(|e| Error::io(&info_path, e))?;

        let mut lines = BufReader::new(file).lines();
        let Some(first) = lines.next() else {
            return Ok(true); // empty file is fine
        };
        let first = first.map_err(|e| Error::io(&info_path, e))?;

        let state = self.state.get_mut();
        state.upper = first.trim().parse().map_err(|_| {
            Error::Invariant(format!(
                "invalid upper record id in info file at '{}': {first}",
                info_path.display()
            ))
        })?;

        for line in lines {
            let line = line.map_err(|e| Error::io(&info_path, e))?;
            let id: u32 = line.trim().parse().map_err(|_| {
                Error::Invariant(format!(
                    "invalid deleted record id in info file at '{}': {line}",
                    info_path.display()
                ))
            })?;
            state.deleted.insert(id);
        }

        Ok(true)
    }

    fn write_info(&self) -> Result<()> {
        let info_path = self.info_path();
        let mut tmp_path = info_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let state = self.state.lock();
        {
            let mut out = std::io::BufWriter::new(
                File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?,
            );
            writeln!(out, "{}", state.upper).map_err(|e| Error::io(&tmp_path, e))?;
            for id in &state.deleted {
                writeln!(out, "{id}").map_err(|e| Error::io(&tmp_path, e))?;
            }
            out.flush().map_err(|e| Error::io(&tmp_path, e))?;
        }

        fs::rename(&tmp_path, &info_path).map_err(|e| Error::io(&info_path, e))
    }

    /// Rebuilds upper bound and free-list from the slot headers.
    fn rescan(&mut self) {
        let state = self.state.get_mut();
        state.upper = self.capacity;
        for index in 0..self.capacity {
            match u64::from_le_bytes(
                self.map[(index * self.slot_size) as usize..][..8]
                    .try_into()
                    .unwrap(),
            ) {
                DELETED_TAG => {
                    state.deleted.insert(index as u32);
                }
                INVALID_TAG => {
                    state.upper = index;
                    break;
                }
                _ => {}
            }
        }
    }
}
