// Copyright 2025 foyer Project Authors
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

use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use larder_common::strict_assert;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Segment id. It is also the index of the segment in the engine's segment table.
pub type SegmentId = u16;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentState {
    /// Empty, in the free pool.
    Free = 0,
    /// Accepting appends.
    Active = 1,
    /// Closed for writes, either full or explicitly sealed.
    Sealed = 2,
    /// Being compacted by the scavenger.
    Reclaiming = 3,
}

impl SegmentState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Active,
            2 => Self::Sealed,
            3 => Self::Reclaiming,
            _ => Self::Free,
        }
    }
}

/// Storage behind a segment.
#[derive(Debug)]
pub enum SegmentData {
    /// A memory buffer of the segment size.
    Memory(Box<[u8]>),
    /// A sealed segment spilled to its own file.
    File {
        /// Read-only handle.
        file: File,
        /// Path of the file, removed when the segment is reset.
        path: PathBuf,
    },
}

/// Lock-protected contents of a segment.
#[derive(Debug)]
pub struct SegmentBody {
    id: SegmentId,
    data: SegmentData,
    len: usize,
    /// Offset of the open block of the block format.
    pub(crate) block_offset: usize,
}

impl SegmentBody {
    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Whether the segment lives in memory.
    pub fn is_memory(&self) -> bool {
        matches!(self.data, SegmentData::Memory(_))
    }

    /// Capacity of the underlying buffer. File-backed segments report their written length.
    pub fn capacity(&self) -> usize {
        match &self.data {
            SegmentData::Memory(buf) => buf.len(),
            SegmentData::File { .. } => self.len,
        }
    }

    /// Written bytes of a memory segment.
    pub fn memory(&self) -> Option<&[u8]> {
        match &self.data {
            SegmentData::Memory(buf) => Some(&buf[..self.len]),
            SegmentData::File { .. } => None,
        }
    }

    /// Bytes in `[offset, offset + len)`, clamped to the written length.
    ///
    /// Memory segments are borrowed in place. File segments are read into `scratch`.
    pub fn load<'a>(&'a self, offset: usize, len: usize, scratch: &'a mut Vec<u8>) -> Result<&'a [u8]> {
        if offset > self.len {
            return Err(Error::corrupted(
                self.id,
                offset,
                format!("offset beyond written length {}", self.len),
            ));
        }
        let end = usize::min(offset + len, self.len);
        match &self.data {
            SegmentData::Memory(buf) => Ok(&buf[offset..end]),
            SegmentData::File { file, .. } => {
                scratch.clear();
                scratch.resize(end - offset, 0);
                read_exact_at(file, scratch, offset as u64)?;
                Ok(&scratch[..])
            }
        }
    }

    /// Write `bytes` at `offset` of a memory segment and extend the written length to cover them.
    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        match &mut self.data {
            SegmentData::Memory(buf) => {
                buf[offset..offset + bytes.len()].copy_from_slice(bytes);
                self.len = usize::max(self.len, offset + bytes.len());
            }
            SegmentData::File { .. } => unreachable!("file segments are read-only"),
        }
    }

    /// Set the written length after writing through [`SegmentBody::memory_mut`].
    pub(crate) fn set_len(&mut self, len: usize) {
        strict_assert!(len <= self.capacity());
        self.len = len;
    }

    /// Mutable access to a memory segment's buffer, for in-place header updates.
    pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            SegmentData::Memory(buf) => buf,
            SegmentData::File { .. } => unreachable!("file segments are read-only"),
        }
    }
}

/// Point-in-time information about a segment, used by recycling selectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: SegmentId,
    /// Popularity rank the segment was filled for.
    pub rank: usize,
    /// Creation time in millis.
    pub created: u64,
    /// Records appended.
    pub total_items: u32,
    /// Records still referenced by the index.
    pub alive_items: u32,
    /// Bytes written.
    pub used: usize,
}

impl SegmentInfo {
    /// Fraction of the appended records that are still alive.
    pub fn alive_ratio(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.alive_items as f64 / self.total_items as f64
        }
    }
}

/// Persisted metadata of a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentMeta {
    pub id: SegmentId,
    pub state: SegmentState,
    pub rank: u8,
    pub created: u64,
    pub total_items: u32,
    pub alive_items: i64,
    pub len: usize,
    pub block_offset: usize,
    pub ttl_sum: u64,
    pub ttl_count: u64,
}

/// A fixed-size append-only region holding packed records.
///
/// Appends take the write lock. Readers and scanners take a recursive read lock, so a reader that already holds a
/// segment lock elsewhere in the call chain is never queued behind a waiting writer.
pub struct Segment {
    id: SegmentId,
    size: usize,
    body: RwLock<SegmentBody>,

    state: AtomicU8,
    rank: AtomicU8,
    created: AtomicU64,
    total_items: AtomicU32,
    alive_items: AtomicI64,
    used: AtomicUsize,
    ttl_sum: AtomicU64,
    ttl_count: AtomicU64,
    /// Appends whose index update is still pending.
    writers: AtomicUsize,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("rank", &self.rank())
            .field("used", &self.used())
            .field("total_items", &self.total_items.load(Ordering::Relaxed))
            .field("alive_items", &self.alive_items.load(Ordering::Relaxed))
            .finish()
    }
}

impl Segment {
    /// Create an empty memory segment.
    pub fn new(id: SegmentId, size: usize) -> Self {
        Self::with_data(id, size, SegmentData::Memory(vec![0; size].into_boxed_slice()), 0)
    }

    fn with_data(id: SegmentId, size: usize, data: SegmentData, len: usize) -> Self {
        Self {
            id,
            size,
            body: RwLock::new(SegmentBody {
                id,
                data,
                len,
                block_offset: 0,
            }),
            state: AtomicU8::new(SegmentState::Free as u8),
            rank: AtomicU8::new(0),
            created: AtomicU64::new(0),
            total_items: AtomicU32::new(0),
            alive_items: AtomicI64::new(0),
            used: AtomicUsize::new(len),
            ttl_sum: AtomicU64::new(0),
            ttl_count: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
        }
    }

    /// Restore a segment from its persisted metadata and data.
    pub(crate) fn restore(size: usize, meta: &SegmentMeta, data: SegmentData) -> Self {
        let segment = Self::with_data(meta.id, size, data, meta.len);
        segment.body.write().block_offset = meta.block_offset;
        segment.state.store(meta.state as u8, Ordering::Release);
        segment.rank.store(meta.rank, Ordering::Relaxed);
        segment.created.store(meta.created, Ordering::Relaxed);
        segment.total_items.store(meta.total_items, Ordering::Relaxed);
        segment.alive_items.store(meta.alive_items, Ordering::Relaxed);
        segment.ttl_sum.store(meta.ttl_sum, Ordering::Relaxed);
        segment.ttl_count.store(meta.ttl_count, Ordering::Relaxed);
        segment
    }

    /// Segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Segment capacity in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Popularity rank the segment is filled for.
    pub fn rank(&self) -> usize {
        self.rank.load(Ordering::Relaxed) as usize
    }

    /// Bytes written.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Take the recursive read lock.
    pub fn read(&self) -> RwLockReadGuard<'_, SegmentBody> {
        self.body.read_recursive()
    }

    /// Take the write lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, SegmentBody> {
        self.body.write()
    }

    /// Move a free segment into the active state for `rank`.
    pub fn activate(&self, rank: usize, now: u64) {
        let mut body = self.body.write();
        strict_assert!(body.is_empty());
        body.block_offset = 0;
        if !body.is_memory() || body.capacity() != self.size {
            body.data = SegmentData::Memory(vec![0; self.size].into_boxed_slice());
        }
        self.rank.store(rank as u8, Ordering::Relaxed);
        self.created.store(now, Ordering::Relaxed);
        self.total_items.store(0, Ordering::Relaxed);
        self.alive_items.store(0, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
        self.ttl_sum.store(0, Ordering::Relaxed);
        self.ttl_count.store(0, Ordering::Relaxed);
        self.state.store(SegmentState::Active as u8, Ordering::Release);
    }

    /// Account an appended record. Must be called with the write lock held, after the bytes are in place.
    pub(crate) fn record_append(&self, body: &SegmentBody, items: u32, ttl_sum: u64, ttl_count: u64) {
        self.used.store(body.len(), Ordering::Relaxed);
        self.total_items.fetch_add(items, Ordering::Relaxed);
        self.alive_items.fetch_add(items as i64, Ordering::Relaxed);
        if ttl_count > 0 {
            self.ttl_sum.fetch_add(ttl_sum, Ordering::Relaxed);
            self.ttl_count.fetch_add(ttl_count, Ordering::Relaxed);
        }
    }

    /// Account a record that is no longer referenced by the index.
    pub fn mark_dead(&self) {
        self.alive_items.fetch_sub(1, Ordering::Relaxed);
    }

    /// Average relative TTL of the expiring records in this segment, in millis.
    pub fn avg_ttl(&self) -> Option<u64> {
        let count = self.ttl_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some(self.ttl_sum.load(Ordering::Relaxed) / count)
    }

    /// Announce an append whose index update follows. Reclamation waits until every announced write finished.
    pub(crate) fn begin_write(&self) {
        self.writers.fetch_add(1, Ordering::SeqCst);
    }

    /// Finish a write announced with [`Segment::begin_write`].
    pub(crate) fn end_write(&self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Writes announced but not finished.
    pub(crate) fn pending_writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Whether the segment accepts appends.
    pub fn is_active(&self) -> bool {
        self.state() == SegmentState::Active
    }

    /// Close an active segment for writes.
    ///
    /// With `spill`, the written bytes are moved to a file at that path and the memory buffer is released.
    ///
    /// Returns `false` if the segment was not active.
    pub fn seal(&self, spill: Option<&Path>) -> Result<bool> {
        let mut body = self.body.write();
        if self.state() != SegmentState::Active {
            return Ok(false);
        }
        if let Some(path) = spill {
            if let Some(bytes) = body.memory() {
                let file = write_segment_file(path, bytes)?;
                body.data = SegmentData::File {
                    file,
                    path: path.to_path_buf(),
                };
            }
        }
        self.state.store(SegmentState::Sealed as u8, Ordering::Release);
        tracing::debug!(
            "[segment]: sealed segment {id}, used: {used}, items: {items}",
            id = self.id,
            used = body.len(),
            items = self.total_items.load(Ordering::Relaxed)
        );
        Ok(true)
    }

    /// Claim a sealed segment for reclamation. Returns `false` if another claimer won or the segment is not sealed.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                SegmentState::Sealed as u8,
                SegmentState::Reclaiming as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Give a claimed segment back to the sealed state.
    pub fn unclaim(&self) {
        let _ = self.state.compare_exchange(
            SegmentState::Reclaiming as u8,
            SegmentState::Sealed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Empty the segment and move it to the free state. A spilled file is removed.
    pub fn reset(&self) -> Result<()> {
        let mut body = self.body.write();
        if let SegmentData::File { path, .. } = &body.data {
            let path = path.clone();
            body.data = SegmentData::Memory(Box::default());
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("[segment]: failed to remove segment file {path:?}: {e}"),
            }
        }
        body.len = 0;
        body.block_offset = 0;
        self.used.store(0, Ordering::Relaxed);
        self.total_items.store(0, Ordering::Relaxed);
        self.alive_items.store(0, Ordering::Relaxed);
        self.ttl_sum.store(0, Ordering::Relaxed);
        self.ttl_count.store(0, Ordering::Relaxed);
        self.state.store(SegmentState::Free as u8, Ordering::Release);
        tracing::debug!("[segment]: reset segment {id}", id = self.id);
        Ok(())
    }

    /// Information for recycling selectors.
    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            rank: self.rank(),
            created: self.created.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            alive_items: self.alive_items.load(Ordering::Relaxed).max(0) as u32,
            used: self.used(),
        }
    }

    /// Persisted metadata.
    pub(crate) fn meta(&self) -> SegmentMeta {
        let body = self.body.read_recursive();
        SegmentMeta {
            id: self.id,
            state: self.state(),
            rank: self.rank.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
            alive_items: self.alive_items.load(Ordering::Relaxed),
            len: body.len,
            block_offset: body.block_offset,
            ttl_sum: self.ttl_sum.load(Ordering::Relaxed),
            ttl_count: self.ttl_count.load(Ordering::Relaxed),
        }
    }

    /// Write the segment contents to `path` for a snapshot, unless a spilled file already holds them.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let body = self.body.read_recursive();
        if let Some(bytes) = body.memory() {
            write_segment_file(path, bytes)?;
        }
        Ok(())
    }
}

/// Name of the data file of a segment.
pub fn segment_file_name(id: SegmentId) -> String {
    format!("segment-{id}.data")
}

fn write_segment_file(path: &Path, bytes: &[u8]) -> Result<File> {
    let mut file = OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    drop(file);
    Ok(File::open(path)?)
}

/// Load segment data persisted at `path`.
///
/// `memory` selects whether the bytes are loaded back into a memory buffer of `size` bytes or kept as a file.
pub(crate) fn load_segment_data(path: &Path, size: usize, len: usize, memory: bool) -> Result<SegmentData> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len() as usize;
    if file_len < len {
        return Err(Error::snapshot(
            path,
            format!("segment file holds {file_len} bytes, expected {len}"),
        ));
    }
    if !memory {
        return Ok(SegmentData::File {
            file,
            path: path.to_path_buf(),
        });
    }
    let mut buf = vec![0; size].into_boxed_slice();
    read_exact_at(&file, &mut buf[..len], 0)?;
    Ok(SegmentData::Memory(buf))
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    #[cfg(target_family = "unix")]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }
    #[cfg(target_family = "windows")]
    {
        use std::os::windows::fs::FileExt;
        let mut read = 0;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            read += n;
        }
        Ok(())
    }
}
