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
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use larder_common::{clock::now_millis, strict_assert_eq};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    admission::AdmissionController,
    error::{Error, Result},
    index::Location,
    segment::{load_segment_data, segment_file_name, Segment, SegmentId, SegmentInfo, SegmentMeta, SegmentState},
};

/// An appended record whose index update is still pending.
///
/// The segment cannot be reclaimed until the guard is dropped.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub segment: Arc<Segment>,
    pub location: Location,
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        self.segment.end_write();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ManagerSnapshot {
    segment_size: usize,
    segments: Vec<SegmentMeta>,
    free: Vec<SegmentId>,
    active: Vec<Option<SegmentId>>,
}

/// Owns every segment of an engine.
///
/// Segments are created lazily up to the configured maximum and recycled through a free pool. Each popularity rank
/// has its own active segment, so records of similar popularity are packed together.
#[derive(Debug)]
pub(crate) struct SegmentManager {
    segment_size: usize,
    max_segments: usize,
    /// Spill directory of sealed segments in file mode.
    spill_dir: Option<PathBuf>,
    segments: RwLock<Vec<Arc<Segment>>>,
    free: Mutex<VecDeque<SegmentId>>,
    active: Vec<Mutex<Option<Arc<Segment>>>>,
    admission: Arc<dyn AdmissionController>,
}

impl SegmentManager {
    pub fn new(
        segment_size: usize,
        max_segments: usize,
        ranks: usize,
        spill_dir: Option<PathBuf>,
        admission: Arc<dyn AdmissionController>,
    ) -> Self {
        Self {
            segment_size,
            max_segments,
            spill_dir,
            segments: RwLock::new(Vec::with_capacity(max_segments)),
            free: Mutex::new(VecDeque::new()),
            active: (0..ranks).map(|_| Mutex::new(None)).collect(),
            admission,
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        self.segments.read().get(id as usize).cloned()
    }

    /// Segments currently out of the free pool.
    pub fn allocated(&self) -> usize {
        let created = self.segments.read().len();
        created - self.free.lock().len()
    }

    /// Allocated segments over the maximum.
    pub fn occupancy(&self) -> f64 {
        self.allocated() as f64 / self.max_segments as f64
    }

    /// Bytes written into allocated segments.
    pub fn bytes_used(&self) -> usize {
        self.segments.read().iter().map(|s| s.used()).sum()
    }

    /// Information about the segments in `state`.
    pub fn infos(&self, state: SegmentState) -> Vec<SegmentInfo> {
        self.segments
            .read()
            .iter()
            .filter(|s| s.state() == state)
            .map(|s| s.info())
            .collect()
    }

    fn spill_path(&self, id: SegmentId) -> Option<PathBuf> {
        self.spill_dir.as_ref().map(|dir| dir.join(segment_file_name(id)))
    }

    /// The active segment of `rank`, activating a new one if there is none.
    ///
    /// Never blocks on space: returns `None` when no segment can be allocated.
    pub fn active_segment(&self, rank: usize) -> Option<Arc<Segment>> {
        let rank = rank.min(self.active.len() - 1);
        let mut slot = self.active[rank].lock();
        if let Some(segment) = slot.as_ref() {
            if segment.is_active() {
                return Some(segment.clone());
            }
        }
        let segment = self.allocate(rank)?;
        *slot = Some(segment.clone());
        Some(segment)
    }

    fn allocate(&self, rank: usize) -> Option<Arc<Segment>> {
        let recycled = self.free.lock().pop_front();
        let segment = match recycled {
            Some(id) => self.segment(id)?,
            None => {
                let mut segments = self.segments.write();
                if segments.len() >= self.max_segments {
                    return None;
                }
                let segment = Arc::new(Segment::new(segments.len() as SegmentId, self.segment_size));
                segments.push(segment.clone());
                segment
            }
        };
        segment.activate(rank, now_millis());
        tracing::debug!(
            "[segment manager]: activate segment {id} for rank {rank}",
            id = segment.id()
        );
        Some(segment)
    }

    /// Append with `append` into the active segment of `rank`, sealing full segments and moving on to fresh ones.
    ///
    /// Returns `None` if no segment has room.
    pub fn append(
        &self,
        rank: usize,
        mut append: impl FnMut(&Segment) -> Result<Option<u32>>,
    ) -> Result<Option<PendingWrite>> {
        loop {
            let Some(segment) = self.active_segment(rank) else {
                return Ok(None);
            };
            segment.begin_write();
            let res = append(&segment);
            match res {
                Ok(Some(offset)) => {
                    let location = Location::new(segment.id(), offset);
                    return Ok(Some(PendingWrite { segment, location }));
                }
                Ok(None) => {
                    segment.end_write();
                    // A record that does not fit an empty segment never will.
                    if segment.used() == 0 && segment.is_active() {
                        return Ok(None);
                    }
                    self.seal(rank, &segment)?;
                }
                Err(e) => {
                    segment.end_write();
                    return Err(e);
                }
            }
        }
    }

    /// Seal `segment`, removing it from the active slot of `rank` if it is still there.
    pub fn seal(&self, rank: usize, segment: &Arc<Segment>) -> Result<()> {
        {
            let mut slot = self.active[rank.min(self.active.len() - 1)].lock();
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, segment)) {
                *slot = None;
            }
        }
        let spill = self.spill_path(segment.id());
        if segment.seal(spill.as_deref())? {
            if let Some(ttl) = segment.avg_ttl() {
                self.admission.register_segment_ttl(segment.rank(), ttl);
            }
        }
        Ok(())
    }

    /// Empty a reclaimed segment and return it to the free pool.
    pub fn release(&self, segment: &Segment) -> Result<()> {
        strict_assert_eq!(segment.state(), SegmentState::Reclaiming);
        if let Some(ttl) = segment.avg_ttl() {
            self.admission.unregister_segment_ttl(segment.rank(), ttl);
        }
        segment.reset()?;
        self.free.lock().push_back(segment.id());
        Ok(())
    }

    /// Persist segment metadata into `writer` and segment contents as files under `dir`.
    pub fn save(&self, dir: &Path, writer: &mut dyn std::io::Write) -> Result<()> {
        let segments = self.segments.read().clone();
        let mut metas = Vec::with_capacity(segments.len());
        for segment in segments.iter() {
            let meta = segment.meta();
            if meta.state != SegmentState::Free {
                segment.persist(&dir.join(segment_file_name(segment.id())))?;
            }
            metas.push(meta);
        }
        let snapshot = ManagerSnapshot {
            segment_size: self.segment_size,
            segments: metas,
            free: self.free.lock().iter().copied().collect(),
            active: self
                .active
                .iter()
                .map(|slot| slot.lock().as_ref().map(|s| s.id()))
                .collect(),
        };
        bincode::serialize_into(writer, &snapshot)?;
        Ok(())
    }

    /// Restore segments saved by [`SegmentManager::save`]. Must run before any segment is allocated.
    pub fn load(&self, dir: &Path, reader: &mut dyn std::io::Read) -> Result<()> {
        let snapshot: ManagerSnapshot = bincode::deserialize_from(reader)?;
        let path = dir.join(crate::snapshot::ENGINE_FILE);
        if snapshot.segment_size != self.segment_size {
            return Err(Error::snapshot(
                &path,
                format!(
                    "segment size {} differs from configured {}",
                    snapshot.segment_size, self.segment_size
                ),
            ));
        }
        if snapshot.segments.len() > self.max_segments {
            return Err(Error::snapshot(
                &path,
                format!(
                    "{} segments exceed the maximum of {}",
                    snapshot.segments.len(),
                    self.max_segments
                ),
            ));
        }

        let mut segments = Vec::with_capacity(snapshot.segments.len());
        for (i, meta) in snapshot.segments.iter().enumerate() {
            if meta.id as usize != i {
                return Err(Error::snapshot(&path, format!("segment {} found at slot {i}", meta.id)));
            }
            let segment = match meta.state {
                SegmentState::Free => Segment::new(meta.id, self.segment_size),
                state => {
                    let memory = state == SegmentState::Active || self.spill_dir.is_none();
                    let data = load_segment_data(
                        &dir.join(segment_file_name(meta.id)),
                        self.segment_size,
                        meta.len,
                        memory,
                    )?;
                    let mut meta = meta.clone();
                    if meta.state == SegmentState::Reclaiming {
                        meta.state = SegmentState::Sealed;
                    }
                    Segment::restore(self.segment_size, &meta, data)
                }
            };
            segments.push(Arc::new(segment));
        }

        for (rank, id) in snapshot.active.iter().enumerate() {
            let Some(id) = id else { continue };
            if let (Some(slot), Some(segment)) = (self.active.get(rank), segments.get(*id as usize)) {
                if segment.is_active() {
                    *slot.lock() = Some(segment.clone());
                }
            }
        }
        // Active segments not bound to a rank slot are closed for writes.
        for segment in segments.iter() {
            let bound = self
                .active
                .iter()
                .any(|slot| slot.lock().as_ref().is_some_and(|s| Arc::ptr_eq(s, segment)));
            if segment.is_active() && !bound {
                let spill = self.spill_path(segment.id());
                segment.seal(spill.as_deref())?;
            }
        }

        *self.free.lock() = snapshot.free.into_iter().collect();
        *self.segments.write() = segments;
        tracing::debug!(
            "[segment manager]: restored {allocated} allocated segments",
            allocated = self.allocated()
        );
        Ok(())
    }

    /// Remove the snapshot files of segments that were restored into memory.
    ///
    /// Segments served from their files keep them.
    pub fn remove_restored_files(&self, dir: &Path) {
        for segment in self.segments.read().iter() {
            if segment.state() == SegmentState::Free || !segment.read().is_memory() {
                continue;
            }
            let path = dir.join(segment_file_name(segment.id()));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("[segment manager]: failed to remove restored segment file {path:?}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::BaseAdmissionController,
        io::{BlockDataWriter, DataWriter},
    };

    fn manager(max_segments: usize) -> SegmentManager {
        SegmentManager::new(
            1024,
            max_segments,
            2,
            None,
            Arc::new(BaseAdmissionController::new(2)),
        )
    }

    #[test_log::test]
    fn test_allocate_seal_release() {
        let manager = manager(2);
        let writer = BlockDataWriter::new(256);

        let mut locations = vec![];
        loop {
            let pending = manager
                .append(0, |segment| writer.append(segment, b"key", &[1; 200], None))
                .unwrap();
            match pending {
                Some(pending) => locations.push(pending.location),
                None => break,
            }
        }
        // Two segments of four 256 byte blocks, one record per block.
        assert_eq!(locations.len(), 8);
        assert_eq!(manager.allocated(), 2);
        assert_eq!(manager.occupancy(), 1.0);
        // The failed append sealed the last segment too.
        assert_eq!(manager.infos(SegmentState::Sealed).len(), 2);
        assert!(manager.active_segment(1).is_none());

        let sealed = manager.segment(0).unwrap();
        assert!(sealed.try_claim());
        manager.release(&sealed).unwrap();
        assert_eq!(manager.allocated(), 1);

        // The released segment is recycled for another rank.
        let segment = manager.active_segment(1).unwrap();
        assert_eq!(segment.id(), 0);
        assert_eq!(segment.rank(), 1);
    }

    #[test_log::test]
    fn test_oversized_record() {
        let manager = manager(4);
        let writer = BlockDataWriter::new(256);
        let pending = manager
            .append(0, |segment| writer.append(segment, b"key", &[1; 2048], None))
            .unwrap();
        assert!(pending.is_none());
        assert_eq!(manager.allocated(), 1);
    }

    #[test_log::test]
    fn test_pending_write_blocks_reclaim() {
        let manager = manager(2);
        let writer = BlockDataWriter::new(256);
        let pending = manager
            .append(0, |segment| writer.append(segment, b"key", b"value", None))
            .unwrap()
            .unwrap();
        let segment = pending.segment.clone();
        assert_eq!(segment.pending_writers(), 1);
        drop(pending);
        assert_eq!(segment.pending_writers(), 0);
    }
}
