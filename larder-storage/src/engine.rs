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

//! The cache engine.
//!
//! [`Engine`] ties the segment manager, the memory index, admission and the scavenger together. It is a cheap
//! handle over shared state and can be cloned across threads.

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use flume::RecvTimeoutError;
use larder_common::{clock, hasher::hash_key, object_pool::ObjectPool};
use parking_lot::Mutex;

use crate::{
    admission::{admission_controller, AdmissionController},
    compress::Compressor,
    config::{EngineConfig, StorageKind},
    error::Result,
    eviction::eviction_policy,
    index::{Location, MemoryIndex},
    io::{
        record_len, BlockDataReader, BlockDataWriter, CompressedBlockDataReader, CompressedBlockDataWriter, DataReader,
        DataWriter, SegmentCursor, WriteBatch,
    },
    manager::{PendingWrite, SegmentManager},
    recycling::{recycling_selector, RecyclingSelector, RecyclingStats},
    scavenger::{Scavenger, ScavengerReport, ScavengerStats},
    segment::{Segment, SegmentState},
    snapshot,
    statistics::{Statistics, StatisticsSnapshot},
    throughput::ThroughputController,
};

/// Idle read buffers kept for file segment reads.
const READ_BUFFER_POOL_CAPACITY: usize = 256;

const MIN_PUT_BACKOFF: Duration = Duration::from_micros(50);
const MAX_PUT_BACKOFF: Duration = Duration::from_millis(5);

/// Result of a read into a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// The value was copied, with its length.
    Found(usize),
    /// The buffer is too small. Carries the required length.
    BufferTooSmall(usize),
    /// The key is absent or expired.
    NotFound,
}

impl Fetch {
    /// Whether the key was found, regardless of the buffer size.
    pub fn is_found(&self) -> bool {
        !matches!(self, Fetch::NotFound)
    }
}

fn copy_value(value: &[u8], start: usize, buf: &mut [u8]) -> Fetch {
    let value = value.get(start..).unwrap_or_default();
    if value.len() > buf.len() {
        return Fetch::BufferTooSmall(value.len());
    }
    buf[..value.len()].copy_from_slice(value);
    Fetch::Found(value.len())
}

#[derive(Debug, Default)]
struct Workers {
    /// Wakes a scavenger worker. Dropping it stops the scavenger workers.
    wake: Option<flume::Sender<()>>,
    /// Never sent on. Dropping it stops the throughput worker.
    stop: Option<flume::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

/// Shared state of an engine, also seen by background workers.
#[derive(Debug)]
pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub dir: PathBuf,
    pub manager: SegmentManager,
    pub index: MemoryIndex,
    pub writer: Box<dyn DataWriter>,
    pub reader: Box<dyn DataReader>,
    pub compressor: Option<Arc<Compressor>>,
    pub admission: Arc<dyn AdmissionController>,
    pub throughput: Option<ThroughputController>,
    pub recycling: Box<dyn RecyclingSelector>,
    pub scavenger: Scavenger,
    pub statistics: Statistics,
    buffers: ObjectPool<Vec<u8>>,
    workers: Mutex<Workers>,
}

impl EngineInner {
    /// Read the record of `key` in the block at `location` and pass its value to `visit`.
    ///
    /// Returns `false` if the block holds no such key, which is a fingerprint collision.
    pub fn read_record(&self, location: Location, key: &[u8], visit: &mut dyn FnMut(&[u8])) -> Result<bool> {
        let Some(segment) = self.manager.segment(location.segment) else {
            return Ok(false);
        };
        let body = segment.read();
        if segment.state() == SegmentState::Free || location.offset as usize >= body.len() {
            return Ok(false);
        }

        let mut buffer = self.buffers.acquire();
        let mut cursor = SegmentCursor::with_buffer(&body, self.reader.prefetch_size(), std::mem::take(&mut *buffer));
        let res = self.reader.find(&mut cursor, location.offset as usize, key, visit);
        *buffer = cursor.into_buffer();

        let found = res?;
        if !found {
            self.statistics.record_collision();
        }
        Ok(found)
    }

    /// Rank of the active segment a new record with `ttl` is appended to.
    fn insert_rank(&self, ttl: Option<u64>) -> usize {
        let rank = self.index.policy().insert_rank();
        match ttl {
            Some(ttl) => self.admission.adjust_rank(rank, ttl),
            None => rank,
        }
    }

    fn holds_key(&self, location: Location, key: &[u8]) -> Result<bool> {
        self.read_record(location, key, &mut |_| {})
    }

    fn mark_dead(&self, location: Location) {
        if let Some(segment) = self.manager.segment(location.segment) {
            segment.mark_dead();
        }
    }

    fn expire_entry(&self, hash: u64, location: Location) {
        if self.index.remove_if(hash, location) {
            self.mark_dead(location);
            self.statistics.record_expired(1);
        }
    }

    fn index_record(&self, hash: u64, key: &[u8], location: Location, expire: u64) -> Result<()> {
        let outcome = self
            .index
            .insert(hash, location, expire, |existing| self.holds_key(existing, key))?;
        if let Some(replaced) = outcome.replaced {
            self.mark_dead(replaced);
        }
        if let Some(evicted) = outcome.evicted {
            self.mark_dead(evicted);
            self.statistics.record_evicted(1);
        }
        Ok(())
    }

    /// Append a record moved out of a reclaimed segment. Never waits for space.
    pub fn relocate(&self, rank: usize, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<Option<PendingWrite>> {
        self.manager
            .append(rank, |segment| self.writer.append(segment, key, value, ttl))
    }

    /// Returns `false` if there is no background scavenger to wake.
    fn wake_scavenger(&self) -> bool {
        match self.workers.lock().wake.as_ref() {
            Some(wake) => {
                // A full channel means a wake-up is already pending.
                let _ = wake.try_send(());
                true
            }
            None => false,
        }
    }

    /// Append into the active segment of `rank`, waiting up to `max_wait_on_put` for the scavenger to free space.
    fn append_with_backoff(
        &self,
        rank: usize,
        mut append: impl FnMut(&Segment) -> Result<Option<u32>>,
    ) -> Result<Option<PendingWrite>> {
        let deadline = Instant::now() + self.config.max_wait_on_put;
        let mut backoff = MIN_PUT_BACKOFF;
        loop {
            if let Some(pending) = self.manager.append(rank, &mut append)? {
                return Ok(Some(pending));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if !self.wake_scavenger() {
                let report = self.scavenger.run(self)?;
                if report.segments_reclaimed > 0 {
                    continue;
                }
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_PUT_BACKOFF);
        }
    }

    fn record_write(&self, bytes: usize) {
        if let Some(throughput) = &self.throughput {
            throughput.record(bytes);
        }
        self.statistics.record_put(bytes);
    }
}

/// An embedded key-value cache over fixed-size segments.
///
/// Values are appended to per-rank active segments and located through a compact in-memory index. When the
/// segment budget runs out, the scavenger reclaims segments, relocating records that are still alive.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Validate `config`, open the engine and start its background workers.
    ///
    /// With [`EngineConfig::recover`] set, a snapshot found under the cache directory is loaded first.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let dir = config.dir();
        if config.storage == StorageKind::File || config.recover || config.save_on_close {
            fs::create_dir_all(&dir)?;
        }

        let admission: Arc<dyn AdmissionController> = Arc::from(admission_controller(&config));
        let index = MemoryIndex::new(
            config.index_format,
            config.index_shards,
            config.index_initial_bucket_bits,
            config.index_max_bucket_bits,
            eviction_policy(&config),
        );

        let prefetch_size = config.block_size.max(config.file_prefetch_buffer_size);
        let (writer, reader, compressor): (Box<dyn DataWriter>, Box<dyn DataReader>, _) =
            if config.compression.enabled {
                let compressor = Arc::new(Compressor::new(config.compression.clone()));
                (
                    Box::new(CompressedBlockDataWriter::new(compressor.clone())),
                    Box::new(CompressedBlockDataReader::new(compressor.clone(), prefetch_size)),
                    Some(compressor),
                )
            } else {
                (
                    Box::new(BlockDataWriter::new(config.block_size)),
                    Box::new(BlockDataReader::new(config.block_size, prefetch_size)),
                    None,
                )
            };

        let spill_dir = (config.storage == StorageKind::File).then(|| dir.clone());
        let manager = SegmentManager::new(
            config.segment_size,
            config.max_segments(),
            config.popularity_ranks,
            spill_dir,
            admission.clone(),
        );
        let throughput = config
            .throughput_goal
            .map(|goal| ThroughputController::new(goal, config.throughput_tolerance));

        let inner = Arc::new(EngineInner {
            recycling: recycling_selector(config.recycling),
            scavenger: Scavenger::new(&config),
            statistics: Statistics::default(),
            buffers: ObjectPool::new(READ_BUFFER_POOL_CAPACITY, Vec::new, |buffer: &mut Vec<u8>| buffer.clear()),
            workers: Mutex::new(Workers::default()),
            config,
            dir,
            manager,
            index,
            writer,
            reader,
            compressor,
            admission,
            throughput,
        });

        if inner.config.recover && snapshot::exists(&inner.dir) {
            snapshot::load(&inner)?;
            tracing::info!(
                "[engine]: recovered {items} items in {segments} segments from {dir:?}",
                items = inner.index.len(),
                segments = inner.manager.allocated(),
                dir = inner.dir,
            );
        }

        Self::start_workers(&inner)?;

        tracing::debug!(
            "[engine]: opened {name}, segment size: {segment_size}, max segments: {max_segments}, storage: {storage:?}",
            name = inner.config.name,
            segment_size = inner.config.segment_size,
            max_segments = inner.manager.max_segments(),
            storage = inner.config.storage,
        );
        Ok(Self { inner })
    }

    fn start_workers(inner: &Arc<EngineInner>) -> Result<()> {
        let mut workers = inner.workers.lock();

        if inner.config.scavenger_threads > 0 {
            let (tx, rx) = flume::bounded(1);
            for i in 0..inner.config.scavenger_threads {
                let rx = rx.clone();
                let engine = Arc::downgrade(inner);
                let interval = inner.config.scavenger_run_interval;
                let handle = std::thread::Builder::new()
                    .name(format!("larder-scavenger-{i}"))
                    .spawn(move || scavenger_worker(engine, rx, interval))?;
                workers.handles.push(handle);
            }
            workers.wake = Some(tx);
        }

        if inner.throughput.is_some() {
            let (tx, rx) = flume::bounded(1);
            let engine = Arc::downgrade(inner);
            let interval = inner.config.throughput_check_interval;
            let handle = std::thread::Builder::new()
                .name("larder-throughput".to_string())
                .spawn(move || throughput_worker(engine, rx, interval))?;
            workers.handles.push(handle);
            workers.stop = Some(tx);
        }

        Ok(())
    }

    /// Insert or overwrite `key`.
    ///
    /// `expire` is an absolute unix time in millis, `0` for never. With `force`, admission is skipped.
    ///
    /// Returns `false` if the write was rejected: the item is already expired, does not fit a segment, was not
    /// admitted, or no segment became available within `max_wait_on_put`.
    pub fn put(&self, key: &[u8], value: &[u8], expire: u64, force: bool) -> Result<bool> {
        let inner = &self.inner;
        let now = clock::now_millis();

        if clock::is_expired(expire, now) {
            self.delete(key)?;
            return Ok(false);
        }

        let len = record_len(key.len(), value.len());
        if len > inner.writer.max_record_len(inner.config.segment_size) {
            tracing::trace!("[engine]: reject record of {len} bytes, larger than a segment");
            inner.statistics.record_rejected();
            return Ok(false);
        }

        let hash = hash_key(key);
        if !force && !inner.admission.admit(hash, len) {
            inner.statistics.record_rejected();
            return Ok(false);
        }

        let ttl = clock::ttl(expire, now);
        let rank = inner.insert_rank(ttl);

        let Some(pending) =
            inner.append_with_backoff(rank, |segment| inner.writer.append(segment, key, value, ttl))?
        else {
            tracing::warn!(
                "[engine]: no segment available within {wait:?}, reject write",
                wait = inner.config.max_wait_on_put
            );
            inner.statistics.record_rejected();
            return Ok(false);
        };

        inner.index_record(hash, key, pending.location, expire)?;
        drop(pending);

        inner.record_write(key.len() + value.len());
        Ok(true)
    }

    /// Append all records of `batch` as one block, then clear it.
    ///
    /// Records that are expired or not admitted are skipped. Writers without batch support, or batches larger than a
    /// segment, fall back to one [`Engine::put`] per record.
    ///
    /// Returns `true` if every record was written.
    pub fn write_batch(&self, batch: &mut WriteBatch) -> Result<bool> {
        let inner = &self.inner;
        if batch.is_empty() {
            return Ok(true);
        }

        if !inner.writer.supports_batch() || batch.size() > inner.writer.max_record_len(inner.config.segment_size) {
            let mut all = true;
            for (key, value, expire) in batch.iter() {
                all &= self.put(key, value, expire, false)?;
            }
            batch.clear();
            return Ok(all);
        }

        let now = clock::now_millis();
        let before = batch.len();
        batch.retain(|key, value, expire| {
            !clock::is_expired(expire, now) && inner.admission.admit(hash_key(key), record_len(key.len(), value.len()))
        });
        let skipped = before - batch.len();
        for _ in 0..skipped {
            inner.statistics.record_rejected();
        }
        if batch.is_empty() {
            batch.clear();
            return Ok(false);
        }

        // One block lands in one segment: the batch is ranked by the average TTL of its records.
        let rank = match batch.ttl_stats(now) {
            (_, 0) => inner.insert_rank(None),
            (sum, count) => inner.insert_rank(Some(sum / count)),
        };
        let records = &*batch;
        let Some(pending) =
            inner.append_with_backoff(rank, |segment| inner.writer.append_batch(segment, records, now))?
        else {
            tracing::warn!(
                "[engine]: no segment available within {wait:?}, reject batch of {len} records",
                wait = inner.config.max_wait_on_put,
                len = records.len(),
            );
            for _ in 0..records.len() {
                inner.statistics.record_rejected();
            }
            batch.clear();
            return Ok(false);
        };

        for (key, value, expire) in records.iter() {
            inner.index_record(hash_key(key), key, pending.location, expire)?;
            inner.record_write(key.len() + value.len());
        }
        drop(pending);

        batch.clear();
        Ok(skipped == 0)
    }

    fn fetch(&self, key: &[u8], start: usize, buf: &mut [u8]) -> Result<Fetch> {
        let inner = &self.inner;
        let hash = hash_key(key);
        let now = clock::now_millis();

        let mut fetch = Fetch::NotFound;
        // The key is confirmed before the expiry check: an expired candidate may belong to another key.
        let found = inner.index.lookup(hash, |info| {
            let live = !clock::is_expired(info.expire, now);
            let found = inner.read_record(info.location, key, &mut |value| {
                if live {
                    fetch = copy_value(value, start, buf);
                }
            })?;
            Ok(found.then_some(live))
        })?;

        match found {
            Some((true, info)) => {
                inner.index.promote(hash, info.location);
                inner.admission.access(hash);
                let bytes = match fetch {
                    Fetch::Found(len) => len,
                    _ => 0,
                };
                inner.statistics.record_get(Some(bytes));
                Ok(fetch)
            }
            Some((false, info)) => {
                inner.expire_entry(hash, info.location);
                inner.statistics.record_get(None);
                Ok(Fetch::NotFound)
            }
            None => {
                inner.statistics.record_get(None);
                Ok(Fetch::NotFound)
            }
        }
    }

    /// Copy the value of `key` into `buf`.
    pub fn get(&self, key: &[u8], buf: &mut [u8]) -> Result<Fetch> {
        self.fetch(key, 0, buf)
    }

    /// Copy the value of `key` from byte `start` on into `buf`.
    ///
    /// A `start` beyond the value end yields `Found(0)`.
    pub fn get_range(&self, key: &[u8], start: usize, buf: &mut [u8]) -> Result<Fetch> {
        self.fetch(key, start, buf)
    }

    /// The value of `key` in a new buffer.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let hash = hash_key(key);
        let now = clock::now_millis();

        let mut value = vec![];
        let found = inner.index.lookup(hash, |info| {
            let live = !clock::is_expired(info.expire, now);
            let found = inner.read_record(info.location, key, &mut |v| {
                if live {
                    value.extend_from_slice(v);
                }
            })?;
            Ok(found.then_some(live))
        })?;

        match found {
            Some((true, info)) => {
                inner.index.promote(hash, info.location);
                inner.admission.access(hash);
                inner.statistics.record_get(Some(value.len()));
                Ok(Some(value))
            }
            Some((false, info)) => {
                inner.expire_entry(hash, info.location);
                inner.statistics.record_get(None);
                Ok(None)
            }
            None => {
                inner.statistics.record_get(None);
                Ok(None)
            }
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let removed = inner
            .index
            .remove(hash_key(key), |location| inner.holds_key(location, key))?;
        match removed {
            Some(location) => {
                inner.mark_dead(location);
                inner.statistics.record_delete();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `key` is present and not expired. Does not count as an access.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let now = clock::now_millis();
        let found = inner.index.peek(hash_key(key), |info| {
            if clock::is_expired(info.expire, now) {
                return Ok(None);
            }
            Ok(inner.holds_key(info.location, key)?.then_some(()))
        })?;
        Ok(found.is_some())
    }

    /// Record an access to `key` without reading its value. Returns whether it is present.
    pub fn touch(&self, key: &[u8]) -> Result<bool> {
        let inner = &self.inner;
        let hash = hash_key(key);
        let now = clock::now_millis();
        let found = inner.index.lookup(hash, |info| {
            if clock::is_expired(info.expire, now) {
                return Ok(None);
            }
            Ok(inner.holds_key(info.location, key)?.then_some(()))
        })?;
        match found {
            Some((_, info)) => {
                inner.index.promote(hash, info.location);
                inner.admission.access(hash);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the expiration of `key`, returning the previous one (`0` for never), or `None` if absent.
    ///
    /// Index formats without expiration rewrite the item instead and always report `0`.
    pub fn get_and_set_expire(&self, key: &[u8], expire: u64) -> Result<Option<u64>> {
        let inner = &self.inner;
        let now = clock::now_millis();

        if !inner.index.format().has_expire() {
            let Some(value) = self.get_value(key)? else {
                return Ok(None);
            };
            self.put(key, &value, expire, true)?;
            return Ok(Some(0));
        }

        let previous = inner
            .index
            .set_expire(hash_key(key), expire, |location| inner.holds_key(location, key))?;
        match previous {
            Some(previous) if clock::is_expired(previous, now) => {
                self.delete(key)?;
                Ok(None)
            }
            Some(previous) => {
                if clock::is_expired(expire, now) {
                    self.delete(key)?;
                }
                Ok(Some(previous))
            }
            None => Ok(None),
        }
    }

    /// Run one scavenger pass on the calling thread.
    pub fn scavenge(&self) -> Result<ScavengerReport> {
        self.inner.scavenger.run(&self.inner)
    }

    /// Cumulative scavenger statistics.
    pub fn scavenger_stats(&self) -> ScavengerStats {
        self.inner.scavenger.stats()
    }

    /// Totals over the segments picked by the recycling selector.
    pub fn recycling_stats(&self) -> RecyclingStats {
        self.inner.recycling.stats()
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    /// Whether the engine holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics.
    pub fn statistics(&self) -> StatisticsSnapshot {
        let inner = &self.inner;
        let mut statistics = inner.statistics.counters();
        statistics.size = inner.index.len();
        statistics.allocated_segments = inner.manager.allocated();
        statistics.bytes_allocated = statistics.allocated_segments * inner.manager.segment_size();
        statistics.bytes_used = inner.manager.bytes_used();
        statistics.max_cache_size = inner.config.max_cache_size;
        statistics.index_memory = inner.index.memory_usage();
        statistics
    }

    /// The configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Write a snapshot under the cache directory.
    pub fn save(&self) -> Result<()> {
        let start = Instant::now();
        snapshot::save(&self.inner)?;
        tracing::info!(
            "[engine]: saved {items} items to {dir:?} in {elapsed:?}",
            items = self.inner.index.len(),
            dir = self.inner.dir,
            elapsed = start.elapsed(),
        );
        Ok(())
    }

    /// Stop background workers and, with `save_on_close`, write a snapshot.
    ///
    /// Other handles stay usable, without background scavenging.
    pub fn close(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        drop(workers.wake);
        drop(workers.stop);
        for handle in workers.handles {
            if handle.join().is_err() {
                tracing::warn!("[engine]: a background worker panicked");
            }
        }
        if self.inner.config.save_on_close {
            self.save()?;
        }
        Ok(())
    }
}

fn scavenger_worker(engine: Weak<EngineInner>, rx: flume::Receiver<()>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(engine) = engine.upgrade() else { break };
        if let Err(e) = engine.scavenger.run(&engine) {
            tracing::error!("[scavenger]: pass failed: {e}");
        }
    }
    tracing::debug!("[scavenger]: worker exits");
}

fn throughput_worker(engine: Weak<EngineInner>, rx: flume::Receiver<()>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(engine) = engine.upgrade() else { break };
        if let Some(throughput) = &engine.throughput {
            let adjusted = throughput.adjust_parameters(engine.admission.as_ref());
            tracing::debug!(
                "[throughput]: current {current} B/s, goal {goal} B/s, adjusted: {adjusted}",
                current = throughput.current_throughput(),
                goal = throughput.throughput_goal(),
            );
        }
    }
    tracing::debug!("[throughput]: worker exits");
}
