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
    io::{Read, Write},
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{AdmissionController, RankTtl, Stepper};
use crate::{config::EngineConfig, error::Result};

#[derive(Debug, Default)]
struct QueueInner {
    /// Key hash to the sequence of its live entry in `fifo`.
    members: HashMap<u64, u64>,
    /// Insertion order. Entries whose sequence no longer matches `members` are stale.
    fifo: VecDeque<(u64, u64)>,
    sequence: u64,
    capacity: usize,
}

impl QueueInner {
    fn evict_overflow(&mut self) {
        while self.members.len() > self.capacity {
            let Some((hash, seq)) = self.fifo.pop_front() else {
                break;
            };
            if self.members.get(&hash) == Some(&seq) {
                self.members.remove(&hash);
            }
        }
        if self.fifo.len() > 2 * self.members.len() + 64 {
            let members = &self.members;
            self.fifo.retain(|(hash, seq)| members.get(hash) == Some(seq));
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    ratio: f64,
    hashes: Vec<u64>,
}

/// A bounded FIFO set of key hashes that were written once.
///
/// A key is admitted into the cache the second time it is written while still in the queue.
#[derive(Debug)]
pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
    ratio: Mutex<f64>,
    estimated_capacity: usize,
}

impl AdmissionQueue {
    /// Create a queue holding `ratio * estimated_capacity` hashes.
    pub fn new(estimated_capacity: usize, ratio: f64) -> Self {
        let queue = Self {
            inner: Mutex::new(QueueInner::default()),
            ratio: Mutex::new(ratio),
            estimated_capacity,
        };
        queue.set_ratio(ratio);
        queue
    }

    /// Add `hash` if absent and return `false`, or remove it if present and return `true`.
    pub fn add_if_absent_remove_if_present(&self, hash: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.members.remove(&hash).is_some() {
            return true;
        }
        inner.sequence += 1;
        let seq = inner.sequence;
        inner.members.insert(hash, seq);
        inner.fifo.push_back((hash, seq));
        inner.evict_overflow();
        false
    }

    /// Whether `hash` is in the queue.
    pub fn contains(&self, hash: u64) -> bool {
        self.inner.lock().members.contains_key(&hash)
    }

    /// Number of hashes in the queue.
    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of hashes.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Current size ratio.
    pub fn ratio(&self) -> f64 {
        *self.ratio.lock()
    }

    /// Resize the queue to `ratio * estimated_capacity`, dropping the oldest hashes on shrink.
    pub fn set_ratio(&self, ratio: f64) {
        *self.ratio.lock() = ratio;
        let mut inner = self.inner.lock();
        inner.capacity = ((self.estimated_capacity as f64 * ratio) as usize).max(1);
        inner.evict_overflow();
    }

    /// Write the queue in insertion order.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let snapshot = {
            let inner = self.inner.lock();
            let hashes = inner
                .fifo
                .iter()
                .filter(|(hash, seq)| inner.members.get(hash) == Some(seq))
                .map(|(hash, _)| *hash)
                .collect();
            QueueSnapshot {
                ratio: self.ratio(),
                hashes,
            }
        };
        bincode::serialize_into(writer, &snapshot)?;
        Ok(())
    }

    /// Replace the queue with one written by [`AdmissionQueue::save`].
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let snapshot: QueueSnapshot = bincode::deserialize_from(reader)?;
        {
            let mut inner = self.inner.lock();
            *inner = QueueInner::default();
            for hash in snapshot.hashes {
                inner.sequence += 1;
                let seq = inner.sequence;
                inner.members.insert(hash, seq);
                inner.fifo.push_back((hash, seq));
            }
        }
        self.set_ratio(snapshot.ratio);
        Ok(())
    }
}

/// Admission through an [`AdmissionQueue`], optionally adjusting ranks by time to live.
///
/// The throughput controller steers the queue size: a smaller queue forgets first writes sooner and admits less.
#[derive(Debug)]
pub struct QueueAdmissionController {
    queue: AdmissionQueue,
    ratio: Mutex<Stepper>,
    ttl: Option<RankTtl>,
}

impl QueueAdmissionController {
    /// Create a controller from the engine config. `expiration_aware` enables rank adjustment.
    pub fn new(config: &EngineConfig, expiration_aware: bool) -> Self {
        let ratio = Stepper::new(
            config.admission_queue_start_ratio,
            config.admission_queue_min_ratio,
            config.admission_queue_max_ratio,
            config.throughput_adjustment_steps,
        );
        Self {
            queue: AdmissionQueue::new(config.estimated_capacity(), ratio.current),
            ratio: Mutex::new(ratio),
            ttl: expiration_aware.then(|| RankTtl::new(config.popularity_ranks)),
        }
    }

    fn step(&self, f: impl FnOnce(&mut Stepper) -> bool) -> bool {
        let mut ratio = self.ratio.lock();
        if !f(&mut ratio) {
            return false;
        }
        self.queue.set_ratio(ratio.current);
        tracing::debug!("[admission queue]: size ratio adjusted to {ratio:.3}", ratio = ratio.current);
        true
    }
}

impl AdmissionController for QueueAdmissionController {
    fn admit(&self, hash: u64, _: usize) -> bool {
        self.queue.add_if_absent_remove_if_present(hash)
    }

    fn adjust_rank(&self, rank: usize, ttl: u64) -> usize {
        match &self.ttl {
            Some(table) => table.adjust_rank(rank, ttl),
            None => rank,
        }
    }

    fn register_segment_ttl(&self, rank: usize, ttl: u64) {
        if let Some(table) = &self.ttl {
            table.register(rank, ttl);
        }
    }

    fn unregister_segment_ttl(&self, rank: usize, ttl: u64) {
        if let Some(table) = &self.ttl {
            table.unregister(rank, ttl);
        }
    }

    fn decrease_throughput(&self) -> bool {
        self.step(Stepper::down)
    }

    fn increase_throughput(&self) -> bool {
        self.step(Stepper::up)
    }

    fn queue(&self) -> Option<&AdmissionQueue> {
        Some(&self.queue)
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(&mut *writer, &*self.ratio.lock())?;
        match &self.ttl {
            Some(table) => table.save(writer),
            None => Ok(()),
        }
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let ratio: Stepper = bincode::deserialize_from(&mut *reader)?;
        *self.ratio.lock() = ratio;
        if let Some(table) = &self.ttl {
            table.load(reader)?;
        }
        Ok(())
    }
}
