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

//! Engine statistics.
//!
//! Counters are updated on the hot path with relaxed atomics. They are used both for reporting and by internal
//! components (the throughput controller and the scavenger) to sense the system status.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Running counters of an engine instance.
#[derive(Debug, Default)]
pub struct Statistics {
    pub(crate) gets: AtomicU64,
    pub(crate) gets_bytes: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) puts: AtomicU64,
    pub(crate) puts_bytes: AtomicU64,
    pub(crate) rejected_writes: AtomicU64,
    pub(crate) deletes: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) collisions: AtomicU64,
}

impl Statistics {
    pub(crate) fn record_get(&self, hit_bytes: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(bytes) = hit_bytes {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.gets_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_put(&self, bytes: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.puts_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, n: u64) {
        self.expired.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self, n: u64) {
        self.evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters. Size and space fields are left for the caller to fill.
    pub(crate) fn counters(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            gets_bytes: self.gets_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            puts_bytes: self.puts_bytes.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

/// A point-in-time copy of the engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Live items in the index.
    pub size: usize,
    /// Total get calls.
    pub gets: u64,
    /// Value bytes returned by hits.
    pub gets_bytes: u64,
    /// Get calls that found the key.
    pub hits: u64,
    /// Successful writes.
    pub puts: u64,
    /// Key + value bytes written by successful writes.
    pub puts_bytes: u64,
    /// Writes rejected by admission or backpressure.
    pub rejected_writes: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Items removed because they expired.
    pub expired: u64,
    /// Items removed to make room.
    pub evicted: u64,
    /// Index candidates whose key turned out to differ.
    pub collisions: u64,
    /// Segments currently allocated.
    pub allocated_segments: usize,
    /// Bytes allocated for segments.
    pub bytes_allocated: usize,
    /// Bytes written into allocated segments.
    pub bytes_used: usize,
    /// Maximum bytes that may be allocated.
    pub max_cache_size: usize,
    /// Bytes held by index entries, including empty slots.
    pub index_memory: usize,
}

impl StatisticsSnapshot {
    /// Hits over gets, `0.0` before the first get.
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            self.hits as f64 / self.gets as f64
        }
    }

    /// Allocated bytes over the maximum cache size.
    pub fn allocated_ratio(&self) -> f64 {
        if self.max_cache_size == 0 {
            0.0
        } else {
            self.bytes_allocated as f64 / self.max_cache_size as f64
        }
    }
}
