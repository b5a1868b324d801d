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

//! Admission control: which items enter the cache and at which rank.

mod queue;
mod random;

use std::{
    fmt::Debug,
    io::{Read, Write},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use self::{
    queue::{AdmissionQueue, QueueAdmissionController},
    random::RandomAdmissionController,
};
use crate::{
    config::{AdmissionKind, EngineConfig},
    error::Result,
};

/// Decides whether a new item is written and tunes the popularity rank of expiring items.
///
/// Ranks are 0-based, `0` being the most popular.
pub trait AdmissionController: Send + Sync + Debug + 'static {
    /// Whether an item with the given key hash and size is admitted.
    fn admit(&self, hash: u64, size: usize) -> bool;

    /// Notify an access to an existing item.
    #[expect(unused_variables)]
    fn access(&self, hash: u64) {}

    /// Adjust the insert rank of an item with a relative time to live of `ttl` millis.
    fn adjust_rank(&self, rank: usize, ttl: u64) -> usize;

    /// Account a sealed segment of `rank` whose items live `ttl` millis on average.
    fn register_segment_ttl(&self, rank: usize, ttl: u64);

    /// Forget a segment accounted with [`AdmissionController::register_segment_ttl`].
    fn unregister_segment_ttl(&self, rank: usize, ttl: u64);

    /// Admit less. Returns `false` if the controller is already at its bound.
    fn decrease_throughput(&self) -> bool {
        false
    }

    /// Admit more. Returns `false` if the controller is already at its bound.
    fn increase_throughput(&self) -> bool {
        false
    }

    /// The admission queue, for controllers built on one.
    fn queue(&self) -> Option<&AdmissionQueue> {
        None
    }

    /// Write the controller state.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Restore the controller state written by [`AdmissionController::save`].
    fn load(&self, reader: &mut dyn Read) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RankTtlTable {
    counts: Vec<u64>,
    cum_ttl: Vec<u64>,
}

/// Per-rank count and cumulative time to live of sealed segments.
#[derive(Debug)]
pub struct RankTtl {
    table: Mutex<RankTtlTable>,
}

impl RankTtl {
    /// Create an empty table of `ranks` ranks.
    pub fn new(ranks: usize) -> Self {
        Self {
            table: Mutex::new(RankTtlTable {
                counts: vec![0; ranks],
                cum_ttl: vec![0; ranks],
            }),
        }
    }

    /// Average time to live of the segments of `rank`, `0` if there are none.
    pub fn avg(&self, rank: usize) -> u64 {
        let table = self.table.lock();
        Self::avg_locked(&table, rank)
    }

    fn avg_locked(table: &RankTtlTable, rank: usize) -> u64 {
        match table.counts.get(rank).copied().unwrap_or_default() {
            0 => 0,
            count => table.cum_ttl[rank] / count,
        }
    }

    /// Starting at `rank`, walk toward less popular ranks while their average time to live stays above `ttl`, and
    /// return the rank whose average is the closest one above it.
    ///
    /// Items expiring sooner than everything in their rank move to ranks that hold shorter-lived items, so segments
    /// tend to expire as a whole.
    pub fn adjust_rank(&self, rank: usize, ttl: u64) -> usize {
        let table = self.table.lock();
        let ranks = table.counts.len();
        if rank >= ranks {
            return rank;
        }
        let mut best = rank;
        let mut min_positive = match Self::avg_locked(&table, rank).checked_sub(ttl) {
            None | Some(0) => return rank,
            Some(diff) => diff,
        };
        for i in rank + 1..ranks {
            match Self::avg_locked(&table, i).checked_sub(ttl) {
                None | Some(0) => return best,
                Some(diff) if diff < min_positive => {
                    min_positive = diff;
                    best = i;
                }
                Some(_) => {}
            }
        }
        best
    }

    /// Account a segment.
    pub fn register(&self, rank: usize, ttl: u64) {
        let mut table = self.table.lock();
        if rank < table.counts.len() {
            table.counts[rank] += 1;
            table.cum_ttl[rank] += ttl;
        }
    }

    /// Forget a segment.
    pub fn unregister(&self, rank: usize, ttl: u64) {
        let mut table = self.table.lock();
        if rank < table.counts.len() && table.counts[rank] > 0 {
            table.counts[rank] -= 1;
            table.cum_ttl[rank] = table.cum_ttl[rank].saturating_sub(ttl);
        }
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(writer, &*self.table.lock())?;
        Ok(())
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let table: RankTtlTable = bincode::deserialize_from(reader)?;
        *self.table.lock() = table;
        Ok(())
    }
}

/// Admits everything and adjusts ranks by time to live.
#[derive(Debug)]
pub struct BaseAdmissionController {
    ttl: RankTtl,
}

impl BaseAdmissionController {
    /// Create a controller for `ranks` popularity ranks.
    pub fn new(ranks: usize) -> Self {
        Self { ttl: RankTtl::new(ranks) }
    }
}

impl AdmissionController for BaseAdmissionController {
    fn admit(&self, _: u64, _: usize) -> bool {
        true
    }

    fn adjust_rank(&self, rank: usize, ttl: u64) -> usize {
        self.ttl.adjust_rank(rank, ttl)
    }

    fn register_segment_ttl(&self, rank: usize, ttl: u64) {
        self.ttl.register(rank, ttl)
    }

    fn unregister_segment_ttl(&self, rank: usize, ttl: u64) {
        self.ttl.unregister(rank, ttl)
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.ttl.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.ttl.load(reader)
    }
}

/// A bounded value stepped between `lower` and `upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct Stepper {
    pub current: f64,
    pub lower: f64,
    pub upper: f64,
    pub step: f64,
}

impl Stepper {
    const EPSILON: f64 = 1e-9;

    pub fn new(current: f64, lower: f64, upper: f64, steps: usize) -> Self {
        let step = (upper - lower) / steps.max(1) as f64;
        Self {
            current: current.clamp(lower, upper),
            lower,
            upper,
            step,
        }
    }

    pub fn down(&mut self) -> bool {
        if self.current - self.step < self.lower - Self::EPSILON {
            return false;
        }
        let next = self.current - self.step;
        self.current = if next < self.lower + Self::EPSILON { self.lower } else { next };
        true
    }

    pub fn up(&mut self) -> bool {
        if self.current + self.step > self.upper + Self::EPSILON {
            return false;
        }
        let next = self.current + self.step;
        self.current = if next > self.upper - Self::EPSILON { self.upper } else { next };
        true
    }
}

/// Build the configured controller.
pub fn admission_controller(config: &EngineConfig) -> Box<dyn AdmissionController> {
    let ranks = config.popularity_ranks;
    match config.admission {
        AdmissionKind::Base => Box::new(BaseAdmissionController::new(ranks)),
        AdmissionKind::AdmissionQueue => Box::new(QueueAdmissionController::new(config, false)),
        AdmissionKind::ExpirationAware => Box::new(QueueAdmissionController::new(config, true)),
        AdmissionKind::Random => Box::new(RandomAdmissionController::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_rank() {
        let ttl = RankTtl::new(4);
        // Empty ranks keep the requested rank.
        assert_eq!(ttl.adjust_rank(0, 1_000), 0);

        ttl.register(0, 100_000);
        ttl.register(1, 50_000);
        ttl.register(1, 30_000);
        ttl.register(2, 10_000);
        ttl.register(3, 1_000);
        assert_eq!(ttl.avg(1), 40_000);

        // Longer lived than the rank: stays.
        assert_eq!(ttl.adjust_rank(0, 200_000), 0);
        // Closest average above the ttl.
        assert_eq!(ttl.adjust_rank(0, 20_000), 1);
        assert_eq!(ttl.adjust_rank(0, 5_000), 2);
        assert_eq!(ttl.adjust_rank(0, 500), 3);
        assert_eq!(ttl.adjust_rank(1, 5_000), 2);

        ttl.unregister(1, 50_000);
        assert_eq!(ttl.avg(1), 30_000);
        ttl.unregister(1, 30_000);
        assert_eq!(ttl.avg(1), 0);
        // An empty rank stops the walk.
        assert_eq!(ttl.adjust_rank(0, 5_000), 0);
    }

    #[test]
    fn test_stepper_bounds() {
        let mut s = Stepper::new(1.0, 0.0, 1.0, 10);
        assert!(!s.up());
        let mut downs = 0;
        while s.down() {
            downs += 1;
            assert!(s.current >= s.lower);
        }
        assert_eq!(downs, 10);
        assert_eq!(s.current, 0.0);
        let mut ups = 0;
        while s.up() {
            ups += 1;
            assert!(s.current <= s.upper);
        }
        assert_eq!(ups, 10);
        assert_eq!(s.current, 1.0);
    }

    #[test]
    fn test_base_save_load() {
        let base = BaseAdmissionController::new(4);
        assert!(base.admit(1, 1 << 20));
        base.register_segment_ttl(2, 3_000);
        base.register_segment_ttl(2, 5_000);

        let mut buf = vec![];
        base.save(&mut buf).unwrap();
        let loaded = BaseAdmissionController::new(4);
        loaded.load(&mut &buf[..]).unwrap();
        assert_eq!(loaded.ttl.avg(2), 4_000);
    }
}
