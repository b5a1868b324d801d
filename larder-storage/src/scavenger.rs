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

//! Background compaction.
//!
//! A pass first compacts sealed segments whose share of alive records fell below the threshold. Then, if the cache
//! is close to full, it keeps reclaiming segments chosen by the [`RecyclingSelector`] until occupancy drops below
//! the stop ratio. Under that pressure, unpopular records that were never hit are dropped instead of relocated.
//!
//! [`RecyclingSelector`]: crate::recycling::RecyclingSelector

use std::{
    io::{Read, Write},
    ops::AddAssign,
    sync::Arc,
};

use larder_common::{clock, hasher::hash_key};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::EngineConfig,
    engine::EngineInner,
    error::Result,
    index::{EntryInfo, Location},
    io::SegmentScanner,
    segment::{Segment, SegmentState},
};

/// Outcome of one or more scavenger passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengerReport {
    /// Segments returned to the free pool.
    pub segments_reclaimed: u64,
    /// Records moved to another segment.
    pub relocated: u64,
    /// Unpopular records dropped under pressure.
    pub dumped: u64,
    /// Expired records removed.
    pub expired: u64,
    /// Records dropped because no segment had room for them.
    pub dropped: u64,
    /// Records that were no longer referenced by the index.
    pub dead: u64,
}

impl AddAssign for ScavengerReport {
    fn add_assign(&mut self, rhs: Self) {
        self.segments_reclaimed += rhs.segments_reclaimed;
        self.relocated += rhs.relocated;
        self.dumped += rhs.dumped;
        self.expired += rhs.expired;
        self.dropped += rhs.dropped;
        self.dead += rhs.dead;
    }
}

/// Cumulative scavenger statistics, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScavengerStats {
    /// Completed passes.
    pub passes: u64,
    /// Totals over all passes.
    pub total: ScavengerReport,
    /// Current popularity threshold below which unhit records are dumped under pressure.
    pub dump_below: f64,
}

/// Claimed segment. Goes back to the sealed state on drop unless it was released.
struct ReclaimingSegment {
    segment: Arc<Segment>,
    released: bool,
}

impl Drop for ReclaimingSegment {
    fn drop(&mut self) {
        if !self.released {
            self.segment.unclaim();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Scavenger {
    alive_ratio_threshold: f64,
    start_ratio: f64,
    stop_ratio: f64,
    dump_min: f64,
    dump_max: f64,
    dump_step: f64,
    stats: Mutex<ScavengerStats>,
}

impl Scavenger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            alive_ratio_threshold: config.scavenger_alive_ratio_threshold,
            start_ratio: config.scavenger_start_ratio,
            stop_ratio: config.scavenger_stop_ratio,
            dump_min: config.scavenger_dump_entry_below_min,
            dump_max: config.scavenger_dump_entry_below_max,
            dump_step: config.scavenger_dump_entry_below_step,
            stats: Mutex::new(ScavengerStats {
                dump_below: config.scavenger_dump_entry_below_min,
                ..Default::default()
            }),
        }
    }

    pub fn stats(&self) -> ScavengerStats {
        self.stats.lock().clone()
    }

    /// Run one pass on the calling thread.
    pub fn run(&self, engine: &EngineInner) -> Result<ScavengerReport> {
        let mut report = ScavengerReport::default();

        let compactable = engine
            .manager
            .infos(SegmentState::Sealed)
            .into_iter()
            .filter(|info| info.alive_ratio() < self.alive_ratio_threshold)
            .map(|info| info.id)
            .collect::<Vec<_>>();
        for id in compactable {
            if let Some(segment) = engine.manager.segment(id) {
                self.reclaim(engine, segment, None, &mut report)?;
            }
        }

        if engine.manager.occupancy() >= self.start_ratio {
            let dump_below = self.stats.lock().dump_below;
            let mut attempts = engine.manager.max_segments();
            while engine.manager.occupancy() >= self.stop_ratio && attempts > 0 {
                attempts -= 1;
                let candidates = engine.manager.infos(SegmentState::Sealed);
                let Some(id) = engine.recycling.select(&candidates) else {
                    break;
                };
                let Some(segment) = engine.manager.segment(id) else {
                    break;
                };
                self.reclaim(engine, segment, Some(dump_below), &mut report)?;
            }

            let relieved = engine.manager.occupancy() < self.stop_ratio;
            let mut stats = self.stats.lock();
            stats.dump_below = if relieved {
                self.dump_min
            } else {
                f64::min(stats.dump_below + self.dump_step, self.dump_max)
            };
            tracing::debug!(
                "[scavenger]: pressure pass relieved: {relieved}, dump below: {dump_below:.2}",
                dump_below = stats.dump_below
            );
        }

        let mut stats = self.stats.lock();
        stats.passes += 1;
        stats.total += report;
        drop(stats);

        if report.segments_reclaimed > 0 {
            tracing::debug!("[scavenger]: pass finished: {report:?}");
        }
        Ok(report)
    }

    /// Reclaim one sealed segment. Returns `false` if it could not be claimed.
    fn reclaim(
        &self,
        engine: &EngineInner,
        segment: Arc<Segment>,
        dump_below: Option<f64>,
        report: &mut ScavengerReport,
    ) -> Result<bool> {
        if !segment.try_claim() {
            return Ok(false);
        }
        let mut claimed = ReclaimingSegment {
            segment,
            released: false,
        };
        let segment = &claimed.segment;

        // Appends that raced with sealing may still be indexing their records.
        while segment.pending_writers() > 0 {
            std::thread::yield_now();
        }

        let id = segment.id();
        let now = clock::now_millis();
        let mut local = ScavengerReport::default();
        let mut intact = true;

        {
            let body = segment.read();
            let mut scanner = SegmentScanner::new(engine.reader.as_ref(), &body);
            loop {
                let block = match scanner.next_block() {
                    Ok(Some(block)) => block,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[scavenger]: stop scanning segment {id}, subsequent records are dropped: {e}");
                        intact = false;
                        break;
                    }
                };
                let location = Location::new(id, block.offset as u32);
                for (key, value) in block.latest_records() {
                    let hash = hash_key(key);
                    let Some(info) = engine.index.probe(hash, location) else {
                        local.dead += 1;
                        continue;
                    };
                    self.reclaim_record(engine, hash, key, value, &info, now, dump_below, &mut local)?;
                }
            }
        }

        if !intact {
            let removed = engine.index.remove_segment(id);
            engine.statistics.record_evicted(removed as u64);
            local.dropped += removed as u64;
        }

        engine.manager.release(segment)?;
        claimed.released = true;
        local.segments_reclaimed += 1;

        tracing::debug!(
            "[scavenger]: reclaimed segment {id}, relocated: {relocated}, dumped: {dumped}, expired: {expired}, dropped: {dropped}, dead: {dead}",
            relocated = local.relocated,
            dumped = local.dumped,
            expired = local.expired,
            dropped = local.dropped,
            dead = local.dead,
        );
        *report += local;
        Ok(true)
    }

    #[expect(clippy::too_many_arguments)]
    fn reclaim_record(
        &self,
        engine: &EngineInner,
        hash: u64,
        key: &[u8],
        value: &[u8],
        info: &EntryInfo,
        now: u64,
        dump_below: Option<f64>,
        report: &mut ScavengerReport,
    ) -> Result<()> {
        let location = info.location;

        if clock::is_expired(info.expire, now) {
            if engine.index.remove_if(hash, location) {
                engine.statistics.record_expired(1);
                report.expired += 1;
            }
            return Ok(());
        }

        if let Some(dump_below) = dump_below {
            let ranks = engine.index.policy().ranks();
            let popularity = (ranks - info.rank.min(ranks - 1)) as f64 / ranks as f64;
            if !info.hit && popularity < dump_below {
                if engine.index.remove_if(hash, location) {
                    engine.statistics.record_evicted(1);
                    report.dumped += 1;
                }
                return Ok(());
            }
        }

        let ttl = clock::ttl(info.expire, now);
        match engine.relocate(info.rank, key, value, ttl)? {
            Some(pending) => {
                if engine.index.compare_and_update(hash, location, pending.location) {
                    report.relocated += 1;
                } else {
                    // Overwritten or deleted meanwhile.
                    pending.segment.mark_dead();
                    report.dead += 1;
                }
            }
            None => {
                if engine.index.remove_if(hash, location) {
                    engine.statistics.record_evicted(1);
                    report.dropped += 1;
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(writer, &*self.stats.lock())?;
        Ok(())
    }

    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let stats: ScavengerStats = bincode::deserialize_from(reader)?;
        *self.stats.lock() = stats;
        Ok(())
    }
}
