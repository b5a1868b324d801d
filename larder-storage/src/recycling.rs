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
    io::{Read, Write},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::RecyclingKind,
    error::Result,
    segment::{SegmentId, SegmentInfo},
};

/// Picks the next sealed segment to reclaim under space pressure.
pub trait RecyclingSelector: Send + Sync + Debug + 'static {
    /// Pick one of `candidates`, or `None` if there is nothing to pick.
    fn select(&self, candidates: &[SegmentInfo]) -> Option<SegmentId>;

    /// Totals over the segments picked so far.
    fn stats(&self) -> RecyclingStats;

    /// Write the selector state.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Restore the selector state.
    fn load(&self, reader: &mut dyn Read) -> Result<()>;
}

/// Totals over the segments a selector picked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecyclingStats {
    /// Segments picked.
    pub picks: u64,
    /// Items written to the picked segments.
    pub total_items: u64,
    /// Items still alive in the picked segments when they were picked.
    pub alive_items: u64,
}

impl RecyclingStats {
    /// Average alive ratio of picked segments. Lower means less relocation work per reclaimed segment.
    pub fn alive_ratio(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.alive_items as f64 / self.total_items as f64
        }
    }
}

#[derive(Debug, Default)]
struct Tally(Mutex<RecyclingStats>);

impl Tally {
    fn record(&self, picked: Option<&SegmentInfo>) -> Option<SegmentId> {
        let info = picked?;
        let mut stats = self.0.lock();
        stats.picks += 1;
        stats.total_items += info.total_items as u64;
        stats.alive_items += info.alive_items as u64;
        Some(info.id)
    }

    fn stats(&self) -> RecyclingStats {
        *self.0.lock()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(writer, &self.stats())?;
        Ok(())
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        *self.0.lock() = bincode::deserialize_from(reader)?;
        Ok(())
    }
}

/// Picks the segment with the lowest ratio of alive records.
#[derive(Debug, Default)]
pub struct MinAliveSelector {
    tally: Tally,
}

impl RecyclingSelector for MinAliveSelector {
    fn select(&self, candidates: &[SegmentInfo]) -> Option<SegmentId> {
        let picked = candidates
            .iter()
            .min_by(|a, b| a.alive_ratio().total_cmp(&b.alive_ratio()).then(a.created.cmp(&b.created)));
        tracing::trace!("[min alive selector]: pick {:?}", picked.map(|info| info.id));
        self.tally.record(picked)
    }

    fn stats(&self) -> RecyclingStats {
        self.tally.stats()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.tally.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.tally.load(reader)
    }
}

/// Least recently created: picks the oldest segment.
#[derive(Debug, Default)]
pub struct LrcSelector {
    tally: Tally,
}

impl RecyclingSelector for LrcSelector {
    fn select(&self, candidates: &[SegmentInfo]) -> Option<SegmentId> {
        let picked = candidates.iter().min_by_key(|info| (info.created, info.id));
        tracing::trace!("[lrc selector]: pick {:?}", picked.map(|info| info.id));
        self.tally.record(picked)
    }

    fn stats(&self) -> RecyclingStats {
        self.tally.stats()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.tally.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        self.tally.load(reader)
    }
}

/// Build the configured selector.
pub fn recycling_selector(kind: RecyclingKind) -> Box<dyn RecyclingSelector> {
    match kind {
        RecyclingKind::MinAlive => Box::<MinAliveSelector>::default(),
        RecyclingKind::Lrc => Box::<LrcSelector>::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: SegmentId, created: u64, total: u32, alive: u32) -> SegmentInfo {
        SegmentInfo {
            id,
            rank: 0,
            created,
            total_items: total,
            alive_items: alive,
            used: 0,
        }
    }

    #[test]
    fn test_min_alive() {
        let selector = MinAliveSelector::default();
        let candidates = [info(0, 10, 100, 90), info(1, 20, 100, 10), info(2, 5, 100, 50)];
        assert_eq!(selector.select(&candidates), Some(1));
        assert_eq!(selector.select(&[]), None);
        // Ties go to the older segment.
        let candidates = [info(4, 20, 10, 5), info(5, 10, 10, 5)];
        assert_eq!(selector.select(&candidates), Some(5));
        assert_eq!(
            selector.stats(),
            RecyclingStats {
                picks: 2,
                total_items: 110,
                alive_items: 15,
            }
        );
    }

    #[test]
    fn test_lrc() {
        let selector = LrcSelector::default();
        let candidates = [info(0, 10, 100, 90), info(1, 20, 100, 10), info(2, 5, 100, 50)];
        assert_eq!(selector.select(&candidates), Some(2));
        assert_eq!(selector.select(&[]), None);
        assert_eq!(selector.stats().picks, 1);
        assert_eq!(selector.stats().alive_ratio(), 0.5);
    }

    #[test]
    fn test_save_load() {
        let selector = recycling_selector(RecyclingKind::MinAlive);
        selector.select(&[info(0, 10, 8, 2)]);
        let mut buf = vec![];
        selector.save(&mut buf).unwrap();
        assert!(!buf.is_empty());

        let restored = recycling_selector(RecyclingKind::MinAlive);
        restored.load(&mut &buf[..]).unwrap();
        assert_eq!(restored.stats(), selector.stats());
        assert_eq!(restored.stats().alive_ratio(), 0.25);
    }
}
