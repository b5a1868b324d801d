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

//! Eviction policies.
//!
//! An index bucket keeps its entries in a logical list ordered from most to least valuable. A policy decides where
//! a new entry enters that list, where a hit entry moves to, and which entry leaves when the bucket overflows. The
//! list is divided into popularity ranks of equal share; the rank of an entry is also the rank of the segment the
//! scavenger relocates it to.

use std::fmt::Debug;

use crate::config::{EngineConfig, EvictionKind};

/// Rank of position `index` in a list of `total` entries divided into `ranks` ranks.
pub fn rank_for_index(ranks: usize, index: usize, total: usize) -> usize {
    if total == 0 {
        return 0;
    }
    usize::min(index * ranks / total, ranks - 1)
}

/// First position of `rank` in a list of `total` entries divided into `ranks` ranks.
pub fn start_index_for_rank(ranks: usize, rank: usize, total: usize) -> usize {
    rank * total / ranks
}

/// Placement rules of entries within an index bucket.
pub trait EvictionPolicy: Send + Sync + Debug + 'static {
    /// Position of a new entry in a list that currently holds `total` entries.
    fn insert_index(&self, total: usize) -> usize;

    /// New position of the entry at `index` after a hit.
    fn promotion_index(&self, index: usize, total: usize) -> usize;

    /// Position of the entry to evict from a list of `total` entries.
    fn eviction_candidate_index(&self, total: usize) -> usize {
        total - 1
    }

    /// Number of popularity ranks.
    fn ranks(&self) -> usize;

    /// Rank new items are written to.
    fn insert_rank(&self) -> usize {
        // Measured on a large virtual list so that integer rounding does not pull the rank up.
        const VIRTUAL: usize = 1 << 20;
        rank_for_index(self.ranks(), self.insert_index(VIRTUAL), VIRTUAL)
    }
}

/// Insertion order only: new entries enter at the head, hits do not move entries.
#[derive(Debug)]
pub struct FifoEvictionPolicy {
    ranks: usize,
}

impl FifoEvictionPolicy {
    /// Create a FIFO policy reporting `ranks` popularity ranks.
    pub fn new(ranks: usize) -> Self {
        Self { ranks }
    }
}

impl EvictionPolicy for FifoEvictionPolicy {
    fn insert_index(&self, _: usize) -> usize {
        0
    }

    fn promotion_index(&self, index: usize, _: usize) -> usize {
        index
    }

    fn ranks(&self) -> usize {
        self.ranks
    }
}

/// Least recently used: new entries and hits go to the head.
#[derive(Debug)]
pub struct LruEvictionPolicy {
    ranks: usize,
}

impl LruEvictionPolicy {
    /// Create an LRU policy reporting `ranks` popularity ranks.
    pub fn new(ranks: usize) -> Self {
        Self { ranks }
    }
}

impl EvictionPolicy for LruEvictionPolicy {
    fn insert_index(&self, _: usize) -> usize {
        0
    }

    fn promotion_index(&self, _: usize, _: usize) -> usize {
        0
    }

    fn ranks(&self) -> usize {
        self.ranks
    }
}

/// Segmented LRU.
///
/// New entries enter at the start of the insertion rank rather than the head, so one-hit wonders never displace
/// entries that were hit. A hit moves an entry to the start of the rank above its current one.
#[derive(Debug)]
pub struct SlruEvictionPolicy {
    ranks: usize,
    insert_point: usize,
}

impl SlruEvictionPolicy {
    /// Create an SLRU policy with `ranks` ranks and a 1-based insertion point.
    pub fn new(ranks: usize, insert_point: usize) -> Self {
        assert!(ranks > 0, "ranks must be positive");
        assert!(
            (1..=ranks).contains(&insert_point),
            "insert point {insert_point} must be in [1, {ranks}]"
        );
        Self { ranks, insert_point }
    }
}

impl EvictionPolicy for SlruEvictionPolicy {
    fn insert_index(&self, total: usize) -> usize {
        start_index_for_rank(self.ranks, self.insert_point - 1, total)
    }

    fn promotion_index(&self, index: usize, total: usize) -> usize {
        match rank_for_index(self.ranks, index, total) {
            0 => 0,
            rank => start_index_for_rank(self.ranks, rank - 1, total),
        }
    }

    fn ranks(&self) -> usize {
        self.ranks
    }
}

/// Build the configured policy.
pub fn eviction_policy(config: &EngineConfig) -> Box<dyn EvictionPolicy> {
    match config.eviction {
        EvictionKind::Fifo => Box::new(FifoEvictionPolicy::new(config.popularity_ranks)),
        EvictionKind::Lru => Box::new(LruEvictionPolicy::new(config.popularity_ranks)),
        EvictionKind::Slru => Box::new(SlruEvictionPolicy::new(
            config.popularity_ranks,
            config.slru_insert_point,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bounded list driven by a policy, the way an index bucket is.
    struct List<P: EvictionPolicy> {
        policy: P,
        items: Vec<u32>,
        capacity: usize,
    }

    impl<P: EvictionPolicy> List<P> {
        fn insert(&mut self, item: u32) -> Option<u32> {
            let evicted = if self.items.len() == self.capacity {
                let victim = self.policy.eviction_candidate_index(self.items.len());
                Some(self.items.remove(victim))
            } else {
                None
            };
            let index = self.policy.insert_index(self.items.len());
            self.items.insert(index, item);
            evicted
        }

        fn hit(&mut self, item: u32) {
            let index = self.items.iter().position(|i| *i == item).unwrap();
            let to = self.policy.promotion_index(index, self.items.len());
            let item = self.items.remove(index);
            self.items.insert(to, item);
        }

        fn position(&self, item: u32) -> Option<usize> {
            self.items.iter().position(|i| *i == item)
        }
    }

    #[test]
    fn test_rank_math() {
        assert_eq!(rank_for_index(8, 0, 32), 0);
        assert_eq!(rank_for_index(8, 3, 32), 0);
        assert_eq!(rank_for_index(8, 4, 32), 1);
        assert_eq!(rank_for_index(8, 31, 32), 7);
        assert_eq!(rank_for_index(8, 0, 0), 0);
        assert_eq!(start_index_for_rank(8, 4, 32), 16);
        assert_eq!(start_index_for_rank(8, 4, 0), 0);
        for total in 1..40 {
            for rank in 0..8 {
                let start = start_index_for_rank(8, rank, total);
                assert!(start <= total);
                if start < total {
                    assert!(rank_for_index(8, start, total) <= rank);
                }
            }
        }
    }

    #[test]
    fn test_insert_ranks() {
        assert_eq!(FifoEvictionPolicy::new(8).insert_rank(), 0);
        assert_eq!(LruEvictionPolicy::new(8).insert_rank(), 0);
        assert_eq!(SlruEvictionPolicy::new(8, 5).insert_rank(), 4);
        assert_eq!(SlruEvictionPolicy::new(8, 1).insert_rank(), 0);
        assert_eq!(SlruEvictionPolicy::new(4, 4).insert_rank(), 3);
    }

    #[test]
    fn test_fifo() {
        let mut list = List {
            policy: FifoEvictionPolicy::new(8),
            items: vec![],
            capacity: 4,
        };
        for i in 0..4 {
            assert_eq!(list.insert(i), None);
        }
        list.hit(0);
        assert_eq!(list.insert(4), Some(0));
        assert_eq!(list.items, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_lru() {
        let mut list = List {
            policy: LruEvictionPolicy::new(8),
            items: vec![],
            capacity: 4,
        };
        for i in 0..4 {
            list.insert(i);
        }
        list.hit(0);
        assert_eq!(list.insert(4), Some(1));
        assert_eq!(list.items, vec![4, 0, 3, 2]);
    }

    #[test]
    fn test_slru_promotion() {
        let policy = SlruEvictionPolicy::new(8, 5);
        assert_eq!(policy.insert_index(32), 16);
        assert_eq!(policy.promotion_index(16, 32), 12);
        assert_eq!(policy.promotion_index(12, 32), 8);
        assert_eq!(policy.promotion_index(2, 32), 0);
        assert_eq!(policy.eviction_candidate_index(32), 31);
    }

    #[test]
    fn test_slru_accessed_items_survive() {
        let mut list = List {
            policy: SlruEvictionPolicy::new(8, 5),
            items: vec![],
            capacity: 32,
        };
        let hot = 1_000_000;
        list.insert(hot);
        let mut best = list.position(hot).unwrap();
        for i in 0..10_000 {
            assert_ne!(list.insert(i), Some(hot), "hot item evicted after {i} inserts");
            list.hit(hot);
            let position = list.position(hot).unwrap();
            assert!(position <= best || position < 4, "hot item demoted to {position}");
            best = usize::min(best, position);
        }
        assert_eq!(list.position(hot), Some(0));
    }

    #[test]
    fn test_slru_unaccessed_evicted_first() {
        let mut list = List {
            policy: SlruEvictionPolicy::new(8, 5),
            items: vec![],
            capacity: 32,
        };
        for i in 0..32 {
            list.insert(i);
        }
        let (hit, missed) = (1000, 1001);
        list.insert(hit);
        list.insert(missed);
        list.hit(hit);

        let evicted = (2000..2100).filter_map(|i| list.insert(i)).collect::<Vec<_>>();
        assert!(evicted.contains(&missed));
        assert!(!evicted.contains(&hit));
    }
}
