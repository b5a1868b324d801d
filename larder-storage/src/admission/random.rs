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

use std::io::{Read, Write};

use parking_lot::Mutex;
use rand::Rng;

use super::{AdmissionController, RankTtl, Stepper};
use crate::{config::EngineConfig, error::Result};

/// Admits an item with probability `threshold`.
///
/// The threshold starts at the start ratio and is stepped toward the stop ratio when the write throughput runs above
/// its goal.
#[derive(Debug)]
pub struct RandomAdmissionController {
    threshold: Mutex<Stepper>,
    ttl: RankTtl,
}

impl RandomAdmissionController {
    /// Create a controller from the engine config.
    pub fn new(config: &EngineConfig) -> Self {
        let (start, stop) = (config.random_admission_start_ratio, config.random_admission_stop_ratio);
        Self {
            threshold: Mutex::new(Stepper::new(start, stop, start, config.throughput_adjustment_steps)),
            ttl: RankTtl::new(config.popularity_ranks),
        }
    }

    /// Current admission probability.
    pub fn threshold(&self) -> f64 {
        self.threshold.lock().current
    }
}

impl AdmissionController for RandomAdmissionController {
    fn admit(&self, _: u64, _: usize) -> bool {
        let threshold = self.threshold();
        rand::rng().random::<f64>() < threshold
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

    fn decrease_throughput(&self) -> bool {
        let mut threshold = self.threshold.lock();
        let res = threshold.down();
        tracing::trace!("[random admission]: decrease to {threshold:.3}, adjusted: {res}", threshold = threshold.current);
        res
    }

    fn increase_throughput(&self) -> bool {
        let mut threshold = self.threshold.lock();
        let res = threshold.up();
        tracing::trace!("[random admission]: increase to {threshold:.3}, adjusted: {res}", threshold = threshold.current);
        res
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        bincode::serialize_into(&mut *writer, &*self.threshold.lock())?;
        self.ttl.save(writer)
    }

    fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let threshold: Stepper = bincode::deserialize_from(&mut *reader)?;
        *self.threshold.lock() = threshold;
        self.ttl.load(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(start: f64, stop: f64) -> RandomAdmissionController {
        RandomAdmissionController::new(&EngineConfig {
            random_admission_start_ratio: start,
            random_admission_stop_ratio: stop,
            throughput_adjustment_steps: 5,
            ..Default::default()
        })
    }

    #[test]
    fn test_threshold_extremes() {
        let all = controller(1.0, 0.0);
        assert!((0..1000).all(|i| all.admit(i, 1)));
        let none = controller(0.0, 0.0);
        assert!((0..1000).all(|i| !none.admit(i, 1)));
    }

    #[test]
    fn test_threshold_stays_in_bounds() {
        let c = controller(0.8, 0.3);
        assert!(!c.increase_throughput());
        assert_eq!(c.threshold(), 0.8);
        for _ in 0..5 {
            assert!(c.decrease_throughput());
        }
        assert_eq!(c.threshold(), 0.3);
        assert!(!c.decrease_throughput());
        assert_eq!(c.threshold(), 0.3);
        assert!(c.increase_throughput());
        assert!((c.threshold() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_save_load() {
        let c = controller(1.0, 0.0);
        c.decrease_throughput();
        c.decrease_throughput();
        let mut buf = vec![];
        c.save(&mut buf).unwrap();
        let loaded = controller(1.0, 0.0);
        loaded.load(&mut &buf[..]).unwrap();
        assert_eq!(loaded.threshold(), c.threshold());
    }
}
