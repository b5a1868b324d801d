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
    io::{Read, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use larder_common::clock::now_millis;
use serde::{Deserialize, Serialize};

use crate::{admission::AdmissionController, error::Result};

#[derive(Debug, Serialize, Deserialize)]
struct ThroughputSnapshot {
    start: u64,
    written: u64,
}

/// Steers admission toward a write throughput goal.
///
/// Throughput is the average of bytes written per second since the controller started.
#[derive(Debug)]
pub struct ThroughputController {
    goal: u64,
    tolerance: f64,
    start: AtomicU64,
    written: AtomicU64,
}

impl ThroughputController {
    /// Create a controller for `goal` bytes per second with a relative `tolerance`.
    pub fn new(goal: u64, tolerance: f64) -> Self {
        Self {
            goal,
            tolerance,
            start: AtomicU64::new(now_millis()),
            written: AtomicU64::new(0),
        }
    }

    /// Account `bytes` written.
    pub fn record(&self, bytes: usize) {
        self.written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Goal in bytes per second.
    pub fn throughput_goal(&self) -> u64 {
        self.goal
    }

    /// Total bytes written since start.
    pub fn total_bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Average throughput since start in bytes per second.
    pub fn current_throughput(&self) -> u64 {
        self.throughput_at(now_millis())
    }

    fn throughput_at(&self, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.start.load(Ordering::Relaxed)).max(1);
        (self.total_bytes_written() as u128 * 1000 / elapsed as u128) as u64
    }

    /// Nudge `controller` if the throughput is outside the tolerated range around the goal.
    ///
    /// Returns whether the controller changed.
    pub fn adjust_parameters(&self, controller: &dyn AdmissionController) -> bool {
        self.adjust_parameters_at(controller, now_millis())
    }

    fn adjust_parameters_at(&self, controller: &dyn AdmissionController, now: u64) -> bool {
        let current = self.throughput_at(now) as f64;
        let goal = self.goal as f64;
        let adjusted = if current > goal * (1.0 + self.tolerance) {
            controller.decrease_throughput()
        } else if current < goal * (1.0 - self.tolerance) {
            controller.increase_throughput()
        } else {
            false
        };
        tracing::debug!(
            "[throughput]: goal: {goal}, current: {current}, adjusted: {adjusted}",
            goal = self.goal,
            current = current as u64,
        );
        adjusted
    }

    /// Write the controller state.
    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let snapshot = ThroughputSnapshot {
            start: self.start.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
        };
        bincode::serialize_into(writer, &snapshot)?;
        Ok(())
    }

    /// Restore the controller state.
    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let snapshot: ThroughputSnapshot = bincode::deserialize_from(reader)?;
        self.start.store(snapshot.start, Ordering::Relaxed);
        self.written.store(snapshot.written, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{admission::RandomAdmissionController, config::EngineConfig};

    #[test]
    fn test_adjust_keeps_threshold_in_bounds() {
        let config = EngineConfig {
            random_admission_start_ratio: 1.0,
            random_admission_stop_ratio: 0.2,
            throughput_adjustment_steps: 4,
            ..Default::default()
        };
        let admission = RandomAdmissionController::new(&config);
        let tc = ThroughputController::new(1000, 0.05);
        let start = tc.start.load(Ordering::Relaxed);

        // 10 KB/s against a 1 KB/s goal.
        tc.record(100_000);
        for _ in 0..10 {
            tc.adjust_parameters_at(&admission, start + 10_000);
            assert!((0.2..=1.0).contains(&admission.threshold()));
        }
        assert_eq!(admission.threshold(), 0.2);
        assert!(!tc.adjust_parameters_at(&admission, start + 10_000));

        // 100 B/s.
        for _ in 0..10 {
            tc.adjust_parameters_at(&admission, start + 1_000_000);
            assert!((0.2..=1.0).contains(&admission.threshold()));
        }
        assert_eq!(admission.threshold(), 1.0);

        // Within tolerance.
        assert!(!tc.adjust_parameters_at(&admission, start + 100_000));
    }

    #[test]
    fn test_save_load() {
        let tc = ThroughputController::new(1000, 0.05);
        tc.record(4096);
        let mut buf = vec![];
        tc.save(&mut buf).unwrap();
        let loaded = ThroughputController::new(1000, 0.05);
        loaded.load(&mut &buf[..]).unwrap();
        assert_eq!(loaded.total_bytes_written(), 4096);
        assert_eq!(loaded.start.load(Ordering::Relaxed), tc.start.load(Ordering::Relaxed));
    }
}
