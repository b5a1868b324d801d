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

use std::{path::PathBuf, time::Duration};

use larder_common::bits;
use serde::{Deserialize, Serialize};

use crate::{
    compress::Codec,
    engine::Engine,
    error::{Error, Result},
    index::IndexFormat,
};

/// Where sealed segments live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// All segments stay in memory.
    Memory,
    /// Segments are built in memory and written to one file each when sealed.
    File,
}

/// Eviction policy choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionKind {
    /// Insertion order only.
    Fifo,
    /// Least recently used.
    Lru,
    /// Segmented LRU with configurable ranks and insertion point.
    Slru,
}

/// Admission controller choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionKind {
    /// Admit everything, place items by expiration.
    Base,
    /// Admit items on their second sighting in the admission queue, place items by expiration.
    ExpirationAware,
    /// Admit items on their second sighting in the admission queue.
    AdmissionQueue,
    /// Admit items with a probability steered by the throughput controller.
    Random,
}

/// Recycling selector choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecyclingKind {
    /// Reclaim the segment with the smallest alive ratio first.
    MinAlive,
    /// Reclaim the least recently created segment first.
    Lrc,
}

/// Block compression config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Whether blocks are compressed at all.
    pub enabled: bool,
    /// Compression codec.
    pub codec: Codec,
    /// Codec level.
    pub level: i32,
    /// Whether zstd dictionaries are trained and used.
    pub dictionary_enabled: bool,
    /// Maximum size of a trained dictionary.
    pub dictionary_size: usize,
    /// Bytes of sampled values collected before a dictionary is trained.
    pub dictionary_training_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            codec: Codec::Zstd,
            level: 3,
            dictionary_enabled: true,
            dictionary_size: 64 * 1024,
            dictionary_training_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Engine configuration.
///
/// All values are plain data so any serde format can carry them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache instance name, used as the directory name under `root_dir`.
    pub name: String,
    /// Root directory for segment files and snapshots.
    pub root_dir: PathBuf,
    /// Where sealed segments live.
    pub storage: StorageKind,
    /// Segment size in bytes.
    pub segment_size: usize,
    /// Maximum bytes allocated for segments.
    pub max_cache_size: usize,
    /// Block size of the block formats. Must be a power of 2.
    pub block_size: usize,
    /// Prefetch window used when reading file-backed segments.
    pub file_prefetch_buffer_size: usize,
    /// Index entry format.
    pub index_format: IndexFormat,
    /// Index shard count.
    pub index_shards: usize,
    /// Initial bucket count per index shard, as a power of 2.
    pub index_initial_bucket_bits: u32,
    /// Maximum bucket count per index shard, as a power of 2.
    pub index_max_bucket_bits: u32,
    /// Eviction policy.
    pub eviction: EvictionKind,
    /// Number of popularity ranks. Each rank owns an active segment.
    pub popularity_ranks: usize,
    /// Insertion rank of new items for SLRU, 1-based.
    pub slru_insert_point: usize,
    /// Admission controller.
    pub admission: AdmissionKind,
    /// Initial admission queue size, as a ratio of the estimated item capacity.
    pub admission_queue_start_ratio: f64,
    /// Minimum admission queue size ratio.
    pub admission_queue_min_ratio: f64,
    /// Maximum admission queue size ratio.
    pub admission_queue_max_ratio: f64,
    /// Estimated average key + value size, used to size the admission queue.
    pub estimated_avg_kv_size: usize,
    /// Initial admission probability of the random admission controller.
    pub random_admission_start_ratio: f64,
    /// Lowest admission probability of the random admission controller.
    pub random_admission_stop_ratio: f64,
    /// Write throughput goal in bytes per second. `None` disables throughput control.
    pub throughput_goal: Option<u64>,
    /// Interval between throughput checks.
    pub throughput_check_interval: Duration,
    /// Relative tolerance around the throughput goal.
    pub throughput_tolerance: f64,
    /// Steps between the min and max of adjustable admission parameters.
    pub throughput_adjustment_steps: usize,
    /// Recycling selector.
    pub recycling: RecyclingKind,
    /// Occupancy ratio at which the scavenger starts evicting.
    pub scavenger_start_ratio: f64,
    /// Occupancy ratio at which the scavenger stops evicting.
    pub scavenger_stop_ratio: f64,
    /// Sealed segments with an alive ratio below this are compacted regardless of occupancy.
    pub scavenger_alive_ratio_threshold: f64,
    /// Initial popularity ratio below which unaccessed items are dumped under pressure.
    pub scavenger_dump_entry_below_min: f64,
    /// Maximum dump ratio.
    pub scavenger_dump_entry_below_max: f64,
    /// Dump ratio adjustment step.
    pub scavenger_dump_entry_below_step: f64,
    /// Number of scavenger threads. `0` disables background scavenging.
    pub scavenger_threads: usize,
    /// Interval between background scavenger passes.
    pub scavenger_run_interval: Duration,
    /// Maximum time a put waits for a free segment before it is rejected.
    pub max_wait_on_put: Duration,
    /// Block compression.
    pub compression: CompressionConfig,
    /// Load the snapshot under the cache directory on open, if one exists.
    pub recover: bool,
    /// Save a snapshot on close.
    pub save_on_close: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "larder".to_string(),
            root_dir: std::env::temp_dir(),
            storage: StorageKind::Memory,
            segment_size: 4 * 1024 * 1024,
            max_cache_size: 256 * 1024 * 1024,
            block_size: 4096,
            file_prefetch_buffer_size: 4096,
            index_format: IndexFormat::CompactWithExpire,
            index_shards: 64,
            index_initial_bucket_bits: 4,
            index_max_bucket_bits: 20,
            eviction: EvictionKind::Slru,
            popularity_ranks: 8,
            slru_insert_point: 5,
            admission: AdmissionKind::Base,
            admission_queue_start_ratio: 0.5,
            admission_queue_min_ratio: 0.1,
            admission_queue_max_ratio: 0.5,
            estimated_avg_kv_size: 10 * 1024,
            random_admission_start_ratio: 1.0,
            random_admission_stop_ratio: 0.0,
            throughput_goal: None,
            throughput_check_interval: Duration::from_secs(3600),
            throughput_tolerance: 0.05,
            throughput_adjustment_steps: 10,
            recycling: RecyclingKind::MinAlive,
            scavenger_start_ratio: 0.95,
            scavenger_stop_ratio: 0.9,
            scavenger_alive_ratio_threshold: 0.5,
            scavenger_dump_entry_below_min: 0.1,
            scavenger_dump_entry_below_max: 0.5,
            scavenger_dump_entry_below_step: 0.1,
            scavenger_threads: 1,
            scavenger_run_interval: Duration::from_secs(60),
            max_wait_on_put: Duration::from_millis(20),
            compression: CompressionConfig::default(),
            recover: false,
            save_on_close: false,
        }
    }
}

fn check_ratio(name: &str, v: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&v) {
        return Err(Error::config(format!("{name} {v} must be in [0.0, 1.0]")));
    }
    Ok(())
}

impl EngineConfig {
    /// Directory holding the files of this cache instance.
    pub fn dir(&self) -> PathBuf {
        self.root_dir.join(&self.name)
    }

    /// Maximum number of segments that may be allocated at once.
    pub fn max_segments(&self) -> usize {
        self.max_cache_size / self.segment_size
    }

    /// Estimated number of items the cache holds when full.
    pub fn estimated_capacity(&self) -> usize {
        (self.max_cache_size / self.estimated_avg_kv_size.max(1)).max(1)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size == 0 || self.segment_size > u32::MAX as usize {
            return Err(Error::config(format!("segment size {} out of range", self.segment_size)));
        }
        if !bits::is_pow2(self.block_size) || self.block_size > self.segment_size {
            return Err(Error::config(format!(
                "block size {} must be a power of 2 no larger than the segment size",
                self.block_size
            )));
        }
        let segments = self.max_segments();
        if segments == 0 || segments > u16::MAX as usize {
            return Err(Error::config(format!(
                "max cache size {} allows {segments} segments, must be in [1, {}]",
                self.max_cache_size,
                u16::MAX
            )));
        }
        if self.index_shards == 0 || !bits::is_pow2(self.index_shards) {
            return Err(Error::config(format!(
                "index shards {} must be a power of 2",
                self.index_shards
            )));
        }
        if self.index_initial_bucket_bits > self.index_max_bucket_bits || self.index_max_bucket_bits > 32 {
            return Err(Error::config(format!(
                "index bucket bits {}..{} out of range",
                self.index_initial_bucket_bits, self.index_max_bucket_bits
            )));
        }
        if self.popularity_ranks == 0 || self.popularity_ranks > u8::MAX as usize {
            return Err(Error::config(format!(
                "popularity ranks {} out of range",
                self.popularity_ranks
            )));
        }
        if self.slru_insert_point == 0 || self.slru_insert_point > self.popularity_ranks {
            return Err(Error::config(format!(
                "slru insert point {} must be in [1, {}]",
                self.slru_insert_point, self.popularity_ranks
            )));
        }
        for (name, v) in [
            ("admission queue start ratio", self.admission_queue_start_ratio),
            ("admission queue min ratio", self.admission_queue_min_ratio),
            ("admission queue max ratio", self.admission_queue_max_ratio),
            ("random admission start ratio", self.random_admission_start_ratio),
            ("random admission stop ratio", self.random_admission_stop_ratio),
            ("throughput tolerance", self.throughput_tolerance),
            ("scavenger start ratio", self.scavenger_start_ratio),
            ("scavenger stop ratio", self.scavenger_stop_ratio),
            ("scavenger alive ratio threshold", self.scavenger_alive_ratio_threshold),
            ("scavenger dump entry below min", self.scavenger_dump_entry_below_min),
            ("scavenger dump entry below max", self.scavenger_dump_entry_below_max),
            ("scavenger dump entry below step", self.scavenger_dump_entry_below_step),
        ] {
            check_ratio(name, v)?;
        }
        if !(self.admission_queue_min_ratio..=self.admission_queue_max_ratio).contains(&self.admission_queue_start_ratio)
        {
            return Err(Error::config("admission queue start ratio must be within [min, max]"));
        }
        if self.random_admission_stop_ratio > self.random_admission_start_ratio {
            return Err(Error::config("random admission stop ratio must not exceed the start ratio"));
        }
        if self.scavenger_stop_ratio > self.scavenger_start_ratio {
            return Err(Error::config("scavenger stop ratio must not exceed the start ratio"));
        }
        if self.scavenger_dump_entry_below_min > self.scavenger_dump_entry_below_max {
            return Err(Error::config("scavenger dump entry below min must not exceed the max"));
        }
        if self.throughput_adjustment_steps == 0 {
            return Err(Error::config("throughput adjustment steps must be positive"));
        }
        if self.compression.enabled && self.compression.dictionary_enabled && self.compression.dictionary_size == 0 {
            return Err(Error::config("dictionary size must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`Engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from an existing configuration.
    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Set the cache instance name.
    ///
    /// Default: `larder`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the root directory for segment files and snapshots.
    ///
    /// Default: the system temp dir.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.config.root_dir = root_dir.into();
        self
    }

    /// Set where sealed segments live.
    ///
    /// Default: [`StorageKind::Memory`].
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.config.storage = storage;
        self
    }

    /// Set the segment size.
    ///
    /// Default: 4 MiB.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.config.segment_size = segment_size;
        self
    }

    /// Set the maximum bytes allocated for segments.
    ///
    /// Default: 256 MiB.
    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.config.max_cache_size = max_cache_size;
        self
    }

    /// Set the block size.
    ///
    /// Default: 4 KiB.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Set the prefetch window for file-backed reads.
    ///
    /// Default: 4 KiB.
    pub fn with_file_prefetch_buffer_size(mut self, size: usize) -> Self {
        self.config.file_prefetch_buffer_size = size;
        self
    }

    /// Set the index entry format.
    ///
    /// Default: [`IndexFormat::CompactWithExpire`].
    pub fn with_index_format(mut self, index_format: IndexFormat) -> Self {
        self.config.index_format = index_format;
        self
    }

    /// Set the index shard count. Must be a power of 2.
    ///
    /// Default: 64.
    pub fn with_index_shards(mut self, index_shards: usize) -> Self {
        self.config.index_shards = index_shards;
        self
    }

    /// Set the initial and maximum bucket counts per index shard, as powers of 2.
    ///
    /// Default: 4 and 20.
    pub fn with_index_bucket_bits(mut self, initial: u32, max: u32) -> Self {
        self.config.index_initial_bucket_bits = initial;
        self.config.index_max_bucket_bits = max;
        self
    }

    /// Set the eviction policy.
    ///
    /// Default: [`EvictionKind::Slru`].
    pub fn with_eviction(mut self, eviction: EvictionKind) -> Self {
        self.config.eviction = eviction;
        self
    }

    /// Set the number of popularity ranks and the 1-based SLRU insertion point.
    ///
    /// Default: 8 ranks, insertion point 5.
    pub fn with_popularity_ranks(mut self, ranks: usize, slru_insert_point: usize) -> Self {
        self.config.popularity_ranks = ranks;
        self.config.slru_insert_point = slru_insert_point;
        self
    }

    /// Set the admission controller.
    ///
    /// Default: [`AdmissionKind::Base`].
    pub fn with_admission(mut self, admission: AdmissionKind) -> Self {
        self.config.admission = admission;
        self
    }

    /// Set the admission queue size ratios.
    ///
    /// Default: start 0.5, min 0.1, max 0.5.
    pub fn with_admission_queue_ratios(mut self, start: f64, min: f64, max: f64) -> Self {
        self.config.admission_queue_start_ratio = start;
        self.config.admission_queue_min_ratio = min;
        self.config.admission_queue_max_ratio = max;
        self
    }

    /// Set the estimated average key + value size.
    ///
    /// Default: 10 KiB.
    pub fn with_estimated_avg_kv_size(mut self, size: usize) -> Self {
        self.config.estimated_avg_kv_size = size;
        self
    }

    /// Set the random admission probability range.
    ///
    /// Default: start 1.0, stop 0.0.
    pub fn with_random_admission_ratios(mut self, start: f64, stop: f64) -> Self {
        self.config.random_admission_start_ratio = start;
        self.config.random_admission_stop_ratio = stop;
        self
    }

    /// Set the write throughput goal in bytes per second and its check interval.
    ///
    /// Default: no throughput control.
    pub fn with_throughput_goal(mut self, goal: u64, check_interval: std::time::Duration) -> Self {
        self.config.throughput_goal = Some(goal);
        self.config.throughput_check_interval = check_interval;
        self
    }

    /// Set the recycling selector.
    ///
    /// Default: [`RecyclingKind::MinAlive`].
    pub fn with_recycling(mut self, recycling: RecyclingKind) -> Self {
        self.config.recycling = recycling;
        self
    }

    /// Set the occupancy ratios between which the scavenger evicts.
    ///
    /// Default: start 0.95, stop 0.9.
    pub fn with_scavenger_ratios(mut self, start: f64, stop: f64) -> Self {
        self.config.scavenger_start_ratio = start;
        self.config.scavenger_stop_ratio = stop;
        self
    }

    /// Set the alive ratio below which sealed segments are compacted.
    ///
    /// Default: 0.5.
    pub fn with_scavenger_alive_ratio_threshold(mut self, threshold: f64) -> Self {
        self.config.scavenger_alive_ratio_threshold = threshold;
        self
    }

    /// Set scavenger thread count and run interval. `0` threads disables background scavenging.
    ///
    /// Default: 1 thread every 60s.
    pub fn with_scavenger_threads(mut self, threads: usize, interval: std::time::Duration) -> Self {
        self.config.scavenger_threads = threads;
        self.config.scavenger_run_interval = interval;
        self
    }

    /// Set the maximum time a put waits for a free segment.
    ///
    /// Default: 20ms.
    pub fn with_max_wait_on_put(mut self, wait: std::time::Duration) -> Self {
        self.config.max_wait_on_put = wait;
        self
    }

    /// Set block compression.
    ///
    /// Default: disabled.
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Load the snapshot on open if present.
    ///
    /// Default: `false`.
    pub fn with_recover(mut self, recover: bool) -> Self {
        self.config.recover = recover;
        self
    }

    /// Save a snapshot on close.
    ///
    /// Default: `false`.
    pub fn with_save_on_close(mut self, save_on_close: bool) -> Self {
        self.config.save_on_close = save_on_close;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate the configuration and open the engine.
    pub fn build(self) -> Result<Engine> {
        Engine::open(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            EngineBuilder::new().with_block_size(3000),
            EngineBuilder::new().with_segment_size(1024).with_max_cache_size(1024 * 1024 * 1024),
            EngineBuilder::new().with_max_cache_size(1024),
            EngineBuilder::new().with_scavenger_ratios(0.5, 0.9),
            EngineBuilder::new().with_popularity_ranks(8, 9),
            EngineBuilder::new().with_random_admission_ratios(0.2, 0.5),
            EngineBuilder::new().with_admission_queue_ratios(0.9, 0.1, 0.5),
            EngineBuilder::new().with_index_shards(3),
        ];
        for builder in cases {
            assert!(
                matches!(builder.config().validate(), Err(Error::Config(_))),
                "{:?}",
                builder.config()
            );
        }
    }

    #[test]
    fn test_config_derived_values() {
        let config = EngineBuilder::new()
            .with_segment_size(1024 * 1024)
            .with_max_cache_size(10 * 1024 * 1024)
            .with_estimated_avg_kv_size(1024)
            .config()
            .clone();
        assert_eq!(config.max_segments(), 10);
        assert_eq!(config.estimated_capacity(), 10 * 1024);
    }
}
