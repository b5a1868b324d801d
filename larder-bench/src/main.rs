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

//! Throughput and latency bench for the larder engine.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use bytesize::ByteSize;
use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use itertools::Itertools;
use larder_storage::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Eviction {
    Fifo,
    Lru,
    Slru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Compression {
    None,
    Zstd,
    Lz4,
}

#[derive(Parser, Debug, Clone)]
#[command(about)]
struct Args {
    /// Directory for segment files. Segments stay in memory if not set.
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Maximum cache size.
    #[arg(long, default_value = "256MiB")]
    capacity: ByteSize,

    /// Segment size.
    #[arg(long, default_value = "4MiB")]
    segment_size: ByteSize,

    /// Value size.
    #[arg(long, default_value = "1KiB")]
    entry_size: ByteSize,

    /// Keys are drawn uniformly from `[0, key_range)`.
    #[arg(long, default_value_t = 1_000_000)]
    key_range: u64,

    /// Bench duration in seconds.
    #[arg(short, long, default_value_t = 30)]
    time: u64,

    /// Worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Fraction of operations that are gets.
    #[arg(long, default_value_t = 0.9)]
    get_ratio: f64,

    #[arg(long, value_enum, default_value_t = Eviction::Slru)]
    eviction: Eviction,

    #[arg(long, value_enum, default_value_t = Compression::None)]
    compression: Compression,

    /// Use the admission queue instead of admitting every item.
    #[arg(long)]
    admission_queue: bool,

    #[arg(long, default_value_t = 1)]
    scavenger_threads: usize,

    /// Seconds between reports.
    #[arg(long, default_value_t = 5)]
    report_interval: u64,
}

#[derive(Debug)]
struct Metrics {
    puts: Histogram<u64>,
    gets: Histogram<u64>,
    hits: u64,
}

impl Metrics {
    fn new() -> Result<Self> {
        Ok(Self {
            puts: Histogram::new_with_bounds(1, 60_000_000_000, 3)?,
            gets: Histogram::new_with_bounds(1, 60_000_000_000, 3)?,
            hits: 0,
        })
    }

    fn merge(&mut self, other: &Metrics) -> Result<()> {
        self.puts.add(&other.puts)?;
        self.gets.add(&other.gets)?;
        self.hits += other.hits;
        Ok(())
    }
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn config(args: &Args) -> EngineConfig {
    let mut builder = EngineBuilder::new()
        .with_name("larder-bench")
        .with_max_cache_size(args.capacity.as_u64() as usize)
        .with_segment_size(args.segment_size.as_u64() as usize)
        .with_estimated_avg_kv_size(args.entry_size.as_u64() as usize + 16)
        .with_scavenger_threads(args.scavenger_threads, Duration::from_secs(1))
        .with_eviction(match args.eviction {
            Eviction::Fifo => EvictionKind::Fifo,
            Eviction::Lru => EvictionKind::Lru,
            Eviction::Slru => EvictionKind::Slru,
        });
    if let Some(dir) = &args.dir {
        builder = builder.with_root_dir(dir).with_storage(StorageKind::File);
    }
    if args.admission_queue {
        builder = builder.with_admission(AdmissionKind::AdmissionQueue);
    }
    let codec = match args.compression {
        Compression::None => None,
        Compression::Zstd => Some(Codec::Zstd),
        Compression::Lz4 => Some(Codec::Lz4),
    };
    if let Some(codec) = codec {
        builder = builder.with_compression(CompressionConfig {
            enabled: true,
            codec,
            ..Default::default()
        });
    }
    builder.config().clone()
}

fn worker(engine: Engine, args: Args, seed: u64, stop: Arc<AtomicBool>) -> Result<Metrics> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut metrics = Metrics::new()?;
    let mut value = vec![0u8; args.entry_size.as_u64() as usize];
    let mut buf = vec![0u8; value.len()];

    while !stop.load(Ordering::Relaxed) {
        let key = rng.random_range(0..args.key_range).to_be_bytes();
        if rng.random_bool(args.get_ratio) {
            let start = Instant::now();
            let fetch = engine.get(&key, &mut buf)?;
            metrics.gets.record(start.elapsed().as_nanos() as u64)?;
            if fetch.is_found() {
                metrics.hits += 1;
            }
        } else {
            rng.fill(&mut value[..]);
            let start = Instant::now();
            engine.put(&key, &value, 0, false)?;
            metrics.puts.record(start.elapsed().as_nanos() as u64)?;
        }
    }
    Ok(metrics)
}

fn report(title: &str, histogram: &Histogram<u64>, elapsed: Duration) {
    println!(
        "{title:>4}: {ops:>10} ops, {iops:>10.0} iops, p50: {p50:>8}ns, p90: {p90:>8}ns, p99: {p99:>8}ns, p999: {p999:>8}ns, max: {max:>10}ns",
        ops = histogram.len(),
        iops = histogram.len() as f64 / elapsed.as_secs_f64(),
        p50 = histogram.value_at_quantile(0.5),
        p90 = histogram.value_at_quantile(0.9),
        p99 = histogram.value_at_quantile(0.99),
        p999 = histogram.value_at_quantile(0.999),
        max = histogram.max(),
    );
}

fn main() -> Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!((0.0..=1.0).contains(&args.get_ratio), "--get-ratio must be in [0.0, 1.0]");

    let engine = Engine::open(config(&args))?;
    let stop = Arc::new(AtomicBool::new(false));

    let start = Instant::now();
    let handles = (0..args.threads)
        .map(|i| {
            let engine = engine.clone();
            let args = args.clone();
            let stop = stop.clone();
            std::thread::spawn(move || worker(engine, args, i as u64, stop))
        })
        .collect_vec();

    let deadline = start + Duration::from_secs(args.time);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(args.report_interval).min(deadline - Instant::now()));
        let statistics = engine.statistics();
        println!(
            "[{elapsed:>5.1}s] items: {items}, allocated: {allocated} / {max}, hit rate: {hit_rate:.3}, rejected: {rejected}, evicted: {evicted}",
            elapsed = start.elapsed().as_secs_f64(),
            items = statistics.size,
            allocated = ByteSize::b(statistics.bytes_allocated as u64),
            max = ByteSize::b(statistics.max_cache_size as u64),
            hit_rate = statistics.hit_rate(),
            rejected = statistics.rejected_writes,
            evicted = statistics.evicted,
        );
    }
    stop.store(true, Ordering::Relaxed);

    let mut metrics = Metrics::new()?;
    for handle in handles {
        let m = handle.join().map_err(|_| anyhow::anyhow!("bench worker panicked"))??;
        metrics.merge(&m)?;
    }
    let elapsed = start.elapsed();

    println!();
    report("put", &metrics.puts, elapsed);
    report("get", &metrics.gets, elapsed);
    let hit_ratio = if metrics.gets.is_empty() {
        0.0
    } else {
        metrics.hits as f64 / metrics.gets.len() as f64
    };
    println!(" hit: {hit_ratio:.3}");
    println!("{:#?}", engine.scavenger_stats());

    engine.close()?;
    Ok(())
}
