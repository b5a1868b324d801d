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

use std::{collections::HashMap, thread, time::Duration};

use larder_common::clock::now_millis;
use larder_storage::prelude::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn builder() -> EngineBuilder {
    EngineBuilder::new()
        .with_segment_size(256 * KB)
        .with_max_cache_size(4 * MB)
        .with_index_shards(8)
        .with_scavenger_threads(0, Duration::from_secs(60))
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

fn value(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (i + j) as u8).collect()
}

#[test_log::test]
fn test_round_trip() {
    let engine = builder().build().unwrap();

    for i in 0..1000 {
        assert!(engine.put(&key(i), &value(i, 100 + i % 200), 0, false).unwrap());
    }
    assert_eq!(engine.len(), 1000);

    let mut buf = vec![0; 4 * KB];
    for i in 0..1000 {
        let expected = value(i, 100 + i % 200);
        assert_eq!(engine.get(&key(i), &mut buf).unwrap(), Fetch::Found(expected.len()));
        assert_eq!(&buf[..expected.len()], &expected[..]);
    }

    let mut small = [0u8; 8];
    assert_eq!(engine.get(&key(0), &mut small).unwrap(), Fetch::BufferTooSmall(100));
    assert_eq!(engine.get(b"absent", &mut buf).unwrap(), Fetch::NotFound);

    let statistics = engine.statistics();
    assert_eq!(statistics.size, 1000);
    assert_eq!(statistics.puts, 1000);
    assert_eq!(statistics.gets, 1002);
    assert_eq!(statistics.hits, 1001);
    assert!(statistics.bytes_used > 0);
    assert!(statistics.index_memory >= 1000 * 12);
    assert!(statistics.bytes_allocated <= statistics.max_cache_size);
}

#[test_log::test]
fn test_delete_exists_touch() {
    let engine = builder().build().unwrap();

    assert!(engine.put(b"k1", b"v1", 0, false).unwrap());
    assert!(engine.put(b"k2", b"v2", 0, false).unwrap());

    assert!(engine.exists(b"k1").unwrap());
    assert!(engine.touch(b"k2").unwrap());
    assert!(!engine.touch(b"k3").unwrap());

    assert!(engine.delete(b"k1").unwrap());
    assert!(!engine.delete(b"k1").unwrap());
    assert!(!engine.exists(b"k1").unwrap());
    assert_eq!(engine.get_value(b"k1").unwrap(), None);
    assert_eq!(engine.get_value(b"k2").unwrap().as_deref(), Some(&b"v2"[..]));
    assert_eq!(engine.statistics().deletes, 1);
}

#[test_log::test]
fn test_get_range() {
    let engine = builder().build().unwrap();
    let v = value(7, 1000);
    assert!(engine.put(b"range", &v, 0, false).unwrap());

    let mut buf = vec![0; 600];
    assert_eq!(engine.get_range(b"range", 400, &mut buf).unwrap(), Fetch::Found(600));
    assert_eq!(&buf[..], &v[400..]);
    assert_eq!(engine.get_range(b"range", 100, &mut buf).unwrap(), Fetch::BufferTooSmall(900));
    assert_eq!(engine.get_range(b"range", 2000, &mut buf).unwrap(), Fetch::Found(0));
    assert_eq!(engine.get_range(b"absent", 0, &mut buf).unwrap(), Fetch::NotFound);
}

#[test_log::test]
fn test_expiration() {
    let engine = builder().with_index_format(IndexFormat::CompactWithExpire).build().unwrap();

    let now = now_millis();
    assert!(engine.put(b"short", b"v", now + 100, false).unwrap());
    assert!(engine.put(b"long", b"v", now + 3_600_000, false).unwrap());
    assert!(engine.put(b"never", b"v", 0, false).unwrap());
    // Already expired items are rejected.
    assert!(!engine.put(b"past", b"v", now - 1, false).unwrap());

    // Expiration is kept with a granularity of one second.
    thread::sleep(Duration::from_millis(2100));

    assert_eq!(engine.get_value(b"short").unwrap(), None);
    assert!(!engine.exists(b"short").unwrap());
    assert!(engine.exists(b"long").unwrap());
    assert!(engine.exists(b"never").unwrap());
    assert_eq!(engine.statistics().expired, 1);
    assert_eq!(engine.len(), 2);
}

#[test_log::test]
fn test_get_and_set_expire() {
    let engine = builder().with_index_format(IndexFormat::CompactWithExpire).build().unwrap();

    let expire = now_millis() + 3_600_000;
    assert!(engine.put(b"k", b"v", 0, false).unwrap());
    assert_eq!(engine.get_and_set_expire(b"k", expire).unwrap(), Some(0));
    assert_eq!(
        engine.get_and_set_expire(b"k", 0).unwrap(),
        Some(expire.div_ceil(1000) * 1000)
    );
    assert_eq!(engine.get_and_set_expire(b"absent", expire).unwrap(), None);

    // Compact entries carry no expiration: the item is rewritten.
    let engine = builder().with_index_format(IndexFormat::Compact).build().unwrap();
    assert!(engine.put(b"k", b"v", 0, false).unwrap());
    assert_eq!(engine.get_and_set_expire(b"k", expire).unwrap(), Some(0));
    assert_eq!(engine.get_value(b"k").unwrap().as_deref(), Some(&b"v"[..]));
}

#[test_log::test]
fn test_oversized_record_rejected() {
    let engine = builder().build().unwrap();
    assert!(!engine.put(b"huge", &vec![0; 256 * KB], 0, true).unwrap());
    assert_eq!(engine.statistics().rejected_writes, 1);
    assert!(engine.is_empty());
}

#[test_log::test]
fn test_reference_scenario() {
    const PUTS: usize = 20_000;
    const KEYS: usize = 5_000;

    let engine = EngineBuilder::new()
        .with_segment_size(MB)
        .with_max_cache_size(10 * MB)
        .with_scavenger_threads(0, Duration::from_secs(60))
        .with_scavenger_alive_ratio_threshold(0.5)
        .build()
        .unwrap();

    for i in 0..PUTS {
        assert!(engine.put(&key(i % KEYS), &value(i, 256), 0, true).unwrap());
    }

    let before = engine.statistics();
    assert!(before.allocated_segments <= 10);
    assert!(before.bytes_allocated <= 10 * MB);
    assert_eq!(before.size, KEYS);

    let check = |engine: &Engine| {
        for i in PUTS - KEYS..PUTS {
            assert_eq!(
                engine.get_value(&key(i % KEYS)).unwrap(),
                Some(value(i, 256)),
                "key {} lost",
                i % KEYS
            );
        }
    };
    check(&engine);

    let report = engine.scavenge().unwrap();
    let after = engine.statistics();
    assert!(report.segments_reclaimed > 0);
    assert!(report.relocated > 0);
    assert!(
        after.allocated_segments < before.allocated_segments,
        "before: {before:?}, after: {after:?}"
    );
    assert_eq!(after.size, KEYS);
    check(&engine);
}

#[test_log::test]
fn test_compaction_keeps_live_keys() {
    let engine = builder().with_scavenger_alive_ratio_threshold(0.9).build().unwrap();
    let mut rng = SmallRng::seed_from_u64(42);
    let mut model = HashMap::new();

    for round in 0..8000 {
        let k = rng.random_range(0..1500usize);
        if rng.random_bool(0.1) {
            engine.delete(&key(k)).unwrap();
            model.remove(&k);
        } else {
            let len = rng.random_range(16..512);
            assert!(engine.put(&key(k), &value(round, len), 0, true).unwrap());
            model.insert(k, value(round, len));
        }
    }

    let report = engine.scavenge().unwrap();
    assert!(report.segments_reclaimed > 0);
    assert_eq!(engine.len(), model.len());

    for k in 0..1500 {
        assert_eq!(engine.get_value(&key(k)).unwrap(), model.get(&k).cloned(), "key {k}");
    }
    let stats = engine.scavenger_stats();
    assert_eq!(stats.passes, 1);
    assert_eq!(stats.total, report);
}

#[test_log::test]
fn test_space_pressure_evicts() {
    let engine = EngineBuilder::new()
        .with_segment_size(64 * KB)
        .with_max_cache_size(512 * KB)
        .with_index_shards(4)
        .with_scavenger_threads(0, Duration::from_secs(60))
        .with_max_wait_on_put(Duration::from_millis(200))
        .build()
        .unwrap();

    for i in 0..2000 {
        assert!(engine.put(&key(i), &value(i, KB), 0, true).unwrap(), "put {i}");
        assert!(engine.statistics().allocated_segments <= 8);
    }

    let statistics = engine.statistics();
    assert!(statistics.evicted > 0);
    assert!(statistics.size < 2000);
    assert!(engine.recycling_stats().picks > 0);
    assert_eq!(engine.get_value(&key(1999)).unwrap(), Some(value(1999, KB)));
    assert_eq!(engine.get_value(&key(0)).unwrap(), None);
}

#[test_log::test]
fn test_concurrent_access() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    let engine = builder()
        .with_scavenger_threads(1, Duration::from_millis(10))
        .build()
        .unwrap();

    let handles = (0..THREADS)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                for i in t * PER_THREAD..(t + 1) * PER_THREAD {
                    assert!(engine.put(&key(i), &value(i, 256), 0, true).unwrap());
                    assert_eq!(engine.get_value(&key(i)).unwrap(), Some(value(i, 256)));
                }
                // Overwrite half to leave dead records behind.
                for i in (t * PER_THREAD..(t + 1) * PER_THREAD).step_by(2) {
                    assert!(engine.put(&key(i), &value(i + 1, 256), 0, true).unwrap());
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..THREADS * PER_THREAD {
        let expected = if i % 2 == 0 { value(i + 1, 256) } else { value(i, 256) };
        assert_eq!(engine.get_value(&key(i)).unwrap(), Some(expected), "key {i}");
    }
    engine.close().unwrap();
}

#[test_log::test]
fn test_overwrites_race_relocation() {
    const THREADS: usize = 4;
    const KEYS: usize = 1000;
    const ROUNDS: usize = 5000;

    fn versioned(i: usize, version: usize) -> Vec<u8> {
        let mut v = format!("{}:{version}:", String::from_utf8_lossy(&key(i))).into_bytes();
        v.resize(512, b'.');
        v
    }

    let engine = EngineBuilder::new()
        .with_segment_size(64 * KB)
        .with_max_cache_size(MB)
        .with_index_shards(4)
        .with_scavenger_threads(2, Duration::from_millis(1))
        .with_max_wait_on_put(Duration::from_secs(2))
        .build()
        .unwrap();

    let handles = (0..THREADS)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(t as u64);
                // Each thread owns the keys congruent to `t`; `None` marks a key whose last put was not applied.
                let mut latest: HashMap<usize, Option<Vec<u8>>> = HashMap::new();
                for round in 0..ROUNDS {
                    let i = rng.random_range(0..KEYS / THREADS) * THREADS + t;
                    let v = versioned(i, round);
                    let applied = engine.put(&key(i), &v, 0, true).unwrap();
                    latest.insert(i, applied.then_some(v));

                    let other = rng.random_range(0..KEYS);
                    if let Some(got) = engine.get_value(&key(other)).unwrap() {
                        assert!(got.starts_with(&key(other)), "key {other} read a foreign value");
                    }
                }
                latest
            })
        })
        .collect::<Vec<_>>();

    let mut latest = HashMap::new();
    for handle in handles {
        latest.extend(handle.join().unwrap());
    }

    let stats = engine.scavenger_stats();
    assert!(stats.total.segments_reclaimed > 0);
    assert!(stats.total.relocated > 0);
    for (i, expected) in latest {
        let got = engine.get_value(&key(i)).unwrap();
        if let Some(got) = &got {
            assert!(got.starts_with(&key(i)), "key {i} read a foreign value");
        }
        // Items may be evicted under pressure, but a relocation never resurrects an older version.
        if let (Some(got), Some(expected)) = (got, expected) {
            assert_eq!(got, expected, "key {i}");
        }
    }
    engine.close().unwrap();
}

#[test_log::test]
fn test_file_storage_recover() {
    let dir = tempfile::tempdir().unwrap();
    let config = builder()
        .with_root_dir(dir.path())
        .with_name("file")
        .with_storage(StorageKind::File)
        .with_recover(true)
        .with_save_on_close(true)
        .config()
        .clone();

    let engine = Engine::open(config.clone()).unwrap();
    for i in 0..2000 {
        assert!(engine.put(&key(i), &value(i, KB), 0, true).unwrap());
    }
    // Sealed segments are served from their files.
    for i in 0..2000 {
        assert_eq!(engine.get_value(&key(i)).unwrap(), Some(value(i, KB)));
    }
    assert!(dir.path().join("file").join("segment-0.data").is_file());
    engine.close().unwrap();
    drop(engine);

    let engine = Engine::open(config).unwrap();
    assert_eq!(engine.len(), 2000);
    for i in 0..2000 {
        assert_eq!(engine.get_value(&key(i)).unwrap(), Some(value(i, KB)), "key {i}");
    }
    // The restored active segments keep accepting writes.
    assert!(engine.put(b"after", b"restart", 0, true).unwrap());
    assert_eq!(engine.get_value(b"after").unwrap().as_deref(), Some(&b"restart"[..]));
}

#[test_log::test]
fn test_memory_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = builder()
        .with_root_dir(dir.path())
        .with_name("memory")
        .with_recover(true)
        .with_admission(AdmissionKind::AdmissionQueue)
        .config()
        .clone();

    let engine = Engine::open(config.clone()).unwrap();
    for i in 0..500 {
        assert!(engine.put(&key(i), &value(i, 300), 0, true).unwrap());
    }
    // Seen once: queued but not admitted.
    assert!(!engine.put(b"pending", b"v", 0, false).unwrap());
    engine.save().unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = Engine::open(config).unwrap();
    for i in 0..500 {
        assert_eq!(engine.get_value(&key(i)).unwrap(), Some(value(i, 300)));
    }
    // The admission queue survived the restart.
    assert!(engine.put(b"pending", b"v", 0, false).unwrap());
}

#[test_log::test]
fn test_restart_without_save_starts_clean() {
    for storage in [StorageKind::Memory, StorageKind::File] {
        let dir = tempfile::tempdir().unwrap();
        let config = builder()
            .with_root_dir(dir.path())
            .with_name("restart")
            .with_storage(storage)
            .with_recover(true)
            .config()
            .clone();

        let engine = Engine::open(config.clone()).unwrap();
        for i in 0..600 {
            assert!(engine.put(&key(i), &value(i, KB), 0, true).unwrap());
        }
        engine.save().unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = Engine::open(config.clone()).unwrap();
        assert_eq!(engine.len(), 600);
        assert_eq!(engine.get_value(&key(0)).unwrap(), Some(value(0, KB)));
        assert!(engine.put(b"after", b"restart", 0, true).unwrap());
        // Dropped without saving: the consumed snapshot must not be recovered again.
        engine.close().unwrap();
        drop(engine);

        let engine = Engine::open(config.clone()).unwrap();
        assert!(engine.is_empty(), "{storage:?}");
        assert_eq!(engine.get_value(&key(0)).unwrap(), None);
        assert!(engine.put(&key(0), &value(0, KB), 0, true).unwrap());
        engine.save().unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = Engine::open(config).unwrap();
        assert_eq!(engine.get_value(&key(0)).unwrap(), Some(value(0, KB)));
    }
}

#[test_log::test]
fn test_admission_queue() {
    let engine = builder().with_admission(AdmissionKind::AdmissionQueue).build().unwrap();

    assert!(!engine.put(b"k", b"v", 0, false).unwrap());
    assert!(engine.put(b"k", b"v", 0, false).unwrap());
    assert!(engine.put(b"forced", b"v", 0, true).unwrap());
    assert_eq!(engine.statistics().rejected_writes, 1);
    assert_eq!(engine.len(), 2);
}

#[test_log::test]
fn test_compressed_write_batch() {
    for codec in [Codec::Zstd, Codec::Lz4] {
        let engine = builder()
            .with_compression(CompressionConfig {
                enabled: true,
                codec,
                ..Default::default()
            })
            .build()
            .unwrap();

        let text = |i: usize| format!("value {i} of a fairly repetitive payload, value {i} again").repeat(8);

        let mut batch = WriteBatch::new(16 * KB);
        for i in 0..1000 {
            if !batch.put(&key(i), text(i).as_bytes(), 0) {
                assert!(engine.write_batch(&mut batch).unwrap());
                assert!(batch.is_empty());
                assert!(batch.put(&key(i), text(i).as_bytes(), 0));
            }
        }
        assert!(engine.write_batch(&mut batch).unwrap());

        // Single puts share the segments with batches.
        assert!(engine.put(b"single", b"value", 0, false).unwrap());

        for i in 0..1000 {
            assert_eq!(engine.get_value(&key(i)).unwrap(), Some(text(i).into_bytes()));
        }
        assert_eq!(engine.get_value(b"single").unwrap().as_deref(), Some(&b"value"[..]));

        let statistics = engine.statistics();
        assert_eq!(statistics.size, 1001);
        // Compressed blocks take less room than the raw records.
        assert!(statistics.bytes_used < statistics.puts_bytes as usize);
    }
}

#[test_log::test]
fn test_write_batch_without_compression() {
    let engine = builder().build().unwrap();
    let mut batch = WriteBatch::new(4 * KB);
    for i in 0..10 {
        assert!(batch.put(&key(i), &value(i, 64), 0));
    }
    assert!(engine.write_batch(&mut batch).unwrap());
    assert!(batch.is_empty());
    for i in 0..10 {
        assert_eq!(engine.get_value(&key(i)).unwrap(), Some(value(i, 64)));
    }
}

#[test_log::test]
fn test_random_admission() {
    let engine = builder()
        .with_admission(AdmissionKind::Random)
        .with_random_admission_ratios(1.0, 0.0)
        .build()
        .unwrap();
    // Start ratio 1.0 admits everything.
    for i in 0..100 {
        assert!(engine.put(&key(i), &value(i, 32), 0, false).unwrap());
    }
    assert_eq!(engine.statistics().rejected_writes, 0);

    let engine = builder()
        .with_admission(AdmissionKind::Random)
        .with_random_admission_ratios(0.0, 0.0)
        .build()
        .unwrap();
    for i in 0..100 {
        assert!(!engine.put(&key(i), &value(i, 32), 0, false).unwrap());
    }
    assert_eq!(engine.statistics().rejected_writes, 100);
    assert!(engine.is_empty());
}
