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

//! The in-memory index mapping key hashes to record locations.
//!
//! The index is split into shards by the high bits of the key hash, each behind its own lock. A shard is an array of
//! fixed-size buckets selected by the low bits of the fingerprint and probed linearly. The order of entries in a
//! bucket is the eviction order maintained by the [`EvictionPolicy`].
//!
//! The fingerprint only identifies a *candidate*: callers verify the key by reading the record at the candidate's
//! location. Lookups run the verification under the shard read lock, so the referenced segment cannot be reclaimed
//! while it is read.

mod format;

use std::{
    io::{Read, Write},
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use larder_common::{bits, strict_assert};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use self::format::{IndexFormat, Location, FINGERPRINT_BITS};
use self::format::{
    expire_to_secs, fingerprint, matches, pack_location, secs_to_expire, signature, stored_fingerprint,
    unpack_location, HIT_BIT,
};
use crate::{
    error::{Error, Result},
    eviction::{rank_for_index, EvictionPolicy},
    segment::SegmentId,
};

/// Slots per bucket.
pub const BUCKET_SLOTS: usize = 32;

/// An index entry as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Record location.
    pub location: Location,
    /// Whether the entry was hit since it was inserted or last relocated.
    pub hit: bool,
    /// Absolute expiration in millis, `0` for never.
    pub expire: u64,
    /// Popularity rank derived from the position in the bucket.
    pub rank: usize,
}

/// Result of [`MemoryIndex::insert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Location of the previous entry of the same key.
    pub replaced: Option<Location>,
    /// Location of an entry evicted to make room.
    pub evicted: Option<Location>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Shard {
    bucket_bits: u32,
    lens: Vec<u8>,
    sigs: Vec<AtomicU32>,
    locs: Vec<u64>,
    /// Empty unless the format has expiration.
    expires: Vec<u32>,
    len: usize,
}

impl Shard {
    fn new(bucket_bits: u32, format: IndexFormat) -> Self {
        let buckets = 1usize << bucket_bits;
        let slots = buckets * BUCKET_SLOTS;
        Self {
            bucket_bits,
            lens: vec![0; buckets],
            sigs: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            locs: vec![0; slots],
            expires: if format.has_expire() { vec![0; slots] } else { vec![] },
            len: 0,
        }
    }

    fn buckets(&self) -> usize {
        self.lens.len()
    }

    fn bucket(&self, fp: u64) -> usize {
        bits::low_bits(fp, self.bucket_bits) as usize
    }

    fn slot(bucket: usize, pos: usize) -> usize {
        bucket * BUCKET_SLOTS + pos
    }

    /// Position of the first entry in `bucket` carrying `fp` for which `pred` holds.
    fn position(&self, bucket: usize, fp: u64, mut pred: impl FnMut(usize) -> bool) -> Option<usize> {
        (0..self.lens[bucket] as usize).find(|&pos| {
            let slot = Self::slot(bucket, pos);
            matches(self.sigs[slot].load(Ordering::Relaxed), self.locs[slot], fp) && pred(slot)
        })
    }

    fn location(&self, slot: usize) -> Location {
        unpack_location(self.locs[slot])
    }

    fn expire(&self, slot: usize) -> u64 {
        self.expires.get(slot).copied().map(secs_to_expire).unwrap_or_default()
    }

    fn info(&self, bucket: usize, pos: usize, ranks: usize) -> EntryInfo {
        let slot = Self::slot(bucket, pos);
        EntryInfo {
            location: self.location(slot),
            hit: self.sigs[slot].load(Ordering::Relaxed) & HIT_BIT != 0,
            expire: self.expire(slot),
            rank: rank_for_index(ranks, pos, self.lens[bucket] as usize),
        }
    }

    fn insert_at(&mut self, bucket: usize, pos: usize, sig: u32, loc: u64, expire: u32) {
        let len = self.lens[bucket] as usize;
        strict_assert!(len < BUCKET_SLOTS && pos <= len);
        let (start, end) = (Self::slot(bucket, pos), Self::slot(bucket, len + 1));
        self.sigs[start..end].rotate_right(1);
        self.locs[start..end].rotate_right(1);
        *self.sigs[start].get_mut() = sig;
        self.locs[start] = loc;
        if !self.expires.is_empty() {
            self.expires[start..end].rotate_right(1);
            self.expires[start] = expire;
        }
        self.lens[bucket] += 1;
        self.len += 1;
    }

    fn remove_at(&mut self, bucket: usize, pos: usize) -> Location {
        let len = self.lens[bucket] as usize;
        strict_assert!(pos < len);
        let (start, end) = (Self::slot(bucket, pos), Self::slot(bucket, len));
        let location = self.location(start);
        self.sigs[start..end].rotate_left(1);
        self.locs[start..end].rotate_left(1);
        if !self.expires.is_empty() {
            self.expires[start..end].rotate_left(1);
        }
        self.lens[bucket] -= 1;
        self.len -= 1;
        location
    }

    fn move_entry(&mut self, bucket: usize, from: usize, to: usize) {
        if from == to {
            return;
        }
        let (lo, hi) = (usize::min(from, to), usize::max(from, to));
        let (start, end) = (Self::slot(bucket, lo), Self::slot(bucket, hi + 1));
        if to < from {
            self.sigs[start..end].rotate_right(1);
            self.locs[start..end].rotate_right(1);
            if !self.expires.is_empty() {
                self.expires[start..end].rotate_right(1);
            }
        } else {
            self.sigs[start..end].rotate_left(1);
            self.locs[start..end].rotate_left(1);
            if !self.expires.is_empty() {
                self.expires[start..end].rotate_left(1);
            }
        }
    }

    /// Double the bucket count, splitting every bucket in two and keeping the relative order of entries.
    fn grow(&mut self, format: IndexFormat) {
        let mut grown = Shard::new(self.bucket_bits + 1, format);
        for bucket in 0..self.buckets() {
            for pos in 0..self.lens[bucket] as usize {
                let slot = Self::slot(bucket, pos);
                let sig = self.sigs[slot].load(Ordering::Relaxed);
                let loc = self.locs[slot];
                let target = grown.bucket(stored_fingerprint(sig, loc));
                let at = grown.lens[target] as usize;
                grown.insert_at(target, at, sig, loc, self.expires.get(slot).copied().unwrap_or_default());
            }
        }
        tracing::trace!(
            "[index]: grow shard from {from} to {to} buckets, entries: {len}",
            from = self.buckets(),
            to = grown.buckets(),
            len = self.len
        );
        *self = grown;
    }
}

/// Snapshot header of the index.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshotHeader {
    format: IndexFormat,
    shards: usize,
    len: usize,
}

/// A sharded, bucketed hash index of record locations.
#[derive(Debug)]
pub struct MemoryIndex {
    shards: Box<[RwLock<Shard>]>,
    shard_bits: u32,
    format: IndexFormat,
    max_bucket_bits: u32,
    policy: Box<dyn EvictionPolicy>,
    len: AtomicUsize,
}

impl MemoryIndex {
    /// Create an index with `shards` shards (a power of 2) of `1 << initial_bucket_bits` buckets each, growable up to
    /// `1 << max_bucket_bits` buckets.
    pub fn new(
        format: IndexFormat,
        shards: usize,
        initial_bucket_bits: u32,
        max_bucket_bits: u32,
        policy: Box<dyn EvictionPolicy>,
    ) -> Self {
        assert!(bits::is_pow2(shards), "shards {shards} must be a power of 2");
        let shard_bits = shards.trailing_zeros();
        assert!(shard_bits <= 64 - FINGERPRINT_BITS);
        let shards = (0..shards)
            .map(|_| RwLock::new(Shard::new(initial_bucket_bits, format)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shard_bits,
            format,
            max_bucket_bits: u32::max(initial_bucket_bits, max_bucket_bits),
            policy,
            len: AtomicUsize::new(0),
        }
    }

    /// The eviction policy ordering the buckets.
    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    /// Entry format.
    pub fn format(&self) -> IndexFormat {
        self.format
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate memory held by entries, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().buckets() * BUCKET_SLOTS * self.format.entry_size())
            .sum()
    }

    fn shard(&self, hash: u64) -> &RwLock<Shard> {
        &self.shards[bits::high_bits(hash, self.shard_bits) as usize]
    }

    /// Find the entry of a key.
    ///
    /// `verify` runs under the shard read lock for every candidate carrying the key's fingerprint, and returns
    /// `Some` once the key is confirmed at the candidate's location. The hit bit of the confirmed entry is set.
    pub fn lookup<R>(
        &self,
        hash: u64,
        verify: impl FnMut(&EntryInfo) -> Result<Option<R>>,
    ) -> Result<Option<(R, EntryInfo)>> {
        self.find(hash, verify, true)
    }

    /// [`MemoryIndex::lookup`] without setting the hit bit.
    pub fn peek<R>(
        &self,
        hash: u64,
        verify: impl FnMut(&EntryInfo) -> Result<Option<R>>,
    ) -> Result<Option<(R, EntryInfo)>> {
        self.find(hash, verify, false)
    }

    fn find<R>(
        &self,
        hash: u64,
        mut verify: impl FnMut(&EntryInfo) -> Result<Option<R>>,
        hit: bool,
    ) -> Result<Option<(R, EntryInfo)>> {
        let fp = fingerprint(hash);
        let shard = self.shard(hash).read();
        let bucket = shard.bucket(fp);
        let len = shard.lens[bucket] as usize;
        for pos in 0..len {
            let slot = Shard::slot(bucket, pos);
            if !matches(shard.sigs[slot].load(Ordering::Relaxed), shard.locs[slot], fp) {
                continue;
            }
            let info = shard.info(bucket, pos, self.policy.ranks());
            if let Some(r) = verify(&info)? {
                if hit {
                    shard.sigs[slot].fetch_or(HIT_BIT, Ordering::Relaxed);
                }
                return Ok(Some((r, info)));
            }
        }
        Ok(None)
    }

    /// Move the entry at `location` to its promotion position.
    ///
    /// Promotion is best effort: it is skipped if the shard is contended.
    pub fn promote(&self, hash: u64, location: Location) -> bool {
        let fp = fingerprint(hash);
        let Some(mut shard) = self.shard(hash).try_write() else {
            return false;
        };
        let bucket = shard.bucket(fp);
        let Some(from) = find_at(&shard, bucket, fp, location) else {
            return false;
        };
        let to = self.policy.promotion_index(from, shard.lens[bucket] as usize);
        shard.move_entry(bucket, from, to);
        true
    }

    /// Insert or replace the entry of a key.
    ///
    /// `is_same` is asked for every candidate carrying the key's fingerprint whether its location holds the key. A
    /// confirmed candidate is replaced in place, keeping its position. Otherwise a new entry is inserted at the
    /// policy's insert position, growing the shard or evicting the policy's candidate when the bucket is full.
    pub fn insert(
        &self,
        hash: u64,
        location: Location,
        expire: u64,
        mut is_same: impl FnMut(Location) -> Result<bool>,
    ) -> Result<InsertOutcome> {
        let fp = fingerprint(hash);
        let mut shard = self.shard(hash).write();
        let mut outcome = InsertOutcome::default();
        let expire = expire_to_secs(expire);

        let mut bucket = shard.bucket(fp);
        let len = shard.lens[bucket] as usize;
        for pos in 0..len {
            let slot = Shard::slot(bucket, pos);
            if !matches(shard.sigs[slot].load(Ordering::Relaxed), shard.locs[slot], fp) {
                continue;
            }
            let current = shard.location(slot);
            if is_same(current)? {
                shard.locs[slot] = pack_location(fp, location);
                if !shard.expires.is_empty() {
                    shard.expires[slot] = expire;
                }
                outcome.replaced = Some(current);
                return Ok(outcome);
            }
        }

        while shard.bucket_bits < self.max_bucket_bits
            && (shard.lens[bucket] as usize == BUCKET_SLOTS
                || (shard.len + 1) * 4 > shard.buckets() * BUCKET_SLOTS * 3)
        {
            shard.grow(self.format);
            bucket = shard.bucket(fp);
        }

        if shard.lens[bucket] as usize == BUCKET_SLOTS {
            let victim = self.policy.eviction_candidate_index(BUCKET_SLOTS);
            outcome.evicted = Some(shard.remove_at(bucket, victim));
            self.len.fetch_sub(1, Ordering::Relaxed);
        }

        let pos = self.policy.insert_index(shard.lens[bucket] as usize);
        shard.insert_at(bucket, pos, signature(fp), pack_location(fp, location), expire);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Remove the entry of a key. `is_same` confirms candidates as in [`MemoryIndex::insert`].
    pub fn remove(&self, hash: u64, mut is_same: impl FnMut(Location) -> Result<bool>) -> Result<Option<Location>> {
        let fp = fingerprint(hash);
        let mut shard = self.shard(hash).write();
        let bucket = shard.bucket(fp);
        let len = shard.lens[bucket] as usize;
        for pos in 0..len {
            let slot = Shard::slot(bucket, pos);
            if !matches(shard.sigs[slot].load(Ordering::Relaxed), shard.locs[slot], fp) {
                continue;
            }
            if is_same(shard.location(slot))? {
                let location = shard.remove_at(bucket, pos);
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Ok(Some(location));
            }
        }
        Ok(None)
    }

    /// Remove the entry carrying the hash's fingerprint at exactly `location`.
    pub fn remove_if(&self, hash: u64, location: Location) -> bool {
        let fp = fingerprint(hash);
        let mut shard = self.shard(hash).write();
        let bucket = shard.bucket(fp);
        let Some(pos) = find_at(&shard, bucket, fp, location) else {
            return false;
        };
        shard.remove_at(bucket, pos);
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Point the entry at `expected` to `new`, only if it still points at `expected`.
    ///
    /// This is the relocation primitive of the scavenger: a concurrent write that already replaced the entry makes
    /// the update fail instead of being lost. The hit bit is cleared on success.
    pub fn compare_and_update(&self, hash: u64, expected: Location, new: Location) -> bool {
        let fp = fingerprint(hash);
        let mut shard = self.shard(hash).write();
        let bucket = shard.bucket(fp);
        let Some(pos) = find_at(&shard, bucket, fp, expected) else {
            return false;
        };
        let slot = Shard::slot(bucket, pos);
        shard.locs[slot] = pack_location(fp, new);
        *shard.sigs[slot].get_mut() &= !HIT_BIT;
        true
    }

    /// The entry carrying the hash's fingerprint at exactly `location`.
    pub fn probe(&self, hash: u64, location: Location) -> Option<EntryInfo> {
        let fp = fingerprint(hash);
        let shard = self.shard(hash).read();
        let bucket = shard.bucket(fp);
        let pos = find_at(&shard, bucket, fp, location)?;
        Some(shard.info(bucket, pos, self.policy.ranks()))
    }

    /// Replace the expiration time of a key's entry, returning the previous one.
    ///
    /// Formats without expiration keep no time and report `0`.
    pub fn set_expire(
        &self,
        hash: u64,
        expire: u64,
        mut is_same: impl FnMut(Location) -> Result<bool>,
    ) -> Result<Option<u64>> {
        let fp = fingerprint(hash);
        let mut shard = self.shard(hash).write();
        let bucket = shard.bucket(fp);
        let len = shard.lens[bucket] as usize;
        for pos in 0..len {
            let slot = Shard::slot(bucket, pos);
            if !matches(shard.sigs[slot].load(Ordering::Relaxed), shard.locs[slot], fp) {
                continue;
            }
            if is_same(shard.location(slot))? {
                let previous = shard.expire(slot);
                if !shard.expires.is_empty() {
                    shard.expires[slot] = expire_to_secs(expire);
                }
                return Ok(Some(previous));
            }
        }
        Ok(None)
    }

    /// Remove every entry pointing into `segment`, returning how many were removed.
    ///
    /// This walks the whole index and is meant for segments whose records can no longer be enumerated.
    pub fn remove_segment(&self, segment: SegmentId) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            for bucket in 0..shard.buckets() {
                let mut pos = 0;
                while pos < shard.lens[bucket] as usize {
                    if shard.location(Shard::slot(bucket, pos)).segment == segment {
                        shard.remove_at(bucket, pos);
                        removed += 1;
                    } else {
                        pos += 1;
                    }
                }
            }
        }
        self.len.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    /// Write a snapshot of the index.
    pub fn save(&self, mut writer: impl Write) -> Result<()> {
        let header = IndexSnapshotHeader {
            format: self.format,
            shards: self.shards.len(),
            len: self.len(),
        };
        bincode::serialize_into(&mut writer, &header)?;
        for shard in self.shards.iter() {
            bincode::serialize_into(&mut writer, &*shard.read())?;
        }
        Ok(())
    }

    /// Replace the contents of the index with a snapshot written by [`MemoryIndex::save`].
    pub fn load(&self, mut reader: impl Read) -> Result<()> {
        let header: IndexSnapshotHeader = bincode::deserialize_from(&mut reader)?;
        if header.format != self.format || header.shards != self.shards.len() {
            return Err(Error::snapshot(
                "index.data",
                format!(
                    "snapshot has {shards} shards of format {format:?}, expected {expected} of {expected_format:?}",
                    shards = header.shards,
                    format = header.format,
                    expected = self.shards.len(),
                    expected_format = self.format,
                ),
            ));
        }
        let mut len = 0;
        for shard in self.shards.iter() {
            let loaded: Shard = bincode::deserialize_from(&mut reader)?;
            let slots = loaded.buckets() * BUCKET_SLOTS;
            let expires = if self.format.has_expire() { slots } else { 0 };
            if loaded.sigs.len() != slots || loaded.locs.len() != slots || loaded.expires.len() != expires {
                return Err(Error::snapshot("index.data", "shard slot arrays disagree with bucket count"));
            }
            len += loaded.len;
            *shard.write() = loaded;
        }
        self.len.store(len, Ordering::Relaxed);
        Ok(())
    }

    /// Visit every entry as `(fingerprint, location)`.
    pub fn for_each(&self, mut f: impl FnMut(u64, Location)) {
        for shard in self.shards.iter() {
            let shard = shard.read();
            for bucket in 0..shard.buckets() {
                for pos in 0..shard.lens[bucket] as usize {
                    let slot = Shard::slot(bucket, pos);
                    let sig = shard.sigs[slot].load(Ordering::Relaxed);
                    f(stored_fingerprint(sig, shard.locs[slot]), shard.location(slot));
                }
            }
        }
    }
}

fn find_at(shard: &Shard, bucket: usize, fp: u64, location: Location) -> Option<usize> {
    shard.position(bucket, fp, |slot| shard.location(slot) == location)
}
