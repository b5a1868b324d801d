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

use std::ops::Range;

use larder_common::clock;

use super::{encode_record_to_vec, record_len};

#[derive(Debug, Clone)]
struct BatchEntry {
    key: Range<usize>,
    value: Range<usize>,
    expire: u64,
}

/// A caller-owned buffer of records appended as one compressed block.
///
/// The batch is never shared: build it on the calling thread, hand it to the engine, and reuse it after
/// [`WriteBatch::clear`].
#[derive(Debug, Clone)]
pub struct WriteBatch {
    payload: Vec<u8>,
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl WriteBatch {
    /// Create a batch that accepts records until their encoded size reaches `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            entries: vec![],
            capacity,
        }
    }

    /// Add a record with an absolute expiration time in millis (`0` for never).
    ///
    /// Returns `false` without adding anything if the record would overflow a non-empty batch.
    pub fn put(&mut self, key: &[u8], value: &[u8], expire: u64) -> bool {
        let len = record_len(key.len(), value.len());
        if !self.entries.is_empty() && self.payload.len() + len > self.capacity {
            return false;
        }
        encode_record_to_vec(key, value, &mut self.payload);
        let value_start = self.payload.len() - value.len();
        let key_start = value_start - key.len();
        self.entries.push(BatchEntry {
            key: key_start..value_start,
            value: value_start..self.payload.len(),
            expire,
        });
        true
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded size of the records.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Drop all records, keeping the allocation.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.entries.clear();
    }

    /// Encoded records in insertion order.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Records as `(key, value, expire)`.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8], u64)> + '_ {
        self.entries.iter().map(|e| {
            (
                &self.payload[e.key.clone()],
                &self.payload[e.value.clone()],
                e.expire,
            )
        })
    }

    /// Sum and count of the relative TTLs of expiring records.
    pub(crate) fn ttl_stats(&self, now: u64) -> (u64, u64) {
        self.entries
            .iter()
            .filter_map(|e| clock::ttl(e.expire, now))
            .fold((0, 0), |(sum, count), ttl| (sum + ttl, count + 1))
    }

    /// Retain only the records for which `f` returns `true`.
    pub(crate) fn retain(&mut self, mut f: impl FnMut(&[u8], &[u8], u64) -> bool) {
        let mut kept = WriteBatch::new(self.capacity);
        for (key, value, expire) in self.iter() {
            // Retained records fit since they already fit together.
            if f(key, value, expire) {
                kept.put(key, value, expire);
            }
        }
        *self = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch() {
        let mut batch = WriteBatch::new(64);
        assert!(batch.put(b"k1", b"v1", 0));
        assert!(batch.put(b"k2", b"v2", 2_000));
        // Overflows the capacity.
        assert!(!batch.put(b"k3", &[0; 64], 0));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size(), 2 * record_len(2, 2));
        assert_eq!(batch.ttl_stats(1_000), (1_000, 1));

        let entries = batch.iter().map(|(k, v, e)| (k.to_vec(), v.to_vec(), e)).collect::<Vec<_>>();
        assert_eq!(
            entries,
            vec![(b"k1".to_vec(), b"v1".to_vec(), 0), (b"k2".to_vec(), b"v2".to_vec(), 2_000)]
        );

        batch.retain(|k, _, _| k == b"k2");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size(), record_len(2, 2));

        batch.clear();
        assert!(batch.is_empty());
        // An oversized record is accepted into an empty batch.
        assert!(batch.put(b"k3", &[0; 64], 0));
    }
}
