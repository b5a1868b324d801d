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

//! Record codecs of segments.
//!
//! A [`DataWriter`] appends records into an active segment and returns the offset the index should point at. A
//! [`DataReader`] decodes the block at such an offset, and a [`SegmentScanner`] walks all blocks of a segment in
//! append order.

/// Write batches for batching writers.
pub mod batch;
/// The raw block format.
pub mod block;
/// The compressed block format.
pub mod compressed;

use std::{fmt::Debug, ops::Range};

use larder_common::varint;

pub use self::{
    batch::WriteBatch,
    block::{BlockDataReader, BlockDataWriter},
    compressed::{CompressedBlockDataReader, CompressedBlockDataWriter},
};
use crate::{
    error::{Error, Result},
    segment::{Segment, SegmentBody},
};

/// Encoded length of a record.
pub fn record_len(key_len: usize, value_len: usize) -> usize {
    varint::encoded_len(key_len as u64) + varint::encoded_len(value_len as u64) + key_len + value_len
}

/// Encode a record into the beginning of `buf`, returning the encoded length.
pub fn encode_record(key: &[u8], value: &[u8], buf: &mut [u8]) -> usize {
    let mut cursor = varint::encode(key.len() as u64, buf);
    cursor += varint::encode(value.len() as u64, &mut buf[cursor..]);
    buf[cursor..cursor + key.len()].copy_from_slice(key);
    cursor += key.len();
    buf[cursor..cursor + value.len()].copy_from_slice(value);
    cursor + value.len()
}

/// Append an encoded record to `buf`.
pub fn encode_record_to_vec(key: &[u8], value: &[u8], buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.resize(start + record_len(key.len(), value.len()), 0);
    encode_record(key, value, &mut buf[start..]);
}

/// Position of a record inside a decoded payload.
#[derive(Debug, Clone)]
pub struct RecordRange {
    /// Key bytes.
    pub key: Range<usize>,
    /// Value bytes.
    pub value: Range<usize>,
}

/// Decode the record at the beginning of `buf`. Returns `None` if `buf` ends mid-record.
pub fn decode_record(buf: &[u8]) -> Option<(RecordRange, usize)> {
    let (key_len, n1) = varint::decode(buf)?;
    let (value_len, n2) = varint::decode(&buf[n1..])?;
    let key_start = n1 + n2;
    let value_start = key_start.checked_add(key_len as usize)?;
    let end = value_start.checked_add(value_len as usize)?;
    if end > buf.len() {
        return None;
    }
    Some((
        RecordRange {
            key: key_start..value_start,
            value: value_start..end,
        },
        end,
    ))
}

/// Find the last record with `key` in a run of encoded records.
///
/// The last copy wins because a key rewritten into the same block supersedes its earlier copy.
pub fn find_last<'a>(payload: &'a [u8], key: &[u8]) -> Option<std::result::Result<&'a [u8], usize>> {
    let mut cursor = 0;
    let mut found = None;
    while cursor < payload.len() {
        match decode_record(&payload[cursor..]) {
            Some((range, len)) => {
                let base = cursor;
                if &payload[base + range.key.start..base + range.key.end] == key {
                    found = Some(Ok(&payload[base + range.value.start..base + range.value.end]));
                }
                cursor += len;
            }
            None => return Some(Err(cursor)),
        }
    }
    found
}

/// A decoded block.
#[derive(Debug)]
pub struct Block {
    /// Offset of the block in its segment. The index points at it.
    pub offset: usize,
    /// Offset of the following block.
    pub next: usize,
    payload: Vec<u8>,
    records: Vec<RecordRange>,
}

impl Block {
    /// Parse the records of a decoded payload.
    pub fn new(segment: u16, offset: usize, next: usize, payload: Vec<u8>) -> Result<Self> {
        let mut records = vec![];
        let mut cursor = 0;
        while cursor < payload.len() {
            let (range, len) = decode_record(&payload[cursor..])
                .ok_or_else(|| Error::corrupted(segment, offset, format!("truncated record at {cursor}")))?;
            records.push(RecordRange {
                key: cursor + range.key.start..cursor + range.key.end,
                value: cursor + range.value.start..cursor + range.value.end,
            });
            cursor += len;
        }
        Ok(Self {
            offset,
            next,
            payload,
            records,
        })
    }

    /// Number of records in the block.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the block holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in append order.
    pub fn records(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.records
            .iter()
            .map(|r| (&self.payload[r.key.clone()], &self.payload[r.value.clone()]))
    }

    /// Records that are not superseded by a later copy of the same key in this block.
    pub fn latest_records(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        let keys = self.records.iter().map(|r| &self.payload[r.key.clone()]).collect::<Vec<_>>();
        self.records().enumerate().filter_map(move |(i, (key, value))| {
            if keys[i + 1..].contains(&key) {
                None
            } else {
                Some((key, value))
            }
        })
    }

    /// The value of the last record with `key`.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.records().filter(|(k, _)| *k == key).last().map(|(_, v)| v)
    }
}

/// A read cursor over a locked segment.
///
/// Memory segments are borrowed in place. File segments are read through a window of at least `hint` bytes that is
/// refilled when a request falls outside of it.
#[derive(Debug)]
pub struct SegmentCursor<'a> {
    body: &'a SegmentBody,
    hint: usize,
    window_offset: usize,
    window: Vec<u8>,
}

impl<'a> SegmentCursor<'a> {
    /// Create a cursor with a read window hint.
    pub fn new(body: &'a SegmentBody, hint: usize) -> Self {
        Self::with_buffer(body, hint, Vec::new())
    }

    /// Create a cursor reusing `buffer` as its file read window.
    pub fn with_buffer(body: &'a SegmentBody, hint: usize, buffer: Vec<u8>) -> Self {
        Self {
            body,
            hint,
            window_offset: 0,
            window: buffer,
        }
    }

    /// The segment under the cursor.
    pub fn body(&self) -> &'a SegmentBody {
        self.body
    }

    /// Give the window buffer back.
    pub fn into_buffer(self) -> Vec<u8> {
        self.window
    }

    /// Bytes in `[offset, offset + len)`, clamped to the written length of the segment.
    pub fn read(&mut self, offset: usize, len: usize) -> Result<&[u8]> {
        if let Some(memory) = self.body.memory() {
            if offset > memory.len() {
                return Err(Error::corrupted(self.body.id(), offset, "read beyond written length"));
            }
            let end = usize::min(offset + len, memory.len());
            return Ok(&memory[offset..end]);
        }

        if offset > self.body.len() {
            return Err(Error::corrupted(self.body.id(), offset, "read beyond written length"));
        }
        let end = usize::min(offset + len, self.body.len());
        let cached_end = self.window_offset + self.window.len();
        if offset < self.window_offset || end > cached_end || self.window.is_empty() {
            let window_len = usize::max(len, self.hint);
            let mut buffer = std::mem::take(&mut self.window);
            let loaded = self.body.load(offset, window_len, &mut buffer)?.len();
            buffer.truncate(loaded);
            self.window = buffer;
            self.window_offset = offset;
        }
        let start = offset - self.window_offset;
        Ok(&self.window[start..start + (end - offset)])
    }
}

/// Appends records into active segments.
pub trait DataWriter: Send + Sync + Debug + 'static {
    /// Append a record.
    ///
    /// `ttl` is the relative time to live of an expiring item, used for segment statistics.
    ///
    /// Returns the offset the index entry points at, or `None` if the segment has no room or is no longer active.
    fn append(&self, segment: &Segment, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<Option<u32>>;

    /// Append all records of a batch as one unit. Only batching writers support it.
    fn append_batch(&self, segment: &Segment, batch: &WriteBatch, now: u64) -> Result<Option<u32>> {
        let _ = (segment, batch, now);
        Err(Error::Other(anyhow::anyhow!("writer does not support batches")))
    }

    /// Whether [`DataWriter::append_batch`] is supported.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Largest encoded record that can be appended to an empty segment of `segment_size` bytes.
    fn max_record_len(&self, segment_size: usize) -> usize;
}

/// Locates and decodes records of sealed or active segments.
pub trait DataReader: Send + Sync + Debug + 'static {
    /// Decode the block at `offset`.
    fn read_block(&self, cursor: &mut SegmentCursor<'_>, offset: usize) -> Result<Block>;

    /// Find the latest record with `key` in the block at `offset` and pass its value to `visit`.
    ///
    /// Returns whether the key was found.
    fn find(
        &self,
        cursor: &mut SegmentCursor<'_>,
        offset: usize,
        key: &[u8],
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<bool> {
        let block = self.read_block(cursor, offset)?;
        match block.find(key) {
            Some(value) => {
                visit(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read window size used for point reads of file segments.
    fn prefetch_size(&self) -> usize;
}

/// Walks the blocks of a segment in append order.
#[derive(Debug)]
pub struct SegmentScanner<'a> {
    reader: &'a dyn DataReader,
    cursor: SegmentCursor<'a>,
    offset: usize,
}

impl<'a> SegmentScanner<'a> {
    /// Read window used for scanning file segments.
    pub const IO_SIZE_HINT: usize = 64 * 1024;

    /// Create a scanner over a locked segment.
    pub fn new(reader: &'a dyn DataReader, body: &'a SegmentBody) -> Self {
        Self {
            reader,
            cursor: SegmentCursor::new(body, Self::IO_SIZE_HINT),
            offset: 0,
        }
    }

    /// The next block, or `None` after the last one.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.offset >= self.cursor.body().len() {
            return Ok(None);
        }
        let block = self.reader.read_block(&mut self.cursor, self.offset)?;
        if block.next <= self.offset {
            return Err(Error::corrupted(
                self.cursor.body().id(),
                self.offset,
                "block does not advance the scan",
            ));
        }
        self.offset = block.next;
        Ok(Some(block))
    }
}
