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

use bytes::{Buf, BufMut};
use larder_common::{bits, strict_assert};

use super::{encode_record, find_last, record_len, Block, DataReader, DataWriter, SegmentCursor};
use crate::{
    error::{Error, Result},
    segment::Segment,
};

const SENTINEL: i32 = -1;

/// Header of a raw block.
///
/// The data size is stored twice around a sentinel so that a torn or overwritten header is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes of records following the header.
    pub data_size: u32,
}

impl BlockHeader {
    /// Serialized length.
    pub const fn serialized_len() -> usize {
        4 + 4 + 4
    }

    /// Write the header.
    pub fn write(&self, mut buf: impl BufMut) {
        buf.put_u32(self.data_size);
        buf.put_i32(SENTINEL);
        buf.put_u32(self.data_size);
    }

    /// Read and check the header of the block at `offset` of segment `segment`.
    pub fn read(mut buf: impl Buf, segment: u16, offset: usize) -> Result<Self> {
        let data_size = buf.get_u32();
        let sentinel = buf.get_i32();
        let echo = buf.get_u32();
        if sentinel != SENTINEL || data_size != echo {
            return Err(Error::corrupted(
                segment,
                offset,
                format!("block header mismatch, size: {data_size}, sentinel: {sentinel}, echo: {echo}"),
            ));
        }
        Ok(Self { data_size })
    }
}

/// Packs records into fixed-size blocks.
///
/// A record never crosses a block boundary: when it does not fit into the open block, a new block starts at the next
/// boundary. A record larger than a block gets an oversized block of its own.
#[derive(Debug)]
pub struct BlockDataWriter {
    block_size: usize,
}

impl BlockDataWriter {
    /// Create a writer for blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        strict_assert!(bits::is_pow2(block_size));
        Self { block_size }
    }
}

impl DataWriter for BlockDataWriter {
    fn append(&self, segment: &Segment, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<Option<u32>> {
        const HEADER: usize = BlockHeader::serialized_len();

        let len = record_len(key.len(), value.len());
        let mut body = segment.write();
        if !segment.is_active() {
            return Ok(None);
        }

        let (block_offset, write_offset) = if body.is_empty() {
            (0, HEADER)
        } else {
            let open = body.block_offset;
            let end = body.len();
            let open_is_empty = end == open + HEADER;
            if open_is_empty || end + len <= open + self.block_size {
                (open, end)
            } else {
                let next = bits::align_up(self.block_size, end);
                (next, next + HEADER)
            }
        };

        if write_offset + len > body.capacity() {
            return Ok(None);
        }

        let end = write_offset + len;
        let data_size = (end - block_offset - HEADER) as u32;
        let buf = body.memory_mut();
        encode_record(key, value, &mut buf[write_offset..end]);
        BlockHeader { data_size }.write(&mut buf[block_offset..block_offset + HEADER]);
        body.set_len(end);
        body.block_offset = block_offset;

        segment.record_append(&body, 1, ttl.unwrap_or_default(), ttl.is_some() as u64);
        tracing::trace!(
            "[block writer]: append {len} bytes to segment {id} block {block_offset}",
            id = segment.id()
        );
        Ok(Some(block_offset as u32))
    }

    fn max_record_len(&self, segment_size: usize) -> usize {
        segment_size - BlockHeader::serialized_len()
    }
}

/// Reads blocks written by [`BlockDataWriter`].
#[derive(Debug)]
pub struct BlockDataReader {
    block_size: usize,
    prefetch_size: usize,
}

impl BlockDataReader {
    /// Create a reader. File reads start with a window of `max(block_size, prefetch_size)` bytes.
    pub fn new(block_size: usize, prefetch_size: usize) -> Self {
        Self {
            block_size,
            prefetch_size: usize::max(block_size, prefetch_size),
        }
    }

    /// Parse the header at `offset` and return the length of the whole block.
    fn block_len(&self, cursor: &mut SegmentCursor<'_>, offset: usize) -> Result<usize> {
        const HEADER: usize = BlockHeader::serialized_len();

        let id = cursor.body().id();
        let window = cursor.read(offset, self.prefetch_size)?;
        if window.len() < HEADER {
            return Err(Error::corrupted(id, offset, "block header beyond written length"));
        }
        let header = BlockHeader::read(&window[..HEADER], id, offset)?;
        Ok(HEADER + header.data_size as usize)
    }

    /// Read the whole block at `offset`, re-reading if it exceeds the prefetched window.
    fn block_bytes<'c>(&self, cursor: &'c mut SegmentCursor<'_>, offset: usize) -> Result<&'c [u8]> {
        let id = cursor.body().id();
        let total = self.block_len(cursor, offset)?;
        let bytes = cursor.read(offset, total)?;
        if bytes.len() < total {
            return Err(Error::corrupted(
                id,
                offset,
                format!("block of {total} bytes exceeds written length"),
            ));
        }
        Ok(&bytes[BlockHeader::serialized_len()..])
    }
}

impl DataReader for BlockDataReader {
    fn read_block(&self, cursor: &mut SegmentCursor<'_>, offset: usize) -> Result<Block> {
        let id = cursor.body().id();
        let payload = self.block_bytes(cursor, offset)?.to_vec();
        let next = bits::align_up(self.block_size, offset + BlockHeader::serialized_len() + payload.len());
        Block::new(id, offset, next, payload)
    }

    fn find(
        &self,
        cursor: &mut SegmentCursor<'_>,
        offset: usize,
        key: &[u8],
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<bool> {
        let id = cursor.body().id();
        let payload = self.block_bytes(cursor, offset)?;
        match find_last(payload, key) {
            Some(Ok(value)) => {
                visit(value);
                Ok(true)
            }
            Some(Err(at)) => Err(Error::corrupted(id, offset, format!("truncated record at {at}"))),
            None => Ok(false),
        }
    }

    fn prefetch_size(&self) -> usize {
        self.prefetch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::SegmentScanner,
        segment::{segment_file_name, Segment},
    };

    const BLOCK: usize = 256;

    fn get(reader: &BlockDataReader, segment: &Segment, offset: u32, key: &[u8]) -> Option<Vec<u8>> {
        let body = segment.read();
        let mut cursor = SegmentCursor::new(&body, reader.prefetch_size());
        let mut out = None;
        reader
            .find(&mut cursor, offset as usize, key, &mut |v| out = Some(v.to_vec()))
            .unwrap();
        out
    }

    #[test]
    fn test_block_header() {
        let mut buf = vec![];
        BlockHeader { data_size: 42 }.write(&mut buf);
        assert_eq!(buf.len(), BlockHeader::serialized_len());
        assert_eq!(BlockHeader::read(&buf[..], 0, 0).unwrap(), BlockHeader { data_size: 42 });

        buf[11] ^= 1;
        assert!(BlockHeader::read(&buf[..], 0, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn test_records_never_cross_blocks() {
        let writer = BlockDataWriter::new(BLOCK);
        let reader = BlockDataReader::new(BLOCK, 0);
        let segment = Segment::new(0, 4 * BLOCK);
        segment.activate(0, 0);

        let value = vec![b'x'; 100];
        let mut offsets = vec![];
        for i in 0..6u8 {
            offsets.push(writer.append(&segment, &[i], &value, None).unwrap().unwrap());
        }
        // Two ~103 byte records fit a 256 byte block after its header.
        assert_eq!(offsets, vec![0, 0, 256, 256, 512, 512]);
        for (i, offset) in offsets.iter().enumerate() {
            assert_eq!(get(&reader, &segment, *offset, &[i as u8]), Some(value.clone()));
        }
        assert_eq!(get(&reader, &segment, 0, &[2]), None);

        // The last block is full, and the segment has no room for another one.
        assert_eq!(
            writer.append(&segment, &[9], &vec![0; 3 * BLOCK], None).unwrap(),
            None
        );
        assert_eq!(writer.append(&segment, &[6], &value, None).unwrap(), Some(768));
    }

    #[test]
    fn test_oversized_block() {
        let writer = BlockDataWriter::new(BLOCK);
        let reader = BlockDataReader::new(BLOCK, 0);
        let segment = Segment::new(0, 8 * BLOCK);
        segment.activate(0, 0);

        assert_eq!(writer.append(&segment, b"a", b"small", None).unwrap(), Some(0));
        let big = vec![7u8; 2 * BLOCK];
        assert_eq!(writer.append(&segment, b"b", &big, None).unwrap(), Some(256));
        assert_eq!(writer.append(&segment, b"c", b"after", None).unwrap(), Some(256 + 3 * BLOCK as u32));
        assert_eq!(get(&reader, &segment, 256, b"b"), Some(big));

        let body = segment.read();
        let mut scanner = SegmentScanner::new(&reader, &body);
        let mut keys = vec![];
        while let Some(block) = scanner.next_block().unwrap() {
            keys.extend(block.records().map(|(k, _)| k.to_vec()));
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_rewrite_in_same_block() {
        let writer = BlockDataWriter::new(BLOCK);
        let reader = BlockDataReader::new(BLOCK, 0);
        let segment = Segment::new(0, 4 * BLOCK);
        segment.activate(0, 0);

        let a = writer.append(&segment, b"k", b"old", None).unwrap().unwrap();
        let b = writer.append(&segment, b"k", b"new", None).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(get(&reader, &segment, a, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_sealed_rejects_appends() {
        let writer = BlockDataWriter::new(BLOCK);
        let segment = Segment::new(0, 4 * BLOCK);
        segment.activate(0, 0);
        segment.seal(None).unwrap();
        assert_eq!(writer.append(&segment, b"k", b"v", None).unwrap(), None);
    }

    #[test_log::test]
    fn test_file_segment_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let writer = BlockDataWriter::new(BLOCK);
        // The prefetch window is a single block, so the oversized block needs a re-read.
        let reader = BlockDataReader::new(BLOCK, 0);
        let segment = Segment::new(5, 16 * BLOCK);
        segment.activate(0, 0);

        let big = (0..4 * BLOCK).map(|i| i as u8).collect::<Vec<_>>();
        let small = writer.append(&segment, b"small", b"value", None).unwrap().unwrap();
        let large = writer.append(&segment, b"large", &big, None).unwrap().unwrap();
        segment.seal(Some(&dir.path().join(segment_file_name(5)))).unwrap();

        assert!(!segment.read().is_memory());
        assert_eq!(get(&reader, &segment, small, b"small"), Some(b"value".to_vec()));
        assert_eq!(get(&reader, &segment, large, b"large"), Some(big));
    }

    #[test_log::test]
    fn test_corrupted_header() {
        let writer = BlockDataWriter::new(BLOCK);
        let reader = BlockDataReader::new(BLOCK, 0);
        let segment = Segment::new(0, 4 * BLOCK);
        segment.activate(0, 0);
        let offset = writer.append(&segment, b"k", b"v", None).unwrap().unwrap();
        segment.write().memory_mut()[4] = 0;

        let body = segment.read();
        let mut cursor = SegmentCursor::new(&body, reader.prefetch_size());
        let err = reader.find(&mut cursor, offset as usize, b"k", &mut |_| {}).unwrap_err();
        assert!(err.is_corruption());
    }
}
