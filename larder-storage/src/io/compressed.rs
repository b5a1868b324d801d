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

use std::sync::Arc;

use bytes::{Buf, BufMut};

use super::{encode_record_to_vec, record_len, Block, DataReader, DataWriter, SegmentCursor, WriteBatch};
use crate::{
    compress::{Compressor, RAW},
    error::{Error, Result},
    segment::Segment,
};

/// Header of a compressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedBlockHeader {
    /// Size of the decoded records.
    pub uncompressed_size: u32,
    /// Dictionary version, see [`crate::compress::RAW`] and [`crate::compress::NO_DICTIONARY`].
    pub dictionary_version: i32,
    /// Size of the payload following the header.
    pub compressed_size: u32,
}

impl CompressedBlockHeader {
    /// Serialized length.
    pub const fn serialized_len() -> usize {
        4 + 4 + 4
    }

    /// Write the header.
    pub fn write(&self, mut buf: impl BufMut) {
        buf.put_u32(self.uncompressed_size);
        buf.put_i32(self.dictionary_version);
        buf.put_u32(self.compressed_size);
    }

    /// Read and sanity check the header of the block at `offset` of segment `segment`.
    pub fn read(mut buf: impl Buf, segment: u16, offset: usize) -> Result<Self> {
        let header = Self {
            uncompressed_size: buf.get_u32(),
            dictionary_version: buf.get_i32(),
            compressed_size: buf.get_u32(),
        };
        let raw_mismatch = header.dictionary_version == RAW && header.compressed_size != header.uncompressed_size;
        if header.dictionary_version < RAW || header.compressed_size == 0 || raw_mismatch {
            return Err(Error::corrupted(segment, offset, format!("invalid compressed block header {header:?}")));
        }
        Ok(header)
    }
}

/// Appends each record, or each [`WriteBatch`], as one compressed block.
#[derive(Debug)]
pub struct CompressedBlockDataWriter {
    compressor: Arc<Compressor>,
}

impl CompressedBlockDataWriter {
    /// Create a writer backed by a shared compressor.
    pub fn new(compressor: Arc<Compressor>) -> Self {
        Self { compressor }
    }

    fn write_block(&self, segment: &Segment, raw: &[u8], items: u32, ttl: (u64, u64)) -> Result<Option<u32>> {
        const HEADER: usize = CompressedBlockHeader::serialized_len();

        // Compress before taking the segment lock.
        let (dictionary_version, payload) = self.compressor.compress(raw)?;
        let header = CompressedBlockHeader {
            uncompressed_size: raw.len() as u32,
            dictionary_version,
            compressed_size: payload.len() as u32,
        };

        let mut body = segment.write();
        if !segment.is_active() {
            return Ok(None);
        }
        let offset = body.len();
        let end = offset + HEADER + payload.len();
        if end > body.capacity() {
            return Ok(None);
        }
        let buf = body.memory_mut();
        header.write(&mut buf[offset..offset + HEADER]);
        buf[offset + HEADER..end].copy_from_slice(&payload);
        body.set_len(end);
        segment.record_append(&body, items, ttl.0, ttl.1);
        tracing::trace!(
            "[compressed writer]: append block of {items} records, {raw} -> {compressed} bytes, dictionary {dictionary_version} to segment {id} at {offset}",
            raw = raw.len(),
            compressed = payload.len(),
            id = segment.id(),
        );
        Ok(Some(offset as u32))
    }
}

impl DataWriter for CompressedBlockDataWriter {
    fn append(&self, segment: &Segment, key: &[u8], value: &[u8], ttl: Option<u64>) -> Result<Option<u32>> {
        let mut raw = Vec::with_capacity(record_len(key.len(), value.len()));
        encode_record_to_vec(key, value, &mut raw);
        self.compressor.sample(value);
        self.write_block(segment, &raw, 1, (ttl.unwrap_or_default(), ttl.is_some() as u64))
    }

    fn append_batch(&self, segment: &Segment, batch: &WriteBatch, now: u64) -> Result<Option<u32>> {
        if batch.is_empty() {
            return Ok(None);
        }
        for (_, value, _) in batch.iter() {
            self.compressor.sample(value);
        }
        self.write_block(segment, batch.payload(), batch.len() as u32, batch.ttl_stats(now))
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn max_record_len(&self, segment_size: usize) -> usize {
        // A record that does not compress is stored raw.
        segment_size - CompressedBlockHeader::serialized_len()
    }
}

/// Reads blocks written by [`CompressedBlockDataWriter`].
#[derive(Debug)]
pub struct CompressedBlockDataReader {
    compressor: Arc<Compressor>,
    prefetch_size: usize,
}

impl CompressedBlockDataReader {
    /// Create a reader. File reads start with a window of `prefetch_size` bytes.
    pub fn new(compressor: Arc<Compressor>, prefetch_size: usize) -> Self {
        Self {
            compressor,
            prefetch_size: usize::max(prefetch_size, CompressedBlockHeader::serialized_len()),
        }
    }
}

impl DataReader for CompressedBlockDataReader {
    fn read_block(&self, cursor: &mut SegmentCursor<'_>, offset: usize) -> Result<Block> {
        const HEADER: usize = CompressedBlockHeader::serialized_len();

        let id = cursor.body().id();
        let header = {
            let window = cursor.read(offset, self.prefetch_size)?;
            if window.len() < HEADER {
                return Err(Error::corrupted(id, offset, "block header beyond written length"));
            }
            CompressedBlockHeader::read(&window[..HEADER], id, offset)?
        };
        let total = HEADER + header.compressed_size as usize;
        let bytes = cursor.read(offset, total)?;
        if bytes.len() < total {
            return Err(Error::corrupted(
                id,
                offset,
                format!("block of {total} bytes exceeds written length"),
            ));
        }
        let payload = self
            .compressor
            .decompress(
                header.dictionary_version,
                &bytes[HEADER..],
                header.uncompressed_size as usize,
            )
            .map_err(|e| Error::corrupted(id, offset, format!("undecodable block payload: {e}")))?;
        Block::new(id, offset, offset + total, payload)
    }

    fn prefetch_size(&self) -> usize {
        self.prefetch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compress::{Codec, NO_DICTIONARY},
        config::CompressionConfig,
        io::SegmentScanner,
        segment::segment_file_name,
    };

    fn compressor(codec: Codec) -> Arc<Compressor> {
        Arc::new(Compressor::new(CompressionConfig {
            enabled: true,
            codec,
            dictionary_enabled: false,
            ..Default::default()
        }))
    }

    fn get(reader: &CompressedBlockDataReader, segment: &Segment, offset: u32, key: &[u8]) -> Option<Vec<u8>> {
        let body = segment.read();
        let mut cursor = SegmentCursor::new(&body, reader.prefetch_size());
        let mut out = None;
        reader
            .find(&mut cursor, offset as usize, key, &mut |v| out = Some(v.to_vec()))
            .unwrap();
        out
    }

    #[test]
    fn test_compressed_header() {
        let mut buf = vec![];
        let header = CompressedBlockHeader {
            uncompressed_size: 100,
            dictionary_version: NO_DICTIONARY,
            compressed_size: 40,
        };
        header.write(&mut buf);
        assert_eq!(CompressedBlockHeader::read(&buf[..], 0, 0).unwrap(), header);

        let mut buf = vec![];
        CompressedBlockHeader {
            uncompressed_size: 100,
            dictionary_version: RAW,
            compressed_size: 40,
        }
        .write(&mut buf);
        assert!(CompressedBlockHeader::read(&buf[..], 0, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn test_single_and_batch_blocks() {
        for codec in [Codec::Zstd, Codec::Lz4] {
            let compressor = compressor(codec);
            let writer = CompressedBlockDataWriter::new(compressor.clone());
            let reader = CompressedBlockDataReader::new(compressor, 4096);
            let segment = Segment::new(0, 64 * 1024);
            segment.activate(0, 0);

            let single = writer.append(&segment, b"single", &[b'z'; 1000], None).unwrap().unwrap();
            let mut batch = WriteBatch::new(4096);
            for i in 0..10u8 {
                assert!(batch.put(&[b'b', i], &[i; 200], 0));
            }
            let batched = writer.append_batch(&segment, &batch, 0).unwrap().unwrap();
            assert!(batched > single);
            assert!(segment.used() < 1000 + 10 * 200);

            assert_eq!(get(&reader, &segment, single, b"single"), Some(vec![b'z'; 1000]));
            for i in 0..10u8 {
                assert_eq!(get(&reader, &segment, batched, &[b'b', i]), Some(vec![i; 200]));
            }
            assert_eq!(segment.info().total_items, 11);

            let body = segment.read();
            let mut scanner = SegmentScanner::new(&reader, &body);
            let mut blocks = vec![];
            while let Some(block) = scanner.next_block().unwrap() {
                blocks.push((block.offset, block.len()));
            }
            assert_eq!(blocks, vec![(single as usize, 1), (batched as usize, 10)]);
        }
    }

    #[test]
    fn test_compressed_file_segment() {
        let dir = tempfile::tempdir().unwrap();
        let compressor = compressor(Codec::Zstd);
        let writer = CompressedBlockDataWriter::new(compressor.clone());
        // A prefetch window smaller than the block forces a second read.
        let reader = CompressedBlockDataReader::new(compressor, 16);
        let segment = Segment::new(1, 64 * 1024);
        segment.activate(0, 0);

        let value = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let offset = writer.append(&segment, b"k", &value, None).unwrap().unwrap();
        segment.seal(Some(&dir.path().join(segment_file_name(1)))).unwrap();
        assert_eq!(get(&reader, &segment, offset, b"k"), Some(value));
        assert_eq!(get(&reader, &segment, offset, b"other"), None);
    }

    #[test]
    fn test_damaged_payload_is_corruption() {
        let compressor = compressor(Codec::Zstd);
        let writer = CompressedBlockDataWriter::new(compressor.clone());
        let reader = CompressedBlockDataReader::new(compressor, 4096);
        let segment = Segment::new(0, 64 * 1024);
        segment.activate(0, 0);

        let value = (0..2000u32).map(|i| (i % 13) as u8).collect::<Vec<_>>();
        let offset = writer.append(&segment, b"k", &value, None).unwrap().unwrap() as usize;
        {
            let mut body = segment.write();
            body.memory_mut()[offset + 14..offset + 30]
                .iter_mut()
                .for_each(|b| *b ^= 0xff);
        }

        let body = segment.read();
        let mut cursor = SegmentCursor::new(&body, reader.prefetch_size());
        let err = reader.find(&mut cursor, offset, b"k", &mut |_| {}).unwrap_err();
        assert!(err.is_corruption(), "{err:?}");

        let mut scanner = SegmentScanner::new(&reader, &body);
        assert!(scanner.next_block().unwrap_err().is_corruption());
    }

    #[test]
    fn test_full_segment() {
        let writer = CompressedBlockDataWriter::new(compressor(Codec::Lz4));
        let segment = Segment::new(0, 256);
        segment.activate(0, 0);
        let incompressible = (0..240u32).map(|i| (i * 7919 % 256) as u8).collect::<Vec<_>>();
        assert!(writer.append(&segment, b"a", &incompressible, None).unwrap().is_some());
        assert_eq!(writer.append(&segment, b"b", &incompressible, None).unwrap(), None);
    }
}
