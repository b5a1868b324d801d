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

//! Block compression codecs and zstd dictionaries.

use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use zstd::dict::{DecoderDictionary, EncoderDictionary};

use crate::{
    config::CompressionConfig,
    error::{Error, Result},
};

/// Dictionary version of a block stored uncompressed.
pub const RAW: i32 = -1;
/// Dictionary version of a block compressed without a dictionary.
pub const NO_DICTIONARY: i32 = 0;

/// Largest single value kept as a dictionary training sample.
const MAX_SAMPLE_LEN: usize = 64 * 1024;

/// Compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// zstd, with optional trained dictionaries.
    Zstd,
    /// lz4 block format.
    Lz4,
}

struct Dictionary {
    raw: Vec<u8>,
    encoder: EncoderDictionary<'static>,
    decoder: DecoderDictionary<'static>,
}

impl Dictionary {
    fn new(raw: Vec<u8>, level: i32) -> Self {
        let encoder = EncoderDictionary::copy(&raw, level);
        let decoder = DecoderDictionary::copy(&raw);
        Self { raw, encoder, decoder }
    }
}

#[derive(Default)]
struct Samples {
    values: Vec<Vec<u8>>,
    bytes: usize,
}

/// Compresses and decompresses block payloads.
///
/// Every dictionary version ever trained stays available for decompression, since blocks reference the version
/// they were compressed with.
pub struct Compressor {
    config: CompressionConfig,
    dictionaries: RwLock<Vec<Arc<Dictionary>>>,
    samples: Mutex<Samples>,
    trained: AtomicBool,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("codec", &self.config.codec)
            .field("level", &self.config.level)
            .field("dictionaries", &self.dictionaries.read().len())
            .finish()
    }
}

impl Compressor {
    /// Create a compressor without dictionaries.
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            dictionaries: RwLock::new(vec![]),
            samples: Mutex::new(Samples::default()),
            trained: AtomicBool::new(false),
        }
    }

    fn dictionaries_enabled(&self) -> bool {
        self.config.codec == Codec::Zstd && self.config.dictionary_enabled
    }

    /// The newest dictionary version, or [`NO_DICTIONARY`].
    pub fn current_version(&self) -> i32 {
        self.dictionaries.read().len() as i32
    }

    /// Compress `src`.
    ///
    /// Returns the dictionary version and the payload. The payload is `src` itself with version [`RAW`] when
    /// compression does not shrink it.
    pub fn compress(&self, src: &[u8]) -> Result<(i32, Vec<u8>)> {
        let (version, compressed) = match self.config.codec {
            Codec::Zstd => {
                let dictionary = {
                    let dictionaries = self.dictionaries.read();
                    dictionaries.last().cloned().map(|d| (dictionaries.len() as i32, d))
                };
                match dictionary {
                    Some((version, dictionary)) => {
                        let mut compressor = zstd::bulk::Compressor::with_prepared_dictionary(&dictionary.encoder)
                            .map_err(Error::codec)?;
                        (version, compressor.compress(src).map_err(Error::codec)?)
                    }
                    None => (NO_DICTIONARY, zstd::bulk::compress(src, self.config.level).map_err(Error::codec)?),
                }
            }
            Codec::Lz4 => {
                let mode = if self.config.level > 0 {
                    lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level)
                } else {
                    lz4::block::CompressionMode::DEFAULT
                };
                (NO_DICTIONARY, lz4::block::compress(src, Some(mode), false).map_err(Error::codec)?)
            }
        };
        if compressed.len() >= src.len() {
            return Ok((RAW, src.to_vec()));
        }
        Ok((version, compressed))
    }

    /// Decompress a payload compressed with dictionary `version` into `uncompressed_len` bytes.
    ///
    /// Every failure is reported as [`Error::Codec`].
    pub fn decompress(&self, version: i32, src: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match (version, self.config.codec) {
            (RAW, _) => src.to_vec(),
            (NO_DICTIONARY, Codec::Zstd) => zstd::bulk::decompress(src, uncompressed_len).map_err(Error::codec)?,
            (NO_DICTIONARY, Codec::Lz4) => {
                lz4::block::decompress(src, Some(uncompressed_len as i32)).map_err(Error::codec)?
            }
            (v, Codec::Zstd) if v > 0 => {
                let dictionary = self
                    .dictionaries
                    .read()
                    .get(v as usize - 1)
                    .cloned()
                    .ok_or_else(|| Error::codec(format!("unknown dictionary version {v}")))?;
                let mut decompressor =
                    zstd::bulk::Decompressor::with_prepared_dictionary(&dictionary.decoder).map_err(Error::codec)?;
                decompressor.decompress(src, uncompressed_len).map_err(Error::codec)?
            }
            (v, codec) => return Err(Error::codec(format!("invalid dictionary version {v} for {codec:?}"))),
        };
        if out.len() != uncompressed_len {
            return Err(Error::codec(format!(
                "decompressed {} bytes, expected {uncompressed_len}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Offer a value as dictionary training data. Trains a dictionary once enough samples are collected.
    pub fn sample(&self, value: &[u8]) {
        if !self.dictionaries_enabled() || self.trained.load(Ordering::Relaxed) {
            return;
        }
        let samples = {
            let mut samples = self.samples.lock();
            samples.values.push(value[..usize::min(value.len(), MAX_SAMPLE_LEN)].to_vec());
            samples.bytes += value.len();
            if samples.bytes < self.config.dictionary_training_bytes {
                return;
            }
            std::mem::take(&mut *samples)
        };
        self.train(samples);
    }

    fn train(&self, samples: Samples) {
        match zstd::dict::from_samples(&samples.values, self.config.dictionary_size) {
            Ok(raw) => {
                let mut dictionaries = self.dictionaries.write();
                dictionaries.push(Arc::new(Dictionary::new(raw, self.config.level)));
                self.trained.store(true, Ordering::Relaxed);
                tracing::debug!(
                    "[compressor]: trained dictionary version {version} from {count} samples ({bytes} bytes)",
                    version = dictionaries.len(),
                    count = samples.values.len(),
                    bytes = samples.bytes,
                );
            }
            Err(e) => {
                tracing::warn!(
                    "[compressor]: dictionary training failed on {count} samples, will retry: {e}",
                    count = samples.values.len()
                );
            }
        }
    }

    /// Persist all dictionaries as `<version>.dict` under `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let dictionaries = self.dictionaries.read();
        if dictionaries.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(dir)?;
        for (i, dictionary) in dictionaries.iter().enumerate() {
            fs::write(dir.join(format!("{}.dict", i + 1)), &dictionary.raw)?;
        }
        Ok(())
    }

    /// Load dictionaries persisted by [`Compressor::save`].
    pub fn load(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let mut versions = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let version = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".dict"))
                .and_then(|v| v.parse::<usize>().ok());
            if let Some(version) = version {
                versions.push((version, path));
            }
        }
        let versions = versions.into_iter().sorted_by_key(|(v, _)| *v).collect_vec();
        for (i, (version, path)) in versions.iter().enumerate() {
            if *version != i + 1 {
                return Err(Error::snapshot(path, format!("dictionary version gap before {version}")));
            }
        }
        let mut dictionaries = self.dictionaries.write();
        dictionaries.clear();
        for (_, path) in versions {
            dictionaries.push(Arc::new(Dictionary::new(fs::read(&path)?, self.config.level)));
        }
        if !dictionaries.is_empty() {
            self.trained.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn config(codec: Codec) -> CompressionConfig {
        CompressionConfig {
            enabled: true,
            codec,
            dictionary_size: 4 * 1024,
            dictionary_training_bytes: 256 * 1024,
            ..Default::default()
        }
    }

    fn text(rng: &mut StdRng) -> Vec<u8> {
        const WORDS: &[&str] = &["user", "session", "token", "expires", "region", "cart", "item", "price"];
        let mut s = String::from("{");
        for _ in 0..rng.random_range(8..24) {
            let word = WORDS[rng.random_range(0..WORDS.len())];
            s.push_str(&format!("\"{word}\":{},", rng.random_range(0..10_000)));
        }
        s.push('}');
        s.into_bytes()
    }

    #[test]
    fn test_compress_fallback_to_raw() {
        let mut rng = StdRng::seed_from_u64(42);
        let random = (0..256).map(|_| rng.random::<u8>()).collect::<Vec<_>>();
        for codec in [Codec::Zstd, Codec::Lz4] {
            let compressor = Compressor::new(config(codec));
            let (version, payload) = compressor.compress(&random).unwrap();
            assert_eq!(version, RAW);
            assert_eq!(payload, random);
            assert_eq!(compressor.decompress(version, &payload, random.len()).unwrap(), random);

            let repetitive = vec![b'a'; 4096];
            let (version, payload) = compressor.compress(&repetitive).unwrap();
            assert_eq!(version, NO_DICTIONARY);
            assert!(payload.len() < repetitive.len());
            assert_eq!(compressor.decompress(version, &payload, repetitive.len()).unwrap(), repetitive);
        }
    }

    #[test_log::test]
    fn test_dictionary_training_and_persistence() {
        let mut rng = StdRng::seed_from_u64(7);
        let compressor = Compressor::new(config(Codec::Zstd));
        while compressor.current_version() == NO_DICTIONARY {
            compressor.sample(&text(&mut rng));
        }
        assert_eq!(compressor.current_version(), 1);

        let value = text(&mut rng);
        let (version, payload) = compressor.compress(&value).unwrap();
        assert_eq!(version, 1);
        assert_eq!(compressor.decompress(version, &payload, value.len()).unwrap(), value);
        assert!(compressor.decompress(2, &payload, value.len()).is_err());

        let dir = tempfile::tempdir().unwrap();
        compressor.save(dir.path()).unwrap();
        let restored = Compressor::new(config(Codec::Zstd));
        restored.load(dir.path()).unwrap();
        assert_eq!(restored.current_version(), 1);
        assert_eq!(restored.decompress(version, &payload, value.len()).unwrap(), value);
    }
}
