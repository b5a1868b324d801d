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

use std::path::PathBuf;

/// Storage engine errors.
///
/// Capacity exhaustion is not an error: it is reported through return values so callers can apply backpressure.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error on a file-backed segment or a snapshot file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Structural corruption in a segment.
    #[error("segment {segment} corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Id of the corrupted segment.
        segment: u16,
        /// Offset of the corrupted structure.
        offset: usize,
        /// What was wrong.
        reason: String,
    },
    /// Compression codec error.
    #[error("codec error: {0}")]
    Codec(String),
    /// Snapshot serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] bincode::Error),
    /// Snapshot is missing or belongs to a different configuration.
    #[error("invalid snapshot {path:?}: {reason}")]
    Snapshot {
        /// Path of the snapshot file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a corruption error and report it.
    ///
    /// Corruption is never expected in a healthy process, so it is logged at error level where it is detected.
    pub fn corrupted(segment: u16, offset: usize, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!("[corruption]: segment {segment} offset {offset}: {reason}");
        Self::Corrupted {
            segment,
            offset,
            reason,
        }
    }

    /// Build a codec error.
    pub fn codec(e: impl std::fmt::Display) -> Self {
        Self::Codec(e.to_string())
    }

    /// Build a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Build a snapshot error.
    pub fn snapshot(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Snapshot {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a structural corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

/// Storage engine result.
pub type Result<T> = core::result::Result<T, Error>;
