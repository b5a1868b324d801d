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

//! A segment-based embedded key-value cache.
//!
//! Values are packed into fixed-size segments, kept in memory or spilled to one file per segment, and found through
//! a compact memory index of fingerprints. A scavenger reclaims segments in the background, relocating records that
//! are still alive and dropping unpopular ones when space runs out.
//!
//! ```no_run
//! use larder_storage::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let engine = EngineBuilder::new().with_name("example").build()?;
//! engine.put(b"key", b"value", 0, false)?;
//! assert_eq!(engine.get_value(b"key")?.as_deref(), Some(&b"value"[..]));
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

/// Admission controllers.
pub mod admission;
/// Block compression.
pub mod compress;
/// Engine configuration.
pub mod config;
/// The engine facade.
pub mod engine;
/// Error types.
pub mod error;
/// Eviction policies over index buckets.
pub mod eviction;
/// The memory index.
pub mod index;
/// Record and block formats.
pub mod io;
/// Recycling selectors.
pub mod recycling;
/// Background compaction.
pub mod scavenger;
/// Segments.
pub mod segment;
/// Engine statistics.
pub mod statistics;
/// Write throughput control.
pub mod throughput;

mod manager;
mod snapshot;

/// Commonly used types.
pub mod prelude;
