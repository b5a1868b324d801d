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

//! Snapshot files under the cache directory.
//!
//! Each component writes its own bincode stream. Files are written to a temporary name and renamed into place, so
//! an interrupted save leaves the previous file of each component intact.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::{engine::EngineInner, error::Result};

/// Segment metadata and rank bindings.
pub(crate) const ENGINE_FILE: &str = "engine.data";
pub(crate) const INDEX_FILE: &str = "index.data";
pub(crate) const ADMISSION_FILE: &str = "ac.data";
pub(crate) const ADMISSION_QUEUE_FILE: &str = "aq.data";
pub(crate) const THROUGHPUT_FILE: &str = "tc.data";
pub(crate) const SCAVENGER_FILE: &str = "scav.data";
pub(crate) const RECYCLING_FILE: &str = "rc.data";
pub(crate) const DICTIONARY_DIR: &str = "dict";

/// Whether `dir` holds a complete snapshot.
pub(crate) fn exists(dir: &Path) -> bool {
    dir.join(ENGINE_FILE).is_file() && dir.join(INDEX_FILE).is_file()
}

fn write_file(dir: &Path, name: &str, f: impl FnOnce(&mut dyn Write) -> Result<()>) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let mut writer = BufWriter::new(File::create(&tmp)?);
    f(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

/// Read `name` under `dir` with `f`. Returns `false` if the file does not exist.
fn read_file(dir: &Path, name: &str, f: impl FnOnce(&mut dyn Read) -> Result<()>) -> Result<bool> {
    let path = dir.join(name);
    if !path.is_file() {
        return Ok(false);
    }
    let mut reader = BufReader::new(File::open(&path)?);
    f(&mut reader)?;
    Ok(true)
}

pub(crate) fn save(engine: &EngineInner) -> Result<()> {
    let dir = engine.dir.as_path();
    fs::create_dir_all(dir)?;

    // Dictionaries first: segments may hold blocks compressed with any of them.
    if let Some(compressor) = &engine.compressor {
        compressor.save(&dir.join(DICTIONARY_DIR))?;
    }
    write_file(dir, ENGINE_FILE, |w| engine.manager.save(dir, w))?;
    write_file(dir, INDEX_FILE, |w| engine.index.save(w))?;
    write_file(dir, ADMISSION_FILE, |w| engine.admission.save(w))?;
    if let Some(queue) = engine.admission.queue() {
        write_file(dir, ADMISSION_QUEUE_FILE, |w| queue.save(w))?;
    }
    if let Some(throughput) = &engine.throughput {
        write_file(dir, THROUGHPUT_FILE, |w| throughput.save(w))?;
    }
    write_file(dir, SCAVENGER_FILE, |w| engine.scavenger.save(w))?;
    write_file(dir, RECYCLING_FILE, |w| engine.recycling.save(w))?;

    tracing::debug!("[snapshot]: saved to {dir:?}");
    Ok(())
}

/// Load a snapshot written by [`save`]. Must run before the engine serves requests.
pub(crate) fn load(engine: &EngineInner) -> Result<()> {
    let dir = engine.dir.as_path();

    if let Some(compressor) = &engine.compressor {
        compressor.load(&dir.join(DICTIONARY_DIR))?;
    }
    read_file(dir, ENGINE_FILE, |r| engine.manager.load(dir, r))?;
    read_file(dir, INDEX_FILE, |r| engine.index.load(r))?;

    // Component state is optional: a snapshot taken with another admission or throughput setup still restores data.
    read_file(dir, ADMISSION_FILE, |r| engine.admission.load(r)).or_else(skip_incompatible(ADMISSION_FILE))?;
    if let Some(queue) = engine.admission.queue() {
        read_file(dir, ADMISSION_QUEUE_FILE, |r| queue.load(r)).or_else(skip_incompatible(ADMISSION_QUEUE_FILE))?;
    }
    if let Some(throughput) = &engine.throughput {
        read_file(dir, THROUGHPUT_FILE, |r| throughput.load(r)).or_else(skip_incompatible(THROUGHPUT_FILE))?;
    }
    read_file(dir, SCAVENGER_FILE, |r| engine.scavenger.load(r)).or_else(skip_incompatible(SCAVENGER_FILE))?;
    read_file(dir, RECYCLING_FILE, |r| engine.recycling.load(r)).or_else(skip_incompatible(RECYCLING_FILE))?;

    // The restored state diverges from the files once the engine serves requests: the next open must not see them
    // unless a later save replaces them.
    invalidate(dir)?;
    engine.manager.remove_restored_files(dir);

    tracing::debug!("[snapshot]: loaded from {dir:?}");
    Ok(())
}

/// Remove the files that mark `dir` as holding a complete snapshot.
fn invalidate(dir: &Path) -> Result<()> {
    for name in [ENGINE_FILE, INDEX_FILE] {
        match fs::remove_file(dir.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn skip_incompatible(name: &'static str) -> impl FnOnce(crate::error::Error) -> Result<bool> {
    move |e| {
        tracing::warn!("[snapshot]: skip {name}, state is reset: {e}");
        Ok(false)
    }
}
