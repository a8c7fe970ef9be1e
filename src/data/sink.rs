//! Persistence seam.
//!
//! A sink receives an `EpisodeSource` (which streams/fields exist plus per-field accessors)
//! and writes it under the task directory. The default sink writes one grouped container
//! per episode: `{task_dir}/{index}.json`, an object of stream -> field -> array.
//! The alignment pipeline (`align::pipeline::DiffFreqSink`) plugs in through the same trait.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Serialize;

use crate::data::value::{FieldValue, StreamMap};
use crate::error::{DataError, PersistError};

/// Extension of single-container episodes.
pub const CONTAINER_EXT: &str = "json";
/// Prefix of per-episode directories.
pub const EPISODE_DIR_PREFIX: &str = "episode";

/// Read access to one accumulated episode.
pub trait EpisodeSource {
    /// Stream name -> field names present.
    fn mapping(&self) -> StreamMap;

    /// Every value of `field` for `stream`, in capture order.
    fn field(&self, stream: &str, field: &str) -> Option<Vec<FieldValue>>;

    fn require(&self, stream: &str, field: &str) -> Result<Vec<FieldValue>, DataError> {
        if !self.mapping().contains_key(stream) {
            return Err(DataError::MissingStream(stream.to_string()));
        }
        self.field(stream, field).ok_or_else(|| DataError::MissingField {
            stream: stream.to_string(),
            field: field.to_string(),
        })
    }
}

/// Writes an episode and returns the path it produced.
pub trait EpisodeSink: Send {
    fn persist(
        &mut self,
        source: &dyn EpisodeSource,
        task_dir: &Path,
        index: u64,
    ) -> Result<PathBuf, crate::error::Error>;
}

/// Default sink: one group per stream, one dataset per field.
#[derive(Debug, Default, Clone)]
pub struct GroupedJsonSink;

impl EpisodeSink for GroupedJsonSink {
    fn persist(
        &mut self,
        source: &dyn EpisodeSource,
        task_dir: &Path,
        index: u64,
    ) -> Result<PathBuf, crate::error::Error> {
        let mut container: BTreeMap<String, BTreeMap<String, Vec<FieldValue>>> = BTreeMap::new();
        for (stream, items) in source.mapping() {
            let group = container.entry(stream.clone()).or_default();
            for item in items {
                group.insert(item.clone(), source.require(&stream, &item)?);
            }
        }
        let path = container_path(task_dir, index);
        write_json_atomic(&path, &container)?;
        debug!("[GroupedJsonSink] write to {:?}", path);
        Ok(path)
    }
}

pub fn container_path(task_dir: &Path, index: u64) -> PathBuf {
    task_dir.join(format!("{index}.{CONTAINER_EXT}"))
}

pub fn episode_dir(task_dir: &Path, index: u64) -> PathBuf {
    task_dir.join(format!("{EPISODE_DIR_PREFIX}{index}"))
}

/// Serialises `value` to a sibling temp file, then renames it over `path`.
/// A failed write leaves any previous file at `path` untouched.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    if path.exists() {
        warn!("overwriting existing file {:?}", path);
    }
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value).map_err(|e| PersistError::json(&tmp, e))?;
        writer.flush().map_err(|e| PersistError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PersistError::io(path, e)
    })
}

/// Indices of persisted episodes in `task_dir`: `{n}.json` files and `episode{n}` directories.
pub fn existing_episodes(task_dir: &Path) -> Result<BTreeSet<u64>, PersistError> {
    let mut ids = BTreeSet::new();
    if !task_dir.exists() {
        return Ok(ids);
    }
    let entries = fs::read_dir(task_dir).map_err(|e| PersistError::io(task_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PersistError::io(task_dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let path = entry.path();
        let id = if path.is_dir() {
            name.strip_prefix(EPISODE_DIR_PREFIX).and_then(parse_index)
        } else {
            name.strip_suffix(CONTAINER_EXT)
                .and_then(|stem| stem.strip_suffix('.'))
                .and_then(parse_index)
        };
        if let Some(id) = id {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Lowest non-negative index not present in `task_dir`.
pub fn next_free_episode(task_dir: &Path) -> Result<u64, PersistError> {
    let ids = existing_episodes(task_dir)?;
    let mut next = 0u64;
    while ids.contains(&next) {
        next += 1;
    }
    Ok(next)
}

fn parse_index(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
