//! Episode lifecycle: accept frames, filter static controller frames, number and persist episodes.
//!
//! Frames arrive one at a time through `collect()`. Sensor-only frames are always kept.
//! With `move_check` enabled, a controller frame is kept only if some non-timestamp field
//! moved by more than `move_tolerance` relative to the last *accepted* controller frame.
//!
//! `write()` hands the accumulated episode to the configured `EpisodeSink` (default: one
//! grouped container per episode), then updates the `config.json` sidecar in the task
//! directory and advances the episode index.

use std::{
    collections::BTreeSet,
    fs,
    path::PathBuf,
};

use average::{Estimate, Mean};
use log::{debug, info, warn};
use serde_json::{Map, Value};

use crate::config::CollectConfig;
use crate::data::sink::{
    EpisodeSink, EpisodeSource, GroupedJsonSink, container_path, episode_dir, next_free_episode,
    write_json_atomic,
};
use crate::data::value::{FieldValue, Frame, StreamMap, TIMESTAMP_FIELD};
use crate::error::{Error, PersistError};

/// Fields never considered by the motion filter.
pub const KEY_BANNED: &[&str] = &[TIMESTAMP_FIELD];

/// Sidecar metadata file in the task directory.
pub const SIDECAR_FILE: &str = "config.json";

const AVG_INTERVAL_KEY: &str = "avg_frame_interval_ns";
const INTERVAL_EPISODES_KEY: &str = "interval_episodes";
const STREAMS_KEY: &str = "streams";

pub struct Collector {
    config: CollectConfig,
    episode: Vec<Frame>,
    last_controller: Option<Frame>,
    episode_index: u64,
    sink: Box<dyn EpisodeSink>,
    dropped: usize,
}

impl Collector {
    /// Creates a collector; with `resume` the index starts at the lowest unused one on disk.
    pub fn new(config: CollectConfig) -> Result<Self, PersistError> {
        let episode_index = if config.resume {
            let next = next_free_episode(&config.task_dir())?;
            info!("[Collector] resuming {:?} at episode {}", config.task_dir(), next);
            next
        } else {
            config.start_episode
        };
        Ok(Self {
            config,
            episode: Vec::new(),
            last_controller: None,
            episode_index,
            sink: Box::new(GroupedJsonSink),
            dropped: 0,
        })
    }

    /// Replaces the persistence collaborator (e.g. with the alignment pipeline).
    pub fn with_sink(mut self, sink: Box<dyn EpisodeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn set_sink(&mut self, sink: Box<dyn EpisodeSink>) {
        self.sink = sink;
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    pub fn episode_index(&self) -> u64 {
        self.episode_index
    }

    pub fn len(&self) -> usize {
        self.episode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episode.is_empty()
    }

    /// Controller frames dropped by the motion filter in the current episode.
    pub fn dropped_frames(&self) -> usize {
        self.dropped
    }

    pub fn frames(&self) -> &[Frame] {
        &self.episode
    }

    pub fn collect(&mut self, controllers: Option<Frame>, sensors: Option<Frame>) {
        let mut frame = Frame::new();
        if let Some(c) = &controllers {
            frame.extend(c.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(s) = sensors {
            frame.extend(s);
        }

        if !self.config.move_check {
            self.episode.push(frame);
            return;
        }

        let Some(controllers) = controllers else {
            self.episode.push(frame);
            return;
        };

        let accept = match &self.last_controller {
            None => true,
            Some(previous) => motion_exceeds(&controllers, previous, self.config.move_tolerance),
        };
        if accept {
            self.last_controller = Some(controllers);
            self.episode.push(frame);
        } else {
            self.dropped += 1;
            debug!("[Collector] robot is not moving, skip this frame");
        }
    }

    /// Values of `field` across every frame containing `stream`.
    pub fn get_item(&self, stream: &str, field: &str) -> Option<Vec<FieldValue>> {
        let mut out: Option<Vec<FieldValue>> = None;
        for frame in &self.episode {
            if let Some(fields) = frame.get(stream) {
                let value = fields.get(field)?;
                out.get_or_insert_with(Vec::new).push(value.clone());
            }
        }
        if out.is_none() {
            warn!("[Collector] item {} not in {}", field, stream);
        }
        out
    }

    /// Merges `extra` into the sidecar: an existing key becomes a list and gets the new
    /// value appended; a new key is inserted as is.
    pub fn add_extra_info(&mut self, extra: Map<String, Value>) -> Result<(), PersistError> {
        let path = self.config.task_dir().join(SIDECAR_FILE);
        let mut sidecar = self.load_sidecar()?;
        for (key, value) in extra {
            match sidecar.get_mut(&key) {
                Some(existing) => {
                    if !existing.is_array() {
                        *existing = Value::Array(vec![existing.take()]);
                    }
                    if let Value::Array(list) = existing {
                        list.push(value);
                    }
                }
                None => {
                    sidecar.insert(key, value);
                }
            }
        }
        write_json_atomic(&path, &sidecar)
    }

    /// Like `add_extra_info`, but a key whose stored value already equals the new one
    /// is left alone. For metadata that is the same for every episode of a task.
    pub fn record_extra_info(&mut self, extra: Map<String, Value>) -> Result<(), PersistError> {
        let sidecar = self.load_sidecar()?;
        let changed: Map<String, Value> = extra
            .into_iter()
            .filter(|(key, value)| sidecar.get(key) != Some(value))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        self.add_extra_info(changed)
    }

    /// Persists the current episode and starts the next one.
    ///
    /// `episode_id` overrides the index used for this write only. On failure the frames
    /// stay in memory so the caller can retry or `abort()`.
    pub fn write(&mut self, episode_id: Option<u64>) -> Result<PathBuf, Error> {
        if self.episode.is_empty() {
            return Err(PersistError::EmptyEpisode.into());
        }
        let task_dir = self.config.task_dir();
        fs::create_dir_all(&task_dir).map_err(|e| PersistError::io(&task_dir, e))?;

        let index = episode_id.unwrap_or(self.episode_index);
        let mut sink = std::mem::replace(&mut self.sink, Box::new(GroupedJsonSink));
        let persisted = sink.persist(&*self, &task_dir, index);
        self.sink = sink;
        let path = persisted?;
        self.update_sidecar()?;

        info!(
            "[Collector] episode {} written to {:?} ({} frames, {} static dropped)",
            index,
            path,
            self.episode.len(),
            self.dropped
        );

        self.reset_episode();
        self.episode_index = if self.config.resume {
            next_free_episode(&task_dir)?
        } else {
            self.episode_index + 1
        };
        Ok(path)
    }

    /// Discards the in-memory episode without writing it.
    pub fn abort(&mut self) {
        if !self.episode.is_empty() {
            info!("[Collector] discarding {} frames", self.episode.len());
        }
        self.reset_episode();
    }

    /// Deletes a persisted episode (container or directory). Other episodes are untouched.
    pub fn remove_episode(&self, index: u64) -> Result<(), PersistError> {
        let task_dir = self.config.task_dir();
        let file = container_path(&task_dir, index);
        let dir = episode_dir(&task_dir, index);
        let mut removed = false;
        if file.is_file() {
            fs::remove_file(&file).map_err(|e| PersistError::io(&file, e))?;
            removed = true;
        }
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;
            removed = true;
        }
        if removed {
            info!("[Collector] removed episode {}", index);
            Ok(())
        } else {
            Err(PersistError::NoSuchEpisode(index))
        }
    }

    fn reset_episode(&mut self) {
        self.episode.clear();
        self.last_controller = None;
        self.dropped = 0;
    }

    fn load_sidecar(&self) -> Result<Map<String, Value>, PersistError> {
        let path = self.config.task_dir().join(SIDECAR_FILE);
        if path.exists() {
            let doc = fs::read_to_string(&path).map_err(|e| PersistError::io(&path, e))?;
            return serde_json::from_str(&doc).map_err(|e| PersistError::json(&path, e));
        }
        match serde_json::to_value(&self.config) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Ok(Map::new()),
            Err(e) => Err(PersistError::json(&path, e)),
        }
    }

    /// Records the streams/fields seen and folds this episode's mean frame interval
    /// into the running average.
    fn update_sidecar(&self) -> Result<(), PersistError> {
        let path = self.config.task_dir().join(SIDECAR_FILE);
        let mut sidecar = self.load_sidecar()?;

        let streams = sidecar
            .entry(STREAMS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(streams) = streams {
            for (stream, items) in self.mapping() {
                let mut known: BTreeSet<String> = streams
                    .get(&stream)
                    .and_then(Value::as_array)
                    .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                known.extend(items);
                streams.insert(stream, Value::from(known.into_iter().collect::<Vec<_>>()));
            }
        }

        if let Some(interval) = self.mean_frame_interval_ns() {
            let episodes = sidecar
                .get(INTERVAL_EPISODES_KEY)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let previous = sidecar
                .get(AVG_INTERVAL_KEY)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let updated = (previous * episodes as f64 + interval) / (episodes + 1) as f64;
            sidecar.insert(AVG_INTERVAL_KEY.into(), Value::from(updated));
            sidecar.insert(INTERVAL_EPISODES_KEY.into(), Value::from(episodes + 1));
        }

        write_json_atomic(&path, &sidecar)
    }

    fn mean_frame_interval_ns(&self) -> Option<f64> {
        let mut mean = Mean::new();
        for stream in self.mapping().keys() {
            let Some(stamps) = self.get_item(stream, TIMESTAMP_FIELD) else {
                continue;
            };
            let stamps: Vec<i64> = stamps.iter().filter_map(FieldValue::as_i64).collect();
            for pair in stamps.windows(2) {
                mean.add((pair[1] - pair[0]) as f64);
            }
        }
        (!mean.is_empty()).then(|| mean.mean())
    }
}

impl EpisodeSource for Collector {
    fn mapping(&self) -> StreamMap {
        let mut mapping = StreamMap::new();
        for frame in &self.episode {
            for (stream, fields) in frame {
                mapping
                    .entry(stream.clone())
                    .or_default()
                    .extend(fields.keys().cloned());
            }
        }
        mapping
    }

    fn field(&self, stream: &str, field: &str) -> Option<Vec<FieldValue>> {
        self.get_item(stream, field)
    }
}

/// True when any non-banned field of `current` differs from `previous` by more than
/// `tolerance`, changed shape, or has no counterpart in `previous`.
pub fn motion_exceeds(current: &Frame, previous: &Frame, tolerance: f64) -> bool {
    for (part, fields) in current {
        let Some(previous_fields) = previous.get(part) else {
            return true;
        };
        for (key, value) in fields {
            if KEY_BANNED.contains(&key.as_str()) {
                continue;
            }
            let Some(previous_value) = previous_fields.get(key) else {
                return true;
            };
            let a = value.numeric();
            let b = previous_value.numeric();
            if a.len() != b.len() {
                return true;
            }
            if a.iter().zip(&b).any(|(x, y)| (x - y).abs() > tolerance) {
                return true;
            }
        }
    }
    false
}
