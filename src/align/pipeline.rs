//! Diff-frequency pipeline: resample controller streams onto the camera timeline, drop
//! static frames, and persist the aligned episode.
//!
//! Cameras are captured by one group and share a frame count; their per-frame mean
//! timestamp is the canonical timeline. Each arm stream is resampled onto it with
//! `nearest_indices`, then the concatenated (joint, gripper) pose of every arm drives
//! `motion_keep_indices`. The retained index set is applied to every stream.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::Serialize;

use crate::align::dedup::{gather, motion_keep_indices};
use crate::align::nearest::{nearest_indices, reference_timeline};
use crate::config::{AlignConfig, AlignedLayout};
use crate::data::sink::{EpisodeSink, EpisodeSource, container_path, episode_dir, write_json_atomic};
use crate::data::value::FieldValue;
use crate::error::{AlignError, DataError, Error, PersistError};

pub const ROBOT_POSE_FILE: &str = "robotpose.json";
pub const INFO_FILE: &str = "info.json";

#[derive(Serialize)]
struct Observations<'a> {
    qpos: &'a [Vec<f64>],
    images: BTreeMap<&'a str, &'a [FieldValue]>,
}

#[derive(Serialize)]
struct ActionContainer<'a> {
    action: Vec<Vec<f64>>,
    observations: Observations<'a>,
}

/// Next-frame targets: `action[i] = qpos[i + 1]`, the last action all zeros.
pub fn next_pose_actions(qpos: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut actions: Vec<Vec<f64>> = qpos.iter().skip(1).cloned().collect();
    if let Some(last) = qpos.last() {
        actions.push(vec![0.0; last.len()]);
    }
    actions
}

pub type Columns = BTreeMap<String, Vec<FieldValue>>;

/// Every stream cut to the same retained frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedEpisode {
    /// Canonical timestamp of each retained frame.
    pub reference: Vec<i64>,
    /// Retained positions on the canonical timeline.
    pub kept: Vec<usize>,
    /// Concatenated (joint, gripper) of every arm, per retained frame.
    pub poses: Vec<Vec<f64>>,
    pub cameras: BTreeMap<String, Columns>,
    pub arms: BTreeMap<String, Columns>,
}

impl AlignedEpisode {
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

#[derive(Serialize)]
struct EpisodeInfo<'a> {
    episode: u64,
    frames: usize,
    reference: &'a [i64],
    timestamps: BTreeMap<&'a str, &'a [FieldValue]>,
}

fn timestamps(source: &dyn EpisodeSource, stream: &str, field: &str) -> Result<Vec<i64>, DataError> {
    source
        .require(stream, field)?
        .iter()
        .map(|v| {
            v.as_i64().ok_or_else(|| DataError::NotNumeric {
                stream: stream.to_string(),
                field: field.to_string(),
            })
        })
        .collect()
}

/// All fields of `stream`, each checked to have `expected` samples.
fn columns(source: &dyn EpisodeSource, stream: &str, expected: usize) -> Result<Columns, DataError> {
    let mapping = source.mapping();
    let fields = mapping
        .get(stream)
        .ok_or_else(|| DataError::MissingStream(stream.to_string()))?;
    let mut out = Columns::new();
    for field in fields {
        let values = source.require(stream, field)?;
        if values.len() != expected {
            return Err(DataError::LengthMismatch {
                component: stream.to_string(),
                field: field.clone(),
                expected,
                found: values.len(),
            });
        }
        out.insert(field.clone(), values);
    }
    Ok(out)
}

fn pose_part<'a>(
    columns: &'a Columns,
    stream: &str,
    field: &str,
) -> Result<&'a [FieldValue], DataError> {
    columns
        .get(field)
        .map(Vec::as_slice)
        .ok_or_else(|| DataError::MissingField {
            stream: stream.to_string(),
            field: field.to_string(),
        })
}

pub fn align_episode(source: &dyn EpisodeSource, config: &AlignConfig) -> Result<AlignedEpisode, AlignError> {
    if config.cameras.is_empty() {
        return Err(AlignError::NoCameras);
    }
    let ts_field = config.timestamp_field.as_str();

    let mut camera_stamps = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        camera_stamps.push(timestamps(source, camera, ts_field)?);
    }
    let named: Vec<(&str, &[i64])> = config
        .cameras
        .iter()
        .map(String::as_str)
        .zip(camera_stamps.iter().map(Vec::as_slice))
        .collect();
    let reference = reference_timeline(&named)?;
    let frames = reference.len();

    let mut arms = BTreeMap::new();
    for arm in &config.arms {
        let stamps = timestamps(source, &arm.stream, ts_field)?;
        let indices = nearest_indices(&reference, &stamps)
            .ok_or_else(|| AlignError::EmptyStream(arm.stream.clone()))?;
        let resampled: Columns = columns(source, &arm.stream, stamps.len())?
            .into_iter()
            .map(|(field, values)| (field, gather(&values, &indices)))
            .collect();
        arms.insert(arm.stream.clone(), resampled);
    }

    let mut poses: Vec<Vec<f64>> = vec![Vec::new(); frames];
    for arm in &config.arms {
        let Some(resampled) = arms.get(&arm.stream) else {
            continue;
        };
        let joint = pose_part(resampled, &arm.stream, &arm.joint_field)?;
        let gripper = pose_part(resampled, &arm.stream, &arm.gripper_field)?;
        for (pose, (j, g)) in poses.iter_mut().zip(joint.iter().zip(gripper)) {
            pose.extend(j.numeric());
            pose.extend(g.numeric());
        }
    }
    let kept = if config.arms.is_empty() {
        debug!("[align] no arm streams configured, every camera frame kept");
        (0..frames).collect()
    } else {
        motion_keep_indices(&poses, config.dedup_tolerance)
    };

    let mut cameras = BTreeMap::new();
    for camera in &config.cameras {
        let cut: Columns = columns(source, camera, frames)?
            .into_iter()
            .map(|(field, values)| (field, gather(&values, &kept)))
            .collect();
        cameras.insert(camera.clone(), cut);
    }
    let arms = arms
        .into_iter()
        .map(|(stream, cols)| {
            let cut: Columns = cols
                .into_iter()
                .map(|(field, values)| (field, gather(&values, &kept)))
                .collect();
            (stream, cut)
        })
        .collect();

    for stream in source.mapping().keys() {
        if !config.cameras.contains(stream) && !config.arms.iter().any(|a| &a.stream == stream) {
            debug!("[align] stream {} is not part of the aligned layout, skipped", stream);
        }
    }

    debug!("[align] {} canonical frames, {} kept", frames, kept.len());
    Ok(AlignedEpisode {
        reference: gather(&reference, &kept),
        poses: gather(&poses, &kept),
        kept,
        cameras,
        arms,
    })
}

/// Persistence collaborator that aligns before writing.
#[derive(Debug, Clone, Default)]
pub struct DiffFreqSink {
    config: AlignConfig,
}

impl DiffFreqSink {
    pub fn new(config: AlignConfig) -> Self {
        Self { config }
    }

    fn write_episode_dir(&self, aligned: &AlignedEpisode, task_dir: &Path, index: u64) -> Result<PathBuf, PersistError> {
        let dir = episode_dir(task_dir, index);
        fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;

        for (camera, cols) in &aligned.cameras {
            write_json_atomic(&dir.join(format!("{camera}.json")), cols)?;
        }

        let ts_field = self.config.timestamp_field.as_str();
        let pose: BTreeMap<&str, BTreeMap<&str, &Vec<FieldValue>>> = aligned
            .arms
            .iter()
            .map(|(arm, cols)| {
                let fields = cols
                    .iter()
                    .filter(|(field, _)| field.as_str() != ts_field)
                    .map(|(field, values)| (field.as_str(), values))
                    .collect();
                (arm.as_str(), fields)
            })
            .collect();
        write_json_atomic(&dir.join(ROBOT_POSE_FILE), &pose)?;

        let info = EpisodeInfo {
            episode: index,
            frames: aligned.len(),
            reference: &aligned.reference,
            timestamps: aligned
                .cameras
                .iter()
                .chain(aligned.arms.iter())
                .filter_map(|(stream, cols)| cols.get(ts_field).map(|ts| (stream.as_str(), ts.as_slice())))
                .collect(),
        };
        write_json_atomic(&dir.join(INFO_FILE), &info)?;
        Ok(dir)
    }

    fn write_action_container(
        &self,
        aligned: &AlignedEpisode,
        task_dir: &Path,
        index: u64,
    ) -> Result<PathBuf, Error> {
        let mut images = BTreeMap::new();
        for (camera, cols) in &aligned.cameras {
            let color = cols
                .get(&self.config.image_field)
                .ok_or_else(|| DataError::MissingField {
                    stream: camera.clone(),
                    field: self.config.image_field.clone(),
                })?;
            images.insert(camera.as_str(), color.as_slice());
        }
        let container = ActionContainer {
            action: next_pose_actions(&aligned.poses),
            observations: Observations {
                qpos: &aligned.poses,
                images,
            },
        };
        let path = container_path(task_dir, index);
        write_json_atomic(&path, &container)?;
        Ok(path)
    }

    fn write_container(&self, aligned: &AlignedEpisode, task_dir: &Path, index: u64) -> Result<PathBuf, PersistError> {
        let path = container_path(task_dir, index);
        let container: BTreeMap<&String, &Columns> =
            aligned.cameras.iter().chain(aligned.arms.iter()).collect();
        write_json_atomic(&path, &container)?;
        Ok(path)
    }
}

impl EpisodeSink for DiffFreqSink {
    fn persist(&mut self, source: &dyn EpisodeSource, task_dir: &Path, index: u64) -> Result<PathBuf, Error> {
        let aligned = align_episode(source, &self.config)?;
        let path = match self.config.layout {
            AlignedLayout::EpisodeDir => self.write_episode_dir(&aligned, task_dir, index)?,
            AlignedLayout::SingleContainer => self.write_container(&aligned, task_dir, index)?,
            AlignedLayout::ActionContainer => self.write_action_container(&aligned, task_dir, index)?,
        };
        info!("[DiffFreqSink] episode {} aligned to {} frames at {:?}", index, aligned.len(), path);
        Ok(path)
    }
}
