//! Typed configuration.
//!
//! Every struct has a `Default` matching the dual-arm rig (image sensors at 30 Hz, arm
//! controllers at 120 Hz) and can be read from a JSON document. `validate()` rejects
//! configurations that must fail before any scheduler starts.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::engine::scheduler::FaultPolicy;
use crate::error::ConfigError;

/// Whether a group's streams are harvested as sensor or controller frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Sensor,
    Controller,
}

/// One node group: its components are sampled together at `hz`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub kind: GroupKind,
    pub hz: f64,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, kind: GroupKind, hz: f64) -> Self {
        Self { name: name.into(), kind, hz }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub groups: Vec<GroupConfig>,
    /// Raise scheduler threads to maximum OS priority.
    pub realtime_priority: bool,
    pub fault_policy: FaultPolicy,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            groups: vec![
                GroupConfig::new("image", GroupKind::Sensor, 30.0),
                GroupConfig::new("arm", GroupKind::Controller, 120.0),
            ],
            realtime_priority: false,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl RigConfig {
    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for group in &self.groups {
            if !(group.hz.is_finite() && group.hz > 0.0) {
                return Err(ConfigError::InvalidFrequency {
                    group: group.name.clone(),
                    hz: group.hz,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub save_dir: PathBuf,
    pub task_name: String,
    /// Drop controller frames that did not move since the last accepted one.
    pub move_check: bool,
    pub move_tolerance: f64,
    /// Continue numbering from the episodes already on disk.
    pub resume: bool,
    pub start_episode: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("save"),
            task_name: "demo_task".into(),
            move_check: false,
            move_tolerance: 0.001,
            resume: false,
            start_episode: 0,
        }
    }
}

impl CollectConfig {
    pub fn task_dir(&self) -> PathBuf {
        self.save_dir.join(&self.task_name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_name.trim().is_empty() {
            return Err(ConfigError::MissingTaskName);
        }
        Ok(())
    }
}

/// Fields of one arm stream that make up its part of the pose vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStreams {
    pub stream: String,
    pub joint_field: String,
    pub gripper_field: String,
}

impl ArmStreams {
    pub fn new(stream: &str) -> Self {
        Self {
            stream: stream.into(),
            joint_field: "joint".into(),
            gripper_field: "gripper".into(),
        }
    }
}

/// Output layout of the alignment sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignedLayout {
    /// `episode{N}/` with one container per camera, `robotpose.json` and `info.json`.
    #[default]
    EpisodeDir,
    /// A single grouped container `{N}.json`.
    SingleContainer,
    /// `{N}.json` with `action` (next-frame pose) and `observations` (`qpos` plus camera
    /// images), the layout policy trainers read.
    ActionContainer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Camera streams defining the canonical timeline; equal length by construction.
    pub cameras: Vec<String>,
    /// Controller streams resampled onto the camera timeline, in pose-vector order.
    pub arms: Vec<ArmStreams>,
    pub timestamp_field: String,
    /// Camera field stored under `observations/images` in the action layout.
    pub image_field: String,
    pub dedup_tolerance: f64,
    pub layout: AlignedLayout,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            cameras: vec![
                "cam_head".into(),
                "cam_left_wrist".into(),
                "cam_right_wrist".into(),
            ],
            arms: vec![ArmStreams::new("left_arm"), ArmStreams::new("right_arm")],
            timestamp_field: crate::data::value::TIMESTAMP_FIELD.into(),
            image_field: "color".into(),
            dedup_tolerance: 1e-5,
            layout: AlignedLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub addr: String,
    pub timeout_ms: u64,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9999".into(),
            timeout_ms: 30_000,
            connect_attempts: 1000,
            retry_delay_ms: 5_000,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Everything the binary needs for one recording session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub rig: RigConfig,
    pub collect: CollectConfig,
    pub align: AlignConfig,
    pub remote: RemoteConfig,
    pub episodes: u32,
    pub episode_secs: f64,
    pub event_log: PathBuf,
    pub summary_csv: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rig: RigConfig::default(),
            collect: CollectConfig::default(),
            align: AlignConfig::default(),
            remote: RemoteConfig::default(),
            episodes: 1,
            episode_secs: 3.0,
            event_log: PathBuf::from("data/logs/tick_events.csv"),
            summary_csv: PathBuf::from("data/logs/session_summary.csv"),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(doc: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let doc = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&doc)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rig.validate()?;
        self.collect.validate()?;
        let mut seen = HashSet::new();
        for group in &self.rig.groups {
            if !seen.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
        }
        Ok(())
    }
}
