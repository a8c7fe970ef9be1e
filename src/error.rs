//! Error taxonomy for the acquisition engine.
//!
//! - **ConfigError:** fatal at setup, raised before any scheduler starts.
//! - **DataError / AlignError:** integrity problems found at harvest or alignment time;
//!   the episode write is aborted.
//! - **PersistError:** filesystem failures, always carrying the path involved.
//! - **EngineError:** node/scheduler lifecycle failures, including a scheduler halted by a node fault.
//! - **RemoteError:** inference transport failures.
//!
//! Transient per-sample errors never reach this module: components absorb them and
//! report empty or partial fields instead.

use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("task name must not be empty")]
    MissingTaskName,

    #[error("group '{group}' has non-positive frequency {hz}")]
    InvalidFrequency { group: String, hz: f64 },

    #[error("group '{0}' has no components")]
    EmptyGroup(String),

    #[error("no group named '{0}' is configured")]
    UnknownGroup(String),

    #[error("component '{0}' is registered more than once")]
    DuplicateComponent(String),

    #[error("group '{0}' is configured more than once")]
    DuplicateGroup(String),

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read configuration {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("component '{component}': field '{field}' has {found} samples, expected {expected}")]
    LengthMismatch {
        component: String,
        field: String,
        expected: usize,
        found: usize,
    },

    #[error("stream '{0}' not present in episode")]
    MissingStream(String),

    #[error("field '{field}' not present in stream '{stream}'")]
    MissingField { stream: String, field: String },

    #[error("field '{field}' of stream '{stream}' is not numeric")]
    NotNumeric { stream: String, field: String },
}

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("camera '{camera}' has {found} frames, expected {expected}")]
    CameraLengthMismatch {
        camera: String,
        expected: usize,
        found: usize,
    },

    #[error("stream '{0}' has no samples to align against")]
    EmptyStream(String),

    #[error("no camera streams configured")]
    NoCameras,

    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error at {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("JSON error at {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("episode {0} does not exist")]
    NoSuchEpisode(u64),

    #[error("episode has no frames to write")]
    EmptyEpisode,
}

impl PersistError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistError::Io { path: path.into(), source }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        PersistError::Json { path: path.into(), source }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("node '{0}' was already started")]
    AlreadyStarted(String),

    #[error("failed to spawn thread for '{name}': {source}")]
    Spawn { name: String, source: io::Error },

    #[error("thread '{0}' panicked")]
    Panicked(String),

    #[error("scheduler '{scheduler}' halted: node '{node}' failed on tick {tick}: {message}")]
    Halted {
        scheduler: String,
        node: String,
        tick: u64,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),

    #[error("connection closed by peer")]
    Closed,

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed tensor: {0}")]
    Tensor(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("server error: {message}")]
    Server { message: String, traceback: String },

    #[error("policy error: {0}")]
    Policy(String),

    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: String,
        attempts: u32,
        source: io::Error,
    },
}

/// Crate-level error for callers that drive the whole episode lifecycle.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, Error>;
