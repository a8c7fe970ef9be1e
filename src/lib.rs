//! # teleop_sync
//!
//! Real-time acquisition and multi-rate synchronisation for teleoperation data collection.
//!
//! - **engine:** nodes run one step per tick on their own threads; a scheduler per node
//!   group ticks its DAG at a fixed rate without overlapping ticks.
//! - **data:** per-group buffers accumulate samples; the collector turns them into
//!   numbered, persisted episodes.
//! - **align:** resamples independently clocked controller streams onto the camera timeline
//!   and drops static frames.
//! - **remote:** length-prefixed JSON transport to an inference policy.

pub mod align;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod remote;
pub mod sim;
pub mod utils;

pub use error::{Error, Result};
