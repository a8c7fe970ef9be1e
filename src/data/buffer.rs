//! Per-group sample store: latest-value cache plus an append-only columnar history.
//!
//! - `update()` is called by the component node that owns the key (single writer per key).
//! - `push()` is called once per tick by the group's data node, after every producer of
//!   that tick has written; it appends the latest values to the history while the
//!   collection gate is open.
//! - `get()` / `clear()` are called by the episode lifecycle after the gate is closed and
//!   `drain()` has returned.
//!
//! The gate is checked while holding the history lock, so `drain()` (lock + release) is a
//! barrier: once it returns, no push that saw an open gate is still running.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::data::value::{FieldValue, Fields, Frame};
use crate::error::DataError;

/// Collection-enabled flag shared by every buffer of a rig.
#[derive(Debug, Clone, Default)]
pub struct CollectGate(Arc<AtomicBool>);

impl CollectGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type History = BTreeMap<String, BTreeMap<String, Vec<FieldValue>>>;

pub struct DataBuffer {
    name: String,
    latest: DashMap<String, Fields>,
    history: Mutex<History>,
    gate: CollectGate,
}

impl DataBuffer {
    pub fn new(name: impl Into<String>, gate: CollectGate) -> Self {
        Self {
            name: name.into(),
            latest: DashMap::new(),
            history: Mutex::new(BTreeMap::new()),
            gate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replaces the latest value for `component`.
    pub fn update(&self, component: &str, fields: Fields) {
        self.latest.insert(component.to_string(), fields);
    }

    /// Snapshot of the latest value of every component.
    pub fn latest(&self) -> Frame {
        self.latest
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Appends the current latest values to the history. Returns false when the gate is closed.
    pub fn push(&self) -> bool {
        let mut history = self.history.lock();
        if !self.gate.is_open() {
            return false;
        }
        for entry in self.latest.iter() {
            let columns = history.entry(entry.key().clone()).or_default();
            for (field, value) in entry.value() {
                columns.entry(field.clone()).or_default().push(value.clone());
            }
        }
        true
    }

    /// Waits for any in-flight `push()` to finish.
    pub fn drain(&self) {
        drop(self.history.lock());
    }

    /// Transposes the column-wise history into one frame per captured index.
    ///
    /// Components with shorter histories simply stop appearing in later frames; fields of
    /// one component must all have the same length.
    pub fn get(&self) -> Result<Vec<Frame>, DataError> {
        let history = self.history.lock();

        let mut rows = 0usize;
        for (component, columns) in history.iter() {
            let mut expected: Option<usize> = None;
            for (field, values) in columns {
                match expected {
                    None => expected = Some(values.len()),
                    Some(n) if n != values.len() => {
                        return Err(DataError::LengthMismatch {
                            component: component.clone(),
                            field: field.clone(),
                            expected: n,
                            found: values.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
            rows = rows.max(expected.unwrap_or(0));
        }

        let mut frames = Vec::with_capacity(rows);
        for i in 0..rows {
            let mut frame = Frame::new();
            for (component, columns) in history.iter() {
                let fields: Fields = columns
                    .iter()
                    .filter_map(|(field, values)| values.get(i).map(|v| (field.clone(), v.clone())))
                    .collect();
                if !fields.is_empty() {
                    frame.insert(component.clone(), fields);
                }
            }
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Discards the history; the latest-value cache is kept.
    pub fn clear(&self) {
        let mut history = self.history.lock();
        let dropped = history.len();
        history.clear();
        debug!("[{}] history cleared ({} components)", self.name, dropped);
    }

    /// Number of samples recorded for `component` (0 when unknown).
    pub fn history_len(&self, component: &str) -> usize {
        self.history
            .lock()
            .get(component)
            .and_then(|columns| columns.values().map(Vec::len).max())
            .unwrap_or(0)
    }
}
