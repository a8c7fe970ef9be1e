//! Tick event recording for scheduler monitoring.
//!
//! `TickRecorder::record()` pushes onto a lock-free queue (16K capacity, drops when full)
//! and returns immediately, so scheduler threads never block on I/O. A background
//! exporter drains the queue into a CSV file in batches and flushes on shutdown.

use std::{
    fs::{File, create_dir_all},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_queue::ArrayQueue;
use csv::Writer;
use log::{debug, error};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::PersistError;

const EVENT_QUEUE_CAPACITY: usize = 16_384;
const CONSUMER_POLL_MS: u64 = 5;
const FLUSH_BATCHES: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum TickEvent {
    /// Entry nodes woken; `lateness_us` is how far past its deadline the tick started.
    Start {
        scheduler: String,
        tick: u64,
        lateness_us: u64,
    },
    Complete {
        scheduler: String,
        tick: u64,
        exec_us: u64,
    },
    Failed {
        scheduler: String,
        tick: u64,
        node: String,
        message: String,
    },
    EpisodeWritten {
        episode: u64,
        frames: usize,
    },
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    seq: u64,
    ts_ns: u64,
    source: &'a str,
    event: &'a str,
    tick: u64,
    value: u64,
    detail: String,
}

struct Stamped {
    seq: u64,
    ts_ns: u64,
    event: TickEvent,
}

impl Stamped {
    fn row(&self) -> CsvRow<'_> {
        let (source, event, tick, value, detail) = match &self.event {
            TickEvent::Start { scheduler, tick, lateness_us } => {
                (scheduler.as_str(), "tick_start", *tick, *lateness_us, String::new())
            }
            TickEvent::Complete { scheduler, tick, exec_us } => {
                (scheduler.as_str(), "tick_complete", *tick, *exec_us, String::new())
            }
            TickEvent::Failed { scheduler, tick, node, message } => {
                (scheduler.as_str(), "tick_failed", *tick, 0, format!("{node}: {message}"))
            }
            TickEvent::EpisodeWritten { episode, frames } => {
                ("collector", "episode_written", *episode, *frames as u64, String::new())
            }
        };
        CsvRow {
            seq: self.seq,
            ts_ns: self.ts_ns,
            source,
            event,
            tick,
            value,
            detail,
        }
    }
}

/// Clonable handle; every clone feeds the same queue.
#[derive(Clone)]
pub struct TickRecorder {
    queue: Arc<ArrayQueue<Stamped>>,
    run_start: Instant,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    exporter: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for TickRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TickRecorder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(EVENT_QUEUE_CAPACITY)),
            run_start: Instant::now(),
            seq: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            exporter: Arc::new(Mutex::new(None)),
        }
    }

    /// Nanoseconds since the recorder was created.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.run_start.elapsed().as_nanos() as u64
    }

    #[inline]
    pub fn record(&self, event: TickEvent) {
        let stamped = Stamped {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ts_ns: self.now_ns(),
            event,
        };
        if self.queue.push(stamped).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Spawns the CSV exporter. A second call while one is running is a no-op.
    pub fn start_exporter(&self, output_csv: &Path) -> Result<(), PersistError> {
        let mut guard = self.exporter.lock();
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = output_csv.parent() {
            create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
        }
        let file = File::create(output_csv).map_err(|e| PersistError::io(output_csv, e))?;

        self.running.store(true, Ordering::SeqCst);
        let queue = self.queue.clone();
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let path: PathBuf = output_csv.to_path_buf();

        let handle = thread::Builder::new()
            .name("tick-exporter".into())
            .spawn(move || {
                let mut wtr = Writer::from_writer(BufWriter::new(file));
                let mut flush_counter = 0usize;

                while running.load(Ordering::SeqCst) {
                    let mut any = false;
                    for _ in 0..256 {
                        match queue.pop() {
                            Some(ev) => {
                                any = true;
                                if let Err(e) = wtr.serialize(ev.row()) {
                                    error!("failed to write tick event to {:?}: {}", path, e);
                                }
                            }
                            None => break,
                        }
                    }
                    if any {
                        flush_counter += 1;
                        if flush_counter >= FLUSH_BATCHES {
                            wtr.flush().ok();
                            flush_counter = 0;
                        }
                    } else {
                        thread::sleep(Duration::from_millis(CONSUMER_POLL_MS));
                    }
                }

                while let Some(ev) = queue.pop() {
                    wtr.serialize(ev.row()).ok();
                }
                wtr.flush().ok();
                debug!(
                    "[TickRecorder::exporter] exiting. dropped_events={}",
                    dropped.load(Ordering::Relaxed)
                );
            })
            .map_err(|e| PersistError::io(output_csv, e))?;
        *guard = Some(handle);
        Ok(())
    }

    /// Stops the exporter after it has drained every queued event.
    pub fn stop_exporter(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.exporter.lock().take() {
            if handle.join().is_err() {
                error!("tick exporter thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_writes_every_queued_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/ticks.csv");
        let recorder = TickRecorder::new();
        recorder.start_exporter(&path).unwrap();
        for tick in 0..10 {
            recorder.record(TickEvent::Start {
                scheduler: "arm".into(),
                tick,
                lateness_us: 3,
            });
        }
        recorder.record(TickEvent::EpisodeWritten { episode: 0, frames: 10 });
        recorder.stop_exporter();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 11);
        assert_eq!(&rows[0][3], "tick_start");
        assert_eq!(&rows[10][3], "episode_written");
        assert_eq!(recorder.dropped(), 0);
    }
}
