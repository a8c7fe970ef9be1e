//! Periodic driver for one node DAG.
//!
//! Two-phase loop on a dedicated thread:
//! - **Idle:** wait for `next_tick` (advanced by `period` per launched tick, never reset to
//!   now), then wake every entry node.
//! - **Running:** wait until every sink node reports completion for the current
//!   generation, then reset every node and return to Idle.
//!
//! A tick is never launched while the previous one is in flight, so an overrunning DAG
//! lowers the effective rate instead of overlapping ticks. A node fault aborts the tick,
//! and the loop waits for the steps of that tick still running before going on;
//! `FaultPolicy` decides whether the scheduler carries on or halts.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use spin_sleep::{SpinSleeper, SpinStrategy};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::engine::node::{Node, NodeEvent, NodeFault};
use crate::error::{ConfigError, EngineError};
use crate::utils::metrics::{TickEvent, TickRecorder};

/// Longest single idle sleep, so `stop()` is observed promptly at low rates.
const IDLE_SLICE: Duration = Duration::from_millis(10);
/// Poll interval while waiting for sinks.
const RUNNING_POLL: Duration = Duration::from_millis(1);

/// What the scheduler does after a node step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Abort the tick, keep ticking.
    #[default]
    SkipTick,
    /// Abort the tick, stop the scheduler and every node.
    Halt,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    pub name: String,
    pub ticks_started: u64,
    pub ticks_completed: u64,
    pub ticks_failed: u64,
    /// Ticks launched more than one period late.
    pub overruns: u64,
    pub faults: Vec<NodeFault>,
    pub halted: bool,
    pub elapsed: Duration,
}

impl SchedulerReport {
    pub fn effective_hz(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ticks_completed as f64 / secs
        } else {
            0.0
        }
    }

    /// Turns a halted report into `EngineError::Halted`.
    pub fn into_result(self) -> Result<Self, EngineError> {
        if self.halted {
            if let Some(fault) = self.faults.last() {
                return Err(EngineError::Halted {
                    scheduler: self.name.clone(),
                    node: fault.node.clone(),
                    tick: fault.generation,
                    message: fault.message.clone(),
                });
            }
        }
        Ok(self)
    }
}

pub struct Scheduler {
    name: String,
    entry: Vec<Node>,
    all: Vec<Node>,
    sinks: Vec<Node>,
    period: Duration,
    policy: FaultPolicy,
    realtime: bool,
    recorder: Option<TickRecorder>,
    running: Arc<AtomicBool>,
    events_tx: Sender<NodeEvent>,
    events_rx: Receiver<NodeEvent>,
    handle: Option<JoinHandle<SchedulerReport>>,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        entry: Vec<Node>,
        all: Vec<Node>,
        sinks: Vec<Node>,
        hz: f64,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if !(hz.is_finite() && hz > 0.0) {
            return Err(ConfigError::InvalidFrequency { group: name, hz });
        }
        if entry.is_empty() || sinks.is_empty() {
            return Err(ConfigError::EmptyGroup(name));
        }
        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            name,
            entry,
            all,
            sinks,
            period: Duration::from_secs_f64(1.0 / hz),
            policy: FaultPolicy::default(),
            realtime: false,
            recorder: None,
            running: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx,
            handle: None,
        })
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_realtime_priority(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn set_recorder(&mut self, recorder: TickRecorder) {
        self.recorder = Some(recorder);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts every node, then the timing loop.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.handle.is_some() {
            return Err(EngineError::AlreadyStarted(self.name.clone()));
        }
        for node in &self.all {
            node.attach(self.events_tx.clone());
            node.start()?;
        }
        self.running.store(true, Ordering::Release);

        let ctx = LoopCtx {
            name: self.name.clone(),
            entry: self.entry.clone(),
            all: self.all.clone(),
            sink_ids: self.sinks.iter().map(Node::id).collect(),
            period: self.period,
            policy: self.policy,
            recorder: self.recorder.clone(),
            running: self.running.clone(),
            events: self.events_rx.clone(),
        };

        let builder = thread::Builder::new().name(format!("sched-{}", self.name));
        let spawned = if self.realtime {
            builder.spawn_with_priority(ThreadPriority::Max, move |raised| {
                if let Err(e) = raised {
                    warn!("[{}] could not raise thread priority: {:?}", ctx.name, e);
                }
                run_loop(ctx)
            })
        } else {
            builder.spawn(move || run_loop(ctx))
        };
        let handle = spawned.map_err(|source| EngineError::Spawn {
            name: self.name.clone(),
            source,
        })?;
        self.handle = Some(handle);
        info!("[{}] started at {:.1} Hz", self.name, 1.0 / self.period.as_secs_f64());
        Ok(())
    }

    /// Signals the loop to exit and stops every owned node.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for node in &self.all {
            node.stop();
        }
    }

    /// Waits for the loop and node threads. Blocks until `stop()` or a halting fault.
    pub fn join(&mut self) -> Result<SchedulerReport, EngineError> {
        let report = match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| EngineError::Panicked(self.name.clone()))?,
            None => SchedulerReport {
                name: self.name.clone(),
                ..SchedulerReport::default()
            },
        };
        for node in &self.all {
            node.join()?;
        }
        Ok(report)
    }
}

struct LoopCtx {
    name: String,
    entry: Vec<Node>,
    all: Vec<Node>,
    sink_ids: HashSet<u64>,
    period: Duration,
    policy: FaultPolicy,
    recorder: Option<TickRecorder>,
    running: Arc<AtomicBool>,
    events: Receiver<NodeEvent>,
}

enum TickOutcome {
    Completed,
    Faulted(NodeFault),
    Stopped,
}

/// Waits until no node is executing a step. Called after `reset()`, so nothing new can
/// be claimed for the aborted tick; late events it drains are stale.
fn settle(ctx: &LoopCtx) {
    while ctx.all.iter().any(Node::is_running) {
        if !ctx.running.load(Ordering::Acquire) {
            return;
        }
        if let Err(RecvTimeoutError::Disconnected) = ctx.events.recv_timeout(RUNNING_POLL) {
            return;
        }
    }
}

fn run_loop(ctx: LoopCtx) -> SchedulerReport {
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let started = Instant::now();
    let mut report = SchedulerReport {
        name: ctx.name.clone(),
        ..SchedulerReport::default()
    };
    let mut generation: u64 = 0;
    let mut next_tick = Instant::now();

    while ctx.running.load(Ordering::Acquire) {
        // Idle
        let now = Instant::now();
        if now < next_tick {
            sleeper.sleep((next_tick - now).min(IDLE_SLICE));
            continue;
        }
        let lateness = now - next_tick;
        next_tick += ctx.period;
        if lateness > ctx.period {
            report.overruns += 1;
            debug!("[{}] tick {} started {:?} late", ctx.name, generation, lateness);
        }

        report.ticks_started += 1;
        if let Some(rec) = &ctx.recorder {
            rec.record(TickEvent::Start {
                scheduler: ctx.name.clone(),
                tick: generation,
                lateness_us: lateness.as_micros() as u64,
            });
        }
        let tick_start = Instant::now();
        for node in &ctx.entry {
            node.trigger();
        }

        // Running
        let mut remaining = ctx.sink_ids.clone();
        let outcome = loop {
            if remaining.is_empty() {
                break TickOutcome::Completed;
            }
            if !ctx.running.load(Ordering::Acquire) {
                break TickOutcome::Stopped;
            }
            match ctx.events.recv_timeout(RUNNING_POLL) {
                Ok(NodeEvent::Completed { node_id, generation: g, .. }) if g == generation => {
                    remaining.remove(&node_id);
                }
                Ok(NodeEvent::Faulted(fault)) if fault.generation == generation => {
                    break TickOutcome::Faulted(fault);
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break TickOutcome::Stopped,
            }
        };

        for node in &ctx.all {
            node.reset();
        }
        if matches!(outcome, TickOutcome::Faulted(_)) {
            // siblings of the faulted node may still be mid-step
            settle(&ctx);
        }
        let tick = generation;
        generation += 1;

        match outcome {
            TickOutcome::Completed => {
                report.ticks_completed += 1;
                if let Some(rec) = &ctx.recorder {
                    rec.record(TickEvent::Complete {
                        scheduler: ctx.name.clone(),
                        tick,
                        exec_us: tick_start.elapsed().as_micros() as u64,
                    });
                }
            }
            TickOutcome::Faulted(fault) => {
                report.ticks_failed += 1;
                if let Some(rec) = &ctx.recorder {
                    rec.record(TickEvent::Failed {
                        scheduler: ctx.name.clone(),
                        tick,
                        node: fault.node.clone(),
                        message: fault.message.clone(),
                    });
                }
                let halt = ctx.policy == FaultPolicy::Halt;
                report.faults.push(fault);
                if halt {
                    error!("[{}] halting after node fault on tick {}", ctx.name, tick);
                    report.halted = true;
                    ctx.running.store(false, Ordering::Release);
                    break;
                }
                warn!("[{}] tick {} aborted", ctx.name, tick);
            }
            TickOutcome::Stopped => break,
        }
    }

    for node in &ctx.all {
        node.stop();
    }
    report.elapsed = started.elapsed();
    info!(
        "[{}] stopped: {} ticks, {} failed, {} overruns, {:.1} Hz effective",
        ctx.name,
        report.ticks_completed,
        report.ticks_failed,
        report.overruns,
        report.effective_hz()
    );
    report
}
