//! Schedulable unit wrapping one `Task`, run on its own thread.
//!
//! Per tick a node goes WAITING -> (woken) -> READY-CHECK -> RUN -> SIGNAL-DONE -> WAITING.
//! Fan-in is a countdown of outstanding predecessors re-armed by `reset()`. Every completed
//! predecessor delivers one wake; only the wake that finds the countdown at zero (and the
//! node not yet run this tick) proceeds to RUN, the others are absorbed.
//!
//! Completions carry the tick generation they ran in. `reset()` bumps the generation, so a
//! completion that straggles in after its tick was aborted is ignored by successors and
//! by the scheduler.
//!
//! Step faults (an `Err` or a panic) are caught on the node thread and reported as
//! `NodeEvent::Faulted`; the thread keeps serving later ticks. A step claimed before
//! `reset()` still runs to completion; `is_running()` lets the scheduler wait it out.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::Sender;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::error::EngineError;

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// One sampling or aggregation operation driven by a `Node`.
pub trait Task: Send + 'static {
    /// Runs once, on the node thread, right before the first step.
    fn init(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    fn step(&mut self) -> Result<(), TaskError>;
}

impl<F> Task for F
where
    F: FnMut() -> Result<(), TaskError> + Send + 'static,
{
    fn step(&mut self) -> Result<(), TaskError> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeFault {
    pub node: String,
    pub generation: u64,
    pub message: String,
}

/// Sent by node threads to the owning scheduler.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Completed {
        node_id: u64,
        generation: u64,
        exec: Duration,
    },
    Faulted(NodeFault),
}

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct NodeState {
    fan_in: usize,
    pending: usize,
    triggered: bool,
    has_run: bool,
    running: bool,
    done: bool,
    generation: u64,
    stop: bool,
}

struct Shared {
    id: u64,
    name: String,
    state: Mutex<NodeState>,
    wake: Condvar,
    successors: Mutex<Vec<Node>>,
    events: Mutex<Option<Sender<NodeEvent>>>,
    task: Mutex<Option<Box<dyn Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, clonable handle; clones refer to the same node.
#[derive(Clone)]
pub struct Node(Arc<Shared>);

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish()
    }
}

impl Node {
    pub fn new(name: impl Into<String>, task: impl Task) -> Self {
        Node(Arc::new(Shared {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(NodeState::default()),
            wake: Condvar::new(),
            successors: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            task: Mutex::new(Some(Box::new(task))),
            handle: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Wires `self -> other`: `other` waits for this node every tick.
    pub fn next_to(&self, other: &Node) {
        self.0.successors.lock().push(other.clone());
        let mut st = other.0.state.lock();
        st.fan_in += 1;
        st.pending += 1;
    }

    pub fn fan_in(&self) -> usize {
        self.0.state.lock().fan_in
    }

    /// Routes completion and fault events to a scheduler.
    pub fn attach(&self, events: Sender<NodeEvent>) {
        *self.0.events.lock() = Some(events);
    }

    /// Spawns the node thread.
    pub fn start(&self) -> Result<(), EngineError> {
        let task = self
            .0
            .task
            .lock()
            .take()
            .ok_or_else(|| EngineError::AlreadyStarted(self.0.name.clone()))?;
        let shared = self.0.clone();
        let handle = thread::Builder::new()
            .name(self.0.name.clone())
            .spawn(move || run(shared, task))
            .map_err(|source| EngineError::Spawn {
                name: self.0.name.clone(),
                source,
            })?;
        *self.0.handle.lock() = Some(handle);
        Ok(())
    }

    /// Requests termination and forces a wake so the thread observes it.
    pub fn stop(&self) {
        let mut st = self.0.state.lock();
        st.stop = true;
        self.0.wake.notify_all();
    }

    /// Waits for the node thread to exit. Call after `stop()`.
    pub fn join(&self) -> Result<(), EngineError> {
        let handle = self.0.handle.lock().take();
        match handle {
            Some(h) => h
                .join()
                .map_err(|_| EngineError::Panicked(self.0.name.clone())),
            None => Ok(()),
        }
    }

    /// Clears per-tick state and moves to the next generation.
    pub fn reset(&self) {
        let mut st = self.0.state.lock();
        st.has_run = false;
        st.done = false;
        st.triggered = false;
        st.pending = st.fan_in;
        st.generation += 1;
    }

    /// Wakes the node for the current tick (used on entry nodes).
    pub fn trigger(&self) {
        let mut st = self.0.state.lock();
        st.triggered = true;
        self.0.wake.notify_one();
    }

    pub fn is_done(&self) -> bool {
        self.0.state.lock().done
    }

    pub fn has_run(&self) -> bool {
        self.0.state.lock().has_run
    }

    /// True while a step is executing, whatever generation it was claimed in.
    pub fn is_running(&self) -> bool {
        self.0.state.lock().running
    }

    pub fn generation(&self) -> u64 {
        self.0.state.lock().generation
    }

    fn predecessor_done(&self, generation: u64) {
        let mut st = self.0.state.lock();
        if st.generation != generation {
            return;
        }
        st.pending = st.pending.saturating_sub(1);
        st.triggered = true;
        self.0.wake.notify_one();
    }
}

fn run(shared: Arc<Shared>, mut task: Box<dyn Task>) {
    let mut initialised = false;
    loop {
        let generation = {
            let mut st = shared.state.lock();
            loop {
                if st.stop {
                    debug!("[{}] stopped", shared.name);
                    return;
                }
                if st.triggered {
                    st.triggered = false;
                    if !st.has_run && st.pending == 0 {
                        st.has_run = true;
                        st.running = true;
                        break st.generation;
                    }
                }
                shared.wake.wait(&mut st);
            }
        };

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if !initialised {
                task.init()?;
                initialised = true;
            }
            task.step()
        }));
        let exec = started.elapsed();

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };

        {
            let mut st = shared.state.lock();
            st.running = false;
            if fault.is_none() && st.generation == generation {
                st.done = true;
            }
        }

        let events = shared.events.lock().clone();
        match fault {
            None => {
                if let Some(tx) = &events {
                    let _ = tx.send(NodeEvent::Completed {
                        node_id: shared.id,
                        generation,
                        exec,
                    });
                }
                let successors = shared.successors.lock().clone();
                for next in &successors {
                    next.predecessor_done(generation);
                }
            }
            Some(message) => {
                error!("[{}] step failed on generation {}: {}", shared.name, generation, message);
                if let Some(tx) = &events {
                    let _ = tx.send(NodeEvent::Faulted(NodeFault {
                        node: shared.name.clone(),
                        generation,
                        message,
                    }));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
