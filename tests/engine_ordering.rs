use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use teleop_sync::engine::node::{Node, TaskError};
use teleop_sync::engine::scheduler::{FaultPolicy, Scheduler};
use teleop_sync::error::EngineError;

type Log = Arc<Mutex<Vec<Instant>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Sleeps `work`, then records its completion time.
fn producer(work: Duration, done: &Log) -> impl FnMut() -> Result<(), TaskError> + Send + 'static {
    let done = done.clone();
    move || {
        thread::sleep(work);
        done.lock().push(Instant::now());
        Ok(())
    }
}

#[test]
fn successor_never_runs_before_all_predecessors_of_its_tick() {
    let (a_done, b_done, sink_started) = (log(), log(), log());
    let a = Node::new("pred_a", producer(Duration::from_micros(300), &a_done));
    let b = Node::new("pred_b", producer(Duration::from_micros(900), &b_done));
    let started = sink_started.clone();
    let sink = Node::new("sink", move || -> Result<(), TaskError> {
        started.lock().push(Instant::now());
        Ok(())
    });
    a.next_to(&sink);
    b.next_to(&sink);

    let mut scheduler = Scheduler::new(
        "fan_in",
        vec![a.clone(), b.clone()],
        vec![a, b, sink.clone()],
        vec![sink],
        200.0,
    )
    .unwrap();
    scheduler.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    scheduler.stop();
    let report = scheduler.join().unwrap();

    let a_done = a_done.lock();
    let b_done = b_done.lock();
    let sink_started = sink_started.lock();
    assert!(sink_started.len() >= 10, "only {} ticks ran", sink_started.len());
    assert_eq!(report.ticks_failed, 0);
    for (tick, start) in sink_started.iter().enumerate() {
        let latest = a_done[tick].max(b_done[tick]);
        assert!(*start >= latest, "tick {tick}: sink started before its predecessors finished");
    }
}

#[test]
fn overrunning_ticks_are_serialised_not_overlapped() {
    let latency = Duration::from_millis(20);
    let triggers = log();
    let seen = triggers.clone();
    let slow = Node::new("slow", move || -> Result<(), TaskError> {
        seen.lock().push(Instant::now());
        thread::sleep(latency);
        Ok(())
    });

    // period 5 ms, handler 20 ms
    let mut scheduler =
        Scheduler::new("overrun", vec![slow.clone()], vec![slow.clone()], vec![slow], 200.0).unwrap();
    scheduler.start().unwrap();
    thread::sleep(Duration::from_millis(250));
    scheduler.stop();
    let report = scheduler.join().unwrap();

    let triggers = triggers.lock();
    assert!(triggers.len() >= 4);
    for pair in triggers.windows(2) {
        assert!(pair[1] - pair[0] >= latency, "ticks overlapped: {:?}", pair[1] - pair[0]);
    }
    assert!(report.effective_hz() < 200.0);
}

#[test]
fn failing_step_skips_the_tick_and_keeps_ticking() {
    let mut calls = 0u32;
    let flaky = Node::new("flaky", move || -> Result<(), TaskError> {
        calls += 1;
        if calls % 3 == 0 {
            return Err(format!("read timeout on call {calls}").into());
        }
        Ok(())
    });
    let sink = Node::new("sink", || -> Result<(), TaskError> { Ok(()) });
    flaky.next_to(&sink);

    let mut scheduler = Scheduler::new(
        "skip",
        vec![flaky.clone()],
        vec![flaky, sink.clone()],
        vec![sink],
        500.0,
    )
    .unwrap();
    scheduler.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    scheduler.stop();
    let report = scheduler.join().unwrap();

    assert!(!report.halted);
    assert!(report.ticks_failed > 0);
    assert!(report.ticks_completed > report.ticks_failed);
    assert!(report.faults.iter().all(|f| f.node == "flaky"));
}

#[test]
fn halt_policy_stops_the_scheduler_instead_of_hanging() {
    let broken = Node::new("broken", || -> Result<(), TaskError> {
        panic!("driver crashed");
    });
    let sink = Node::new("sink", || -> Result<(), TaskError> { Ok(()) });
    broken.next_to(&sink);

    let mut scheduler = Scheduler::new(
        "halting",
        vec![broken.clone()],
        vec![broken, sink.clone()],
        vec![sink],
        100.0,
    )
    .unwrap()
    .with_fault_policy(FaultPolicy::Halt);
    scheduler.start().unwrap();

    // no stop(): the fault alone must end the loop
    let report = scheduler.join().unwrap();
    assert!(report.halted);
    assert_eq!(report.ticks_completed, 0);
    match report.into_result() {
        Err(EngineError::Halted { node, message, .. }) => {
            assert_eq!(node, "broken");
            assert!(message.contains("driver crashed"));
        }
        other => panic!("expected halt, got {other:?}"),
    }
}

#[test]
fn invalid_rate_is_rejected_before_start() {
    let node = Node::new("n", || -> Result<(), TaskError> { Ok(()) });
    assert!(Scheduler::new("bad", vec![node.clone()], vec![node.clone()], vec![node], 0.0).is_err());
}

type Spans = Arc<Mutex<Vec<(Instant, Instant)>>>;

#[test]
fn aborted_tick_finishes_its_running_steps_before_the_next_tick() {
    let slow_spans: Spans = Arc::new(Mutex::new(Vec::new()));
    let flaky_spans: Spans = Arc::new(Mutex::new(Vec::new()));

    let spans = slow_spans.clone();
    let slow = Node::new("slow", move || -> Result<(), TaskError> {
        let start = Instant::now();
        thread::sleep(Duration::from_millis(40));
        spans.lock().push((start, Instant::now()));
        Ok(())
    });
    let spans = flaky_spans.clone();
    let mut calls = 0u32;
    let flaky = Node::new("flaky", move || -> Result<(), TaskError> {
        calls += 1;
        let start = Instant::now();
        spans.lock().push((start, Instant::now()));
        if calls == 1 {
            return Err("bus error".into());
        }
        Ok(())
    });
    let sink = Node::new("sink", || -> Result<(), TaskError> { Ok(()) });
    slow.next_to(&sink);
    flaky.next_to(&sink);

    // period 5 ms; the fault lands while `slow` is still inside tick 0
    let mut scheduler = Scheduler::new(
        "aborted",
        vec![slow.clone(), flaky.clone()],
        vec![slow, flaky, sink.clone()],
        vec![sink],
        200.0,
    )
    .unwrap();
    scheduler.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    scheduler.stop();
    let report = scheduler.join().unwrap();
    assert_eq!(report.ticks_failed, 1);

    let slow_spans = slow_spans.lock();
    let flaky_spans = flaky_spans.lock();
    let ticks = slow_spans.len().min(flaky_spans.len());
    assert!(ticks >= 3, "only {ticks} ticks ran");
    for tick in 0..ticks - 1 {
        let ended = slow_spans[tick].1.max(flaky_spans[tick].1);
        let next_started = slow_spans[tick + 1].0.min(flaky_spans[tick + 1].0);
        assert!(next_started >= ended, "tick {} started before tick {tick} finished", tick + 1);
    }
}
