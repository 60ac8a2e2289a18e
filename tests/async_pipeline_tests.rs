//! Integration tests for the thread-per-node scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;
use vidpipe::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet(name: &str, capacity: usize) -> AsyncPipeline {
    AsyncPipeline::with_config(
        name,
        AsyncConfig::default()
            .with_edge_capacity(capacity)
            .with_detailed_report(false),
    )
}

fn counter(limit: i32) -> FnSource<i32, impl FnMut() -> Emit<i32> + Send + 'static> {
    let mut n = 0;
    FnSource::new(move || {
        n += 1;
        if n <= limit { Emit::Value(n) } else { Emit::Done }
    })
}

/// Endless source that records whether its cancel hook ran.
struct EndlessSource {
    frame: u32,
    cancelled: Arc<AtomicBool>,
}

impl Stage for EndlessSource {
    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<u32>("frame")]
    }

    fn step(&mut self) -> ExecutionStatus {
        self.frame += 1;
        thread::sleep(Duration::from_micros(200));
        ExecutionStatus::Success
    }

    fn output(&self, _port: &str) -> Result<PortValue> {
        Ok(PortValue::new(self.frame))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Panics on its first step.
struct Exploding;

impl Stage for Exploding {
    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<i32>("value")]
    }

    fn step(&mut self) -> ExecutionStatus {
        panic!("stage exploded");
    }
}

#[test]
fn test_values_arrive_in_order() {
    init_tracing();
    let (sink, seen) = Collector::<i32>::new();
    let mut p = quiet("fifo", 3);
    let src = p.add("source", counter(200)).unwrap();
    let inc = p.add("inc", FnMap::new(|x: i32| Emit::Value(x + 1))).unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", inc, "input").unwrap();
    p.connect(inc, "output", dst, "value").unwrap();
    p.initialize().unwrap();

    p.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), (2..=201).collect::<Vec<_>>());
    assert!(p.is_done());

    let report = p.report();
    assert_eq!(report.node("inc").unwrap().stats.steps, 200);
    assert_eq!(report.node("sink").unwrap().status, Some(ExecutionStatus::Failure));
}

#[test]
fn test_multi_input_node_is_a_barrier() {
    init_tracing();
    let (sink, seen) = Collector::<i32>::new();
    let mut p = quiet("join", 2);
    let left = p.add("left", counter(5)).unwrap();
    let right = p.add("right", counter(5)).unwrap();
    let add = p
        .add("add", FnCombine::new(|a: i32, b: i32| Emit::Value(a * 10 + b)))
        .unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(left, "value", add, "a").unwrap();
    p.connect(right, "value", add, "b").unwrap();
    p.connect(add, "output", dst, "value").unwrap();
    p.initialize().unwrap();

    p.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![11, 22, 33, 44, 55]);
}

#[test]
fn test_skip_passes_without_value() {
    init_tracing();
    let (sink, seen) = Collector::<i32>::new();
    let mut p = quiet("skip", 4);
    let src = p.add("source", counter(10)).unwrap();
    let even = p
        .add(
            "even",
            FnMap::new(|x: i32| if x % 2 == 0 { Emit::Value(x) } else { Emit::Skip }),
        )
        .unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", even, "input").unwrap();
    p.connect(even, "output", dst, "value").unwrap();
    p.initialize().unwrap();

    p.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 8, 10]);
}

#[test]
fn test_flush_discards_queued_values() {
    init_tracing();
    let mut script = vec![
        Emit::Done,
        Emit::Value(30),
        Emit::Flush,
        Emit::Value(20),
        Emit::Value(10),
    ];
    let (sink, seen) = Collector::<i32>::new();
    let mut p = quiet("flush", 8);
    let src = p
        .add("source", FnSource::new(move || script.pop().unwrap_or(Emit::Done)))
        .unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", dst, "value").unwrap();
    p.initialize().unwrap();
    p.run().unwrap();

    // Values queued before the flush may have been dropped; the value
    // after it always arrives.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&30));
    assert!(seen.iter().all(|v| [10, 20, 30].contains(v)));
    let flushes: u64 = p.edge_stats().iter().map(|(_, s)| s.flushes).sum();
    assert_eq!(flushes, 1);
}

#[test]
fn test_optional_dependency_failure_is_ignored() {
    init_tracing();
    let (sink, seen) = Collector::<i32>::new();
    let mut p = quiet("optional", 2);
    let gate = p
        .add("gate", FnSource::new(|| Emit::<i32>::Done))
        .unwrap();
    let src = p.add("source", counter(20)).unwrap();
    let inc = p.add("inc", FnMap::new(|x: i32| Emit::Value(x + 1))).unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", inc, "input").unwrap();
    p.connect(inc, "output", dst, "value").unwrap();
    p.add_optional_execution_dependency(gate, inc).unwrap();
    p.initialize().unwrap();

    p.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), (2..=21).collect::<Vec<_>>());
}

#[test]
fn test_cancel_stops_endless_pipeline() {
    init_tracing();
    let cancelled = Arc::new(AtomicBool::new(false));
    let received = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&received);

    let mut p = quiet("endless", 2);
    let src = p
        .add(
            "camera",
            EndlessSource {
                frame: 0,
                cancelled: Arc::clone(&cancelled),
            },
        )
        .unwrap();
    let dst = p
        .add(
            "count",
            FnMap::new(move |frame: u32| {
                counted.store(frame, Ordering::SeqCst);
                Emit::Value(frame)
            }),
        )
        .unwrap();
    p.connect(src, "frame", dst, "input").unwrap();
    p.set_output_node(dst, true).unwrap();
    p.initialize().unwrap();

    p.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(p.is_running());
    assert!(!p.is_done());

    p.cancel().unwrap();
    assert!(!p.is_running());
    assert!(cancelled.load(Ordering::SeqCst));
    assert!(received.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_panicking_stage_is_reported() {
    init_tracing();
    let (sink, _) = Collector::<i32>::new();
    let mut p = quiet("panic", 2);
    let src = p.add("boom", Exploding).unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "value", dst, "value").unwrap();
    p.initialize().unwrap();

    match p.run() {
        Err(Error::WorkerPanicked(name)) => assert_eq!(name, "boom"),
        other => panic!("expected a worker panic, got {other:?}"),
    }
    assert_eq!(p.node_status(src).unwrap(), Some(ExecutionStatus::Failure));
    // The stage went down with its thread.
    assert!(matches!(p.stage(src), Err(Error::StageUnavailable(_))));
}

#[test]
fn test_non_output_branch_is_stopped() {
    init_tracing();
    let (sink, seen) = Collector::<u32>::new();
    let mut p = quiet("side", 2);
    let src = p
        .add(
            "camera",
            EndlessSource {
                frame: 0,
                cancelled: Arc::default(),
            },
        )
        .unwrap();
    let side = p
        .add("preview", FnMap::new(|frame: u32| Emit::Value(frame)))
        .unwrap();
    let stop_after = p
        .add(
            "first_ten",
            FnMap::new(|frame: u32| if frame <= 10 { Emit::Value(frame) } else { Emit::Done }),
        )
        .unwrap();
    let dst = p.add("sink", sink).unwrap();
    p.connect(src, "frame", side, "input").unwrap();
    p.connect(src, "frame", stop_after, "input").unwrap();
    p.connect(stop_after, "output", dst, "value").unwrap();
    p.set_output_node(side, false).unwrap();
    p.initialize().unwrap();

    p.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<_>>());
    assert!(!p.is_running());
}
