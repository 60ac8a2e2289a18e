//! Metrics collection using metrics-rs.

use crate::status::ExecutionStatus;
use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const NODE_STEPS: &str = "vidpipe_node_steps";
const NODE_STEP_TIME_NS: &str = "vidpipe_node_step_time_ns";
const PIPELINE_TICKS: &str = "vidpipe_pipeline_ticks";
const EDGE_DEPTH: &str = "vidpipe_edge_depth";
const EDGE_FLUSHES: &str = "vidpipe_edge_flushes";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        NODE_STEPS,
        Unit::Count,
        "Node executions, labelled by resulting status"
    );
    metrics::describe_histogram!(
        NODE_STEP_TIME_NS,
        Unit::Nanoseconds,
        "Time spent inside a single stage step"
    );
    metrics::describe_counter!(
        PIPELINE_TICKS,
        Unit::Count,
        "Ticks executed by the synchronous scheduler"
    );
    metrics::describe_gauge!(
        EDGE_DEPTH,
        Unit::Count,
        "Statuses pending on an asynchronous edge"
    );
    metrics::describe_counter!(
        EDGE_FLUSHES,
        Unit::Count,
        "Flushes that discarded queued data on an edge"
    );
}

/// Per-edge metric handles, labelled once when the edge is named.
#[derive(Clone)]
pub struct EdgeMetrics {
    depth: Gauge,
    flushes: Counter,
}

impl EdgeMetrics {
    /// Create handles for the edge with the given label.
    pub fn new(edge: &str) -> Self {
        Self {
            depth: gauge!(EDGE_DEPTH, "edge" => edge.to_string()),
            flushes: counter!(EDGE_FLUSHES, "edge" => edge.to_string()),
        }
    }

    /// Record the number of statuses pending on the edge.
    #[inline]
    pub fn record_depth(&self, depth: usize) {
        self.depth.set(depth as f64);
    }

    /// Record a flush.
    #[inline]
    pub fn record_flush(&self) {
        self.flushes.increment(1);
    }
}

/// Per-node metric handles with pre-configured labels.
#[derive(Clone)]
pub struct NodeMetrics {
    success: Counter,
    failure: Counter,
    skip: Counter,
    flush: Counter,
    step_time: Histogram,
}

impl NodeMetrics {
    /// Create handles for one node of one pipeline.
    pub fn new(pipeline: &str, node: &str) -> Self {
        let steps = |status: &'static str| {
            counter!(
                NODE_STEPS,
                "pipeline" => pipeline.to_string(),
                "node" => node.to_string(),
                "status" => status
            )
        };
        Self {
            success: steps("success"),
            failure: steps("failure"),
            skip: steps("skip"),
            flush: steps("flush"),
            step_time: histogram!(
                NODE_STEP_TIME_NS,
                "pipeline" => pipeline.to_string(),
                "node" => node.to_string()
            ),
        }
    }

    /// Record the status a node ended a tick with.
    #[inline]
    pub fn record_status(&self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success => self.success.increment(1),
            ExecutionStatus::Failure => self.failure.increment(1),
            ExecutionStatus::Skip => self.skip.increment(1),
            ExecutionStatus::Flush => self.flush.increment(1),
        }
    }

    /// Record the time spent in `Stage::step`.
    #[inline]
    pub fn record_step_time(&self, duration: Duration) {
        self.step_time.record(duration.as_nanos() as f64);
    }
}

/// Metric handles for a whole pipeline.
#[derive(Clone)]
pub struct PipelineMetrics {
    name: String,
    ticks: Counter,
}

impl PipelineMetrics {
    /// Create handles for the named pipeline.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ticks: counter!(PIPELINE_TICKS, "pipeline" => name.to_string()),
        }
    }

    /// Record one scheduler tick.
    #[inline]
    pub fn record_tick(&self) {
        self.ticks.increment(1);
    }

    /// Get the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Logs ticks per second at a fixed interval.
#[derive(Debug)]
pub struct ThroughputMeter {
    interval: Option<Duration>,
    window_start: Instant,
    window_ticks: u64,
}

impl ThroughputMeter {
    /// Create a meter; `None` disables logging.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            window_ticks: 0,
        }
    }

    /// Count one tick. Returns the rate when a report was due.
    pub fn tick(&mut self, pipeline: &str) -> Option<f64> {
        let interval = self.interval?;
        self.window_ticks += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < interval {
            return None;
        }
        let rate = self.window_ticks as f64 / elapsed.as_secs_f64();
        tracing::info!(
            pipeline = %pipeline,
            ticks = self.window_ticks,
            rate = format_args!("{rate:.2}"),
            "ticks per second"
        );
        self.window_start = Instant::now();
        self.window_ticks = 0;
        Some(rate)
    }

    /// Start a fresh measurement window.
    pub fn restart(&mut self) {
        self.window_start = Instant::now();
        self.window_ticks = 0;
    }
}
