//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters, gauges and histograms via `metrics-rs`. No
//!   exporter is bundled; install one in the application.
//! - **Tracing**: structured logs and spans via `tracing`.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `vidpipe_node_steps` | Counter | Node executions by `status` label |
//! | `vidpipe_node_step_time_ns` | Histogram | Time inside `Stage::step` |
//! | `vidpipe_pipeline_ticks` | Counter | Synchronous scheduler ticks |
//! | `vidpipe_edge_depth` | Gauge | Statuses pending on an async edge |
//! | `vidpipe_edge_flushes` | Counter | Flushes that cleared an async edge |
//!
//! ## Example
//!
//! ```rust
//! use vidpipe::observability::init_metrics;
//!
//! // Call once at startup; later calls are no-ops.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use self::metrics::{
    EdgeMetrics, NodeMetrics, PipelineMetrics, ThroughputMeter, init_metrics,
};
pub use tracing_support::{span_node, span_pipeline, trace_finished, trace_node_status};
