//! Tracing integration for structured logging and spans.

use crate::status::ExecutionStatus;
use tracing::{Level, Span, span};

/// Create a span for a pipeline run.
///
/// # Example
///
/// ```rust
/// use vidpipe::observability::span_pipeline;
///
/// let span = span_pipeline("tracker");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_pipeline(name: &str) -> Span {
    span!(Level::INFO, "pipeline", name = %name)
}

/// Create a span for one node's worker or step.
#[inline]
pub fn span_node(pipeline: &str, node: &str, stage_type: &str) -> Span {
    span!(
        Level::DEBUG,
        "node",
        pipeline = %pipeline,
        node = %node,
        stage_type = %stage_type
    )
}

/// Log a node's status for the current tick.
#[inline]
pub fn trace_node_status(pipeline: &str, node: &str, status: ExecutionStatus) {
    tracing::trace!(
        pipeline = %pipeline,
        node = %node,
        status = %status,
        "node executed"
    );
}

/// Log that a pipeline has drained.
#[inline]
pub fn trace_finished(pipeline: &str, ticks: u64) {
    tracing::debug!(pipeline = %pipeline, ticks, "pipeline finished");
}
