//! Bounded status/value queue between two asynchronous workers.

use crate::error::{Error, Result};
use crate::observability::EdgeMetrics;
use crate::status::ExecutionStatus;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One item read from an edge.
#[derive(Debug)]
pub struct EdgeRead<T> {
    /// Status the producer published.
    pub status: ExecutionStatus,
    /// Value published alongside a `SUCCESS` status, if any.
    pub value: Option<T>,
}

impl<T> EdgeRead<T> {
    fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Counters describing an edge's traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeStats {
    /// Statuses currently queued.
    pub depth: usize,
    /// Largest depth observed.
    pub max_depth: usize,
    /// Total `publish` calls that enqueued a status.
    pub published: u64,
    /// Total statuses handed to the consumer.
    pub consumed: u64,
    /// Number of flushes.
    pub flushes: u64,
    /// Statuses discarded by flushes.
    pub discarded: u64,
    /// Times the producer blocked on a full queue.
    pub producer_waits: u64,
}

struct EdgeState<T> {
    statuses: VecDeque<ExecutionStatus>,
    // One entry per queued SUCCESS status; `None` for edges without data.
    values: VecDeque<Option<T>>,
    pending_flush: bool,
    no_more_input: bool,
    closed: bool,
    stats: EdgeStats,
}

impl<T> EdgeState<T> {
    fn clear(&mut self) -> usize {
        let dropped = self.statuses.len();
        self.statuses.clear();
        self.values.clear();
        self.stats.depth = 0;
        dropped
    }
}

/// A bounded FIFO of `(status, value)` pairs with flush and sticky-failure
/// semantics.
///
/// - [`publish`](BoundedEdge::publish) blocks while the queue holds
///   `capacity` statuses (`capacity == 0` means unbounded).
/// - Publishing `FLUSH` discards everything queued; the consumer's next
///   read returns `FLUSH`.
/// - Once a consumer reads `FAILURE` and the queue is empty, the edge is
///   latched and every later [`consume`](BoundedEdge::consume) returns
///   `FAILURE` immediately until [`reset`](BoundedEdge::reset).
///
/// Each edge has its own lock and two condition variables; there is no
/// global scheduler lock.
///
/// # Example
///
/// ```rust
/// use vidpipe::edge::BoundedEdge;
/// use vidpipe::status::ExecutionStatus;
///
/// let edge = BoundedEdge::new(2);
/// edge.publish(ExecutionStatus::Success, Some(1));
/// edge.publish(ExecutionStatus::Failure, None);
///
/// assert_eq!(edge.consume().value, Some(1));
/// assert_eq!(edge.consume().status, ExecutionStatus::Failure);
/// // Latched: no blocking from here on.
/// assert_eq!(edge.consume().status, ExecutionStatus::Failure);
/// ```
pub struct BoundedEdge<T> {
    label: String,
    capacity: usize,
    state: Mutex<EdgeState<T>>,
    data_available: Condvar,
    not_full: Condvar,
    consumer_active: AtomicBool,
    metrics: EdgeMetrics,
}

impl<T> BoundedEdge<T> {
    /// Create an edge holding at most `capacity` statuses (0 = unbounded).
    pub fn new(capacity: usize) -> Self {
        let label = format!("edge-{capacity}");
        Self {
            metrics: EdgeMetrics::new(&label),
            label,
            capacity,
            state: Mutex::new(EdgeState {
                statuses: VecDeque::with_capacity(capacity.min(1024)),
                values: VecDeque::with_capacity(capacity.min(1024)),
                pending_flush: false,
                no_more_input: false,
                closed: false,
                stats: EdgeStats::default(),
            }),
            data_available: Condvar::new(),
            not_full: Condvar::new(),
            consumer_active: AtomicBool::new(false),
        }
    }

    /// Set the label used in logs and metrics.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self.metrics = EdgeMetrics::new(&self.label);
        self
    }

    /// Edge label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Maximum queued statuses (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, EdgeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_full(&self, state: &EdgeState<T>) -> bool {
        self.capacity != 0 && state.statuses.len() >= self.capacity
    }

    /// Publish the producer's status for this tick.
    ///
    /// `value` is kept only when `status` is `SUCCESS`. Blocks while the
    /// queue is full. Returns `false` if the edge was closed, in which case
    /// nothing was enqueued.
    pub fn publish(&self, status: ExecutionStatus, value: Option<T>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        if status == ExecutionStatus::Flush {
            let dropped = state.clear();
            state.pending_flush = true;
            state.stats.flushes += 1;
            state.stats.discarded += dropped as u64;
            self.metrics.record_flush();
            self.metrics.record_depth(0);
            tracing::debug!(edge = %self.label, dropped, "edge flushed");
            self.data_available.notify_all();
            self.not_full.notify_all();
            return true;
        }

        if self.is_full(&state) {
            state.stats.producer_waits += 1;
            tracing::trace!(edge = %self.label, depth = state.statuses.len(), "producer blocked");
        }
        while self.is_full(&state) && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return false;
        }

        state.statuses.push_back(status);
        if status == ExecutionStatus::Success {
            state.values.push_back(value);
        }
        let depth = state.statuses.len();
        state.stats.published += 1;
        state.stats.depth = depth;
        state.stats.max_depth = state.stats.max_depth.max(depth);
        self.metrics.record_depth(depth);

        self.data_available.notify_one();
        true
    }

    /// Read the next status, blocking until one is available.
    pub fn consume(&self) -> EdgeRead<T> {
        let mut state = self.lock();
        if state.no_more_input {
            return EdgeRead::status(ExecutionStatus::Failure);
        }
        while state.statuses.is_empty() && !state.pending_flush && !state.closed {
            state = self
                .data_available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.take(&mut state)
    }

    /// Like [`consume`](Self::consume) but gives up after `timeout`.
    pub fn consume_timeout(&self, timeout: Duration) -> Option<EdgeRead<T>> {
        let mut state = self.lock();
        if state.no_more_input {
            return Some(EdgeRead::status(ExecutionStatus::Failure));
        }
        while state.statuses.is_empty() && !state.pending_flush && !state.closed {
            let (s, result) = self
                .data_available
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            state = s;
            if result.timed_out() && state.statuses.is_empty() && !state.pending_flush {
                if state.closed {
                    break;
                }
                return None;
            }
        }
        Some(self.take(&mut state))
    }

    /// Read the next status without blocking.
    pub fn try_consume(&self) -> Option<EdgeRead<T>> {
        let mut state = self.lock();
        if state.no_more_input {
            return Some(EdgeRead::status(ExecutionStatus::Failure));
        }
        if state.statuses.is_empty() && !state.pending_flush && !state.closed {
            return None;
        }
        Some(self.take(&mut state))
    }

    fn take(&self, state: &mut EdgeState<T>) -> EdgeRead<T> {
        if state.pending_flush {
            state.pending_flush = false;
            state.stats.consumed += 1;
            return EdgeRead::status(ExecutionStatus::Flush);
        }

        let Some(status) = state.statuses.pop_front() else {
            // Closed and drained: nothing more will ever arrive.
            state.no_more_input = true;
            return EdgeRead::status(ExecutionStatus::Failure);
        };

        let value = if status == ExecutionStatus::Success {
            state.values.pop_front().flatten()
        } else {
            None
        };
        if status == ExecutionStatus::Failure && state.statuses.is_empty() {
            state.no_more_input = true;
            tracing::debug!(edge = %self.label, "no more input");
        }

        let depth = state.statuses.len();
        state.stats.consumed += 1;
        state.stats.depth = depth;
        self.metrics.record_depth(depth);
        self.not_full.notify_one();

        EdgeRead { status, value }
    }

    /// Number of queued statuses.
    pub fn len(&self) -> usize {
        self.lock().statuses.len()
    }

    /// Whether no status is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued values.
    pub fn pending_values(&self) -> usize {
        self.lock().values.len()
    }

    /// Whether a flush is waiting to be read.
    pub fn has_pending_flush(&self) -> bool {
        self.lock().pending_flush
    }

    /// Whether the sticky failure latch is set.
    pub fn is_exhausted(&self) -> bool {
        self.lock().no_more_input
    }

    /// Whether the edge was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the edge and wake both sides.
    ///
    /// A blocked producer returns `false`; the consumer drains what is
    /// queued and then reads `FAILURE`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.data_available.notify_all();
        self.not_full.notify_all();
    }

    /// Mark whether the downstream worker is running.
    pub fn set_consumer_active(&self, active: bool) {
        self.consumer_active.store(active, Ordering::Release);
    }

    /// Whether the downstream worker is running.
    pub fn is_consumer_active(&self) -> bool {
        self.consumer_active.load(Ordering::Acquire)
    }

    /// Clear both queues, the flush marker, the latch and the closed flag.
    ///
    /// Fails with [`Error::EdgeBusy`] while the consumer is active.
    pub fn reset(&self) -> Result<()> {
        if self.is_consumer_active() {
            return Err(Error::EdgeBusy(self.label.clone()));
        }
        let mut state = self.lock();
        if !state.statuses.is_empty() {
            tracing::warn!(
                edge = %self.label,
                pending = state.statuses.len(),
                "resetting edge with queued data"
            );
        }
        state.clear();
        state.pending_flush = false;
        state.no_more_input = false;
        state.closed = false;
        self.metrics.record_depth(0);
        self.not_full.notify_all();
        Ok(())
    }

    /// Traffic counters.
    pub fn stats(&self) -> EdgeStats {
        self.lock().stats
    }
}

impl<T> fmt::Debug for BoundedEdge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BoundedEdge")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("depth", &state.statuses.len())
            .field("pending_flush", &state.pending_flush)
            .field("no_more_input", &state.no_more_input)
            .field("closed", &state.closed)
            .finish()
    }
}
