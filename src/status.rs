//! Four-valued execution status and output aggregation.

use std::fmt;

/// Outcome of one stage step, one edge read, or one pipeline tick.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// Fresh output was produced.
    Success = 1,
    /// Unrecoverable; the node stays failed until reset.
    Failure = 2,
    /// No output this tick, but the stage is still alive.
    Skip = 3,
    /// Discard buffered data and resynchronize.
    Flush = 4,
}

impl ExecutionStatus {
    /// Returns `true` for [`ExecutionStatus::Success`].
    #[inline]
    pub fn is_success(self) -> bool {
        self == ExecutionStatus::Success
    }

    /// Returns `true` for [`ExecutionStatus::Failure`].
    #[inline]
    pub fn is_failure(self) -> bool {
        self == ExecutionStatus::Failure
    }

    /// Map a boolean step result the way simple stages report it.
    #[inline]
    pub fn from_bool(ok: bool) -> Self {
        if ok {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        }
    }

    pub(crate) fn encode(status: Option<ExecutionStatus>) -> u8 {
        status.map_or(0, |s| s as u8)
    }

    pub(crate) fn decode(raw: u8) -> Option<ExecutionStatus> {
        match raw {
            1 => Some(ExecutionStatus::Success),
            2 => Some(ExecutionStatus::Failure),
            3 => Some(ExecutionStatus::Skip),
            4 => Some(ExecutionStatus::Flush),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Skip => "SKIP",
            ExecutionStatus::Flush => "FLUSH",
        };
        f.write_str(s)
    }
}

/// Folds the statuses of all output nodes into one pipeline result.
///
/// Precedence: `FAILURE` only when every output failed, then `FLUSH` if
/// any output flushed, then `SKIP` if any skipped, otherwise `SUCCESS`.
#[derive(Debug, Clone, Copy)]
pub struct OutputSummary {
    all_failed: bool,
    any_skipped: bool,
    any_flushed: bool,
    count: usize,
}

impl Default for OutputSummary {
    fn default() -> Self {
        Self {
            all_failed: true,
            any_skipped: false,
            any_flushed: false,
            count: 0,
        }
    }
}

impl OutputSummary {
    /// Create an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one output node's status.
    pub fn record(&mut self, status: ExecutionStatus) {
        self.count += 1;
        match status {
            ExecutionStatus::Failure => {}
            ExecutionStatus::Skip => {
                self.all_failed = false;
                self.any_skipped = true;
            }
            ExecutionStatus::Flush => {
                self.all_failed = false;
                self.any_flushed = true;
            }
            ExecutionStatus::Success => self.all_failed = false,
        }
    }

    /// Number of statuses recorded.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether every recorded output failed (vacuously true when empty).
    pub fn all_failed(&self) -> bool {
        self.all_failed
    }

    /// The aggregate status.
    pub fn resolve(&self) -> ExecutionStatus {
        if self.all_failed {
            ExecutionStatus::Failure
        } else if self.any_flushed {
            ExecutionStatus::Flush
        } else if self.any_skipped {
            ExecutionStatus::Skip
        } else {
            ExecutionStatus::Success
        }
    }
}

impl FromIterator<ExecutionStatus> for OutputSummary {
    fn from_iter<I: IntoIterator<Item = ExecutionStatus>>(iter: I) -> Self {
        let mut summary = OutputSummary::new();
        for status in iter {
            summary.record(status);
        }
        summary
    }
}
