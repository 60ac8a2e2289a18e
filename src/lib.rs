//! # vidpipe
//!
//! A pipeline execution engine for video-analytics graphs.
//!
//! A pipeline is a DAG of nodes, each wrapping a [`Stage`](stage::Stage):
//! a unit of work such as a decoder, detector, tracker or sink with typed
//! input and output ports. Every step reports one of four statuses
//! ([`ExecutionStatus`](status::ExecutionStatus)), and the schedulers
//! propagate those statuses through the graph instead of raising errors.
//!
//! ## Features
//!
//! - **Synchronous scheduling**: deterministic tick-by-tick execution in
//!   the caller's thread
//! - **Asynchronous scheduling**: one worker thread per node, joined by
//!   bounded edges with backpressure
//! - **Flush and failure propagation**: discontinuities clear queued data,
//!   end of stream latches
//! - **Composite stages**: nested pipelines embedded as a single stage
//! - **Hierarchical configuration**: `node:param` blocks routed to stages
//!
//! ## Quick Start
//!
//! ```rust
//! use vidpipe::prelude::*;
//!
//! let mut n = 0;
//! let source = FnSource::new(move || {
//!     n += 1;
//!     if n <= 5 { Emit::Value(n) } else { Emit::Done }
//! });
//! let (sink, seen) = Collector::<i32>::new();
//!
//! let mut pipeline = SyncPipeline::with_config("quickstart", SyncConfig::quiet());
//! let src = pipeline.add("source", source)?;
//! let dst = pipeline.add("sink", sink)?;
//! pipeline.connect(src, "value", dst, "value")?;
//! pipeline.initialize()?;
//! pipeline.run();
//!
//! assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
//! # Ok::<(), vidpipe::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite;
pub mod config;
pub mod edge;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod stage;
pub mod stages;
pub mod status;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::composite::{AsyncCompositeStage, CompositeStage};
    pub use crate::config::{ConfigBlock, ConfigValue};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{AsyncConfig, AsyncPipeline, NodeId, SyncConfig, SyncPipeline};
    pub use crate::stage::{PortDirection, PortSpec, PortValue, Stage};
    pub use crate::stages::{Collector, Emit, FnCombine, FnMap, FnSource};
    pub use crate::status::{ExecutionStatus, OutputSummary};
}

pub use error::{Error, Result};
