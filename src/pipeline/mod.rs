//! Pipeline construction and execution.
//!
//! This module provides the core pipeline infrastructure:
//!
//! - [`PipelineGraph`]: The node/edge DAG shared by both schedulers
//! - [`Node`]: A stage plus its ports, connections and last status
//! - [`SyncPipeline`]: Tick-by-tick execution in the caller's thread
//! - [`AsyncPipeline`]: One worker thread per node, joined by bounded edges
//!
//! # Example
//!
//! ```rust
//! use vidpipe::prelude::*;
//!
//! let mut frames = 0u32;
//! let camera = FnSource::new(move || {
//!     frames += 1;
//!     if frames <= 10 { Emit::Value(frames) } else { Emit::Done }
//! });
//! let detector = FnMap::new(|frame: u32| {
//!     if frame % 2 == 0 { Emit::Value(frame) } else { Emit::Skip }
//! });
//! let (sink, seen) = Collector::<u32>::new();
//!
//! let mut pipeline = SyncPipeline::with_config("cameras", SyncConfig::quiet());
//! let cam = pipeline.add("camera", camera)?;
//! let det = pipeline.add("detector", detector)?;
//! let out = pipeline.add("sink", sink)?;
//! pipeline.connect(cam, "value", det, "input")?;
//! pipeline.connect(det, "output", out, "value")?;
//! pipeline.initialize()?;
//!
//! assert_eq!(pipeline.run(), 11);
//! assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 8, 10]);
//! # Ok::<(), vidpipe::Error>(())
//! ```

mod async_pipeline;
mod graph;
mod node;
mod report;
mod sync_pipeline;
mod worker;

pub use async_pipeline::{AsyncConfig, AsyncPipeline};
pub use graph::{Connection, NodeId, PipelineGraph};
pub use node::{Node, NodeStats, OutputFlag};
pub use report::{NodeReport, PipelineReport};
pub use sync_pipeline::{SyncConfig, SyncPipeline};
