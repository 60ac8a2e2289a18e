//! Edges between asynchronous workers.
//!
//! The synchronous scheduler needs no edge object: it copies each upstream
//! output straight into the downstream input in execution order. The
//! asynchronous scheduler connects workers through [`BoundedEdge`]s, which
//! are the only synchronization between them.

mod bounded;

pub use bounded::{BoundedEdge, EdgeRead, EdgeStats};
