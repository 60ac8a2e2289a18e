//! Error types for vidpipe.
//!
//! Graph assembly and lifecycle operations return [`Result`]. Per-tick
//! outcomes are never errors; they are reported as
//! [`ExecutionStatus`](crate::status::ExecutionStatus) values.

use crate::stage::PortDirection;
use thiserror::Error;

/// Result type alias using vidpipe's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vidpipe operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No node with the given id or name exists in the pipeline.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node with this name was already added.
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// The node does not declare the named port.
    #[error("node '{node}' has no {direction} port '{port}'")]
    UnknownPort {
        /// Node name.
        node: String,
        /// Port name.
        port: String,
        /// Whether an input or output port was requested.
        direction: PortDirection,
    },

    /// Each input port accepts exactly one incoming edge.
    #[error("input port '{port}' of node '{node}' is already connected")]
    AlreadyConnected {
        /// Node name.
        node: String,
        /// Port name.
        port: String,
    },

    /// A required input port was left unconnected.
    #[error("required input port '{port}' of node '{node}' is not connected")]
    MissingInput {
        /// Node name.
        node: String,
        /// Port name.
        port: String,
    },

    /// Output and input port types differ.
    #[error("cannot connect {from}.{from_port} ({from_type}) to {to}.{to_port} ({to_type})")]
    TypeMismatch {
        /// Upstream node name.
        from: String,
        /// Upstream port name.
        from_port: String,
        /// Upstream value type.
        from_type: &'static str,
        /// Downstream node name.
        to: String,
        /// Downstream port name.
        to_port: String,
        /// Downstream value type.
        to_type: &'static str,
    },

    /// The connection would close a cycle in the execution dependencies.
    #[error("connecting '{from}' to '{to}' would create a cycle")]
    WouldCycle {
        /// Upstream node name.
        from: String,
        /// Downstream node name.
        to: String,
    },

    /// Nodes added without execution cannot take part in data flow.
    #[error("node '{0}' is registered without execution and cannot be connected")]
    NotExecutable(String),

    /// A port value held a different type than the port expects.
    #[error("port value type mismatch: expected {expected}, got {actual}")]
    ValueType {
        /// Type the receiver expected.
        expected: &'static str,
        /// Type the value actually holds.
        actual: &'static str,
    },

    /// The node's stage is currently owned by a worker thread.
    #[error("stage of node '{0}' is unavailable")]
    StageUnavailable(String),

    /// A stage reported an error from one of its lifecycle hooks.
    #[error("stage '{node}': {message}")]
    Stage {
        /// Node name.
        node: String,
        /// Stage-provided message.
        message: String,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The graph failed validation.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// The operation is not allowed while workers are running.
    #[error("pipeline '{0}' is running")]
    Running(String),

    /// An edge cannot be reset while its consumer is active.
    #[error("edge '{0}' has an active consumer")]
    EdgeBusy(String),

    /// A worker thread panicked; its stage is lost.
    #[error("worker for node '{0}' panicked")]
    WorkerPanicked(String),

    /// I/O error (thread spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Stage`] error.
    pub fn stage(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            node: node.into(),
            message: message.into(),
        }
    }
}
