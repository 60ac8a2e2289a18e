//! Thread-per-node scheduler.
//!
//! Every executable node runs in its own worker thread. Nodes exchange
//! statuses and values through [`BoundedEdge`]s, so a slow consumer
//! throttles its producers and a fast stage is never held back by an
//! unrelated branch. The graph API is the same as [`SyncPipeline`]'s.
//!
//! [`SyncPipeline`]: super::SyncPipeline

use super::graph::{NodeId, PipelineGraph};
use super::report::PipelineReport;
use super::worker::{NodeActivity, Worker, WorkerInput, WorkerOutput};
use crate::config::ConfigBlock;
use crate::edge::{BoundedEdge, EdgeStats};
use crate::error::{Error, Result};
use crate::observability::{span_pipeline, trace_finished};
use crate::stage::{PortDirection, PortValue, Stage};
use crate::status::ExecutionStatus;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`AsyncPipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncConfig {
    /// Statuses an edge holds before its producer blocks (0 = unbounded).
    pub edge_capacity: usize,
    /// Log a per-node report when the pipeline finishes.
    pub detailed_report: bool,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            edge_capacity: 10,
            detailed_report: true,
        }
    }
}

impl AsyncConfig {
    /// Set the edge capacity.
    pub fn with_edge_capacity(mut self, capacity: usize) -> Self {
        self.edge_capacity = capacity;
        self
    }

    /// Enable or disable the final report.
    pub fn with_detailed_report(mut self, enabled: bool) -> Self {
        self.detailed_report = enabled;
        self
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// An edge owned outside the pipeline, spliced onto one port of a node.
struct ExternalEdge {
    node: NodeId,
    port: String,
    edge: Arc<BoundedEdge<PortValue>>,
}

struct WorkerHandle {
    node: NodeId,
    critical: bool,
    activity: Arc<NodeActivity>,
    handle: JoinHandle<super::worker::WorkerExit>,
}

/// A pipeline whose nodes run concurrently, one thread each.
///
/// The run ends once every output node has failed, which happens when the
/// sources run dry and their `FAILURE` reaches the outputs. Workers off
/// the output paths are then stopped.
///
/// # Example
///
/// ```rust
/// use vidpipe::prelude::*;
///
/// let mut n = 0;
/// let source = FnSource::new(move || {
///     n += 1;
///     if n <= 100 { Emit::Value(n) } else { Emit::Done }
/// });
/// let (sink, seen) = Collector::<i32>::new();
///
/// let mut pipeline = AsyncPipeline::with_config("demo", AsyncConfig::default().with_edge_capacity(4));
/// let src = pipeline.add("source", source).unwrap();
/// let dst = pipeline.add("sink", sink).unwrap();
/// pipeline.connect(src, "value", dst, "value").unwrap();
/// pipeline.initialize().unwrap();
/// pipeline.run().unwrap();
///
/// assert_eq!(seen.lock().unwrap().len(), 100);
/// ```
pub struct AsyncPipeline {
    name: String,
    graph: PipelineGraph,
    config: AsyncConfig,
    edges: Vec<Arc<BoundedEdge<PortValue>>>,
    feeds: Vec<ExternalEdge>,
    taps: Vec<ExternalEdge>,
    workers: Vec<WorkerHandle>,
    stop: Arc<AtomicBool>,
    done_rx: Option<kanal::Receiver<NodeId>>,
    initialized: bool,
    finished: bool,
}

impl AsyncPipeline {
    /// Create an empty pipeline with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, AsyncConfig::default())
    }

    /// Create an empty pipeline with the given configuration.
    pub fn with_config(name: impl Into<String>, config: AsyncConfig) -> Self {
        let name = name.into();
        Self {
            graph: PipelineGraph::new(name.clone()),
            name,
            config,
            edges: Vec::new(),
            feeds: Vec::new(),
            taps: Vec::new(),
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            done_rx: None,
            initialized: false,
            finished: false,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &AsyncConfig {
        &self.config
    }

    /// The underlying graph.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.workers.is_empty() {
            Ok(())
        } else {
            Err(Error::Running(self.name.clone()))
        }
    }

    // ------------------------------------------------------------------------
    // Graph construction
    // ------------------------------------------------------------------------

    /// Add a scheduled node.
    pub fn add(&mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Result<NodeId> {
        self.add_boxed(name, Box::new(stage))
    }

    /// Add a scheduled node from a boxed stage.
    pub fn add_boxed(&mut self, name: impl Into<String>, stage: Box<dyn Stage>) -> Result<NodeId> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.add_node(name, stage, true)
    }

    /// Register a node for configuration only; it never gets a worker.
    pub fn add_without_execute(
        &mut self,
        name: impl Into<String>,
        stage: impl Stage + 'static,
    ) -> Result<NodeId> {
        self.ensure_idle()?;
        self.graph.add_node(name, Box::new(stage), false)
    }

    /// Connect an output port to an input port through a bounded edge.
    pub fn connect(&mut self, from: NodeId, from_port: &str, to: NodeId, to_port: &str) -> Result<()> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.connect(from, from_port, to, to_port, false).map(|_| ())
    }

    /// Connect ports so that an upstream `FAILURE` does not fail `to`.
    pub fn connect_optional(
        &mut self,
        from: NodeId,
        from_port: &str,
        to: NodeId,
        to_port: &str,
    ) -> Result<()> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.connect(from, from_port, to, to_port, true).map(|_| ())
    }

    /// Order `to` after `from`; the edge carries statuses only.
    pub fn add_execution_dependency(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.add_dependency(from, to, false).map(|_| ())
    }

    /// Order `to` after `from`, ignoring `from`'s failures.
    pub fn add_optional_execution_dependency(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.add_dependency(from, to, true).map(|_| ())
    }

    /// Force a node in or out of the set of output nodes.
    pub fn set_output_node(&mut self, id: NodeId, output: bool) -> Result<()> {
        self.ensure_idle()?;
        self.initialized = false;
        self.graph.set_output(id, output)
    }

    /// Feed `to.to_port` from an edge owned by the caller.
    ///
    /// The node's worker consumes `edge` like any internal input; a
    /// `FAILURE` on it fails the node. The worker closes the edge when it
    /// exits, so a blocked publisher is released.
    pub fn attach_input(
        &mut self,
        to: NodeId,
        to_port: &str,
        edge: Arc<BoundedEdge<PortValue>>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let node = self.graph.node(to)?;
        if !node.is_executable() {
            return Err(Error::NotExecutable(node.name().to_string()));
        }
        if node.input_port(to_port).is_none() {
            return Err(Error::UnknownPort {
                node: node.name().to_string(),
                port: to_port.to_string(),
                direction: PortDirection::Input,
            });
        }
        let fed = self.feeds.iter().any(|f| f.node == to && f.port == to_port);
        if fed || self.graph.is_input_connected(to, to_port) {
            return Err(Error::AlreadyConnected {
                node: node.name().to_string(),
                port: to_port.to_string(),
            });
        }
        self.feeds.push(ExternalEdge {
            node: to,
            port: to_port.to_string(),
            edge,
        });
        self.initialized = false;
        Ok(())
    }

    /// Publish every status of `from` (and the value of `from_port` on
    /// success) to an edge owned by the caller.
    pub fn attach_output(
        &mut self,
        from: NodeId,
        from_port: &str,
        edge: Arc<BoundedEdge<PortValue>>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let node = self.graph.node(from)?;
        if !node.is_executable() {
            return Err(Error::NotExecutable(node.name().to_string()));
        }
        if node.output_port(from_port).is_none() {
            return Err(Error::UnknownPort {
                node: node.name().to_string(),
                port: from_port.to_string(),
                direction: PortDirection::Output,
            });
        }
        self.taps.push(ExternalEdge {
            node: from,
            port: from_port.to_string(),
            edge,
        });
        self.initialized = false;
        Ok(())
    }

    fn all_edges(&self) -> impl Iterator<Item = &Arc<BoundedEdge<PortValue>>> {
        self.edges
            .iter()
            .chain(self.feeds.iter().map(|f| &f.edge))
            .chain(self.taps.iter().map(|t| &t.edge))
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Look up a node by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.graph.node_id(name)
    }

    /// Latest status of a node, read live while its worker runs.
    pub fn node_status(&self, id: NodeId) -> Result<Option<ExecutionStatus>> {
        let node = self.graph.node(id)?;
        Ok(self
            .workers
            .iter()
            .find(|w| w.node == id)
            .map_or_else(|| node.status(), |w| w.activity.status()))
    }

    /// Borrow a node's stage. Unavailable while the pipeline runs.
    pub fn stage(&self, id: NodeId) -> Result<&dyn Stage> {
        let node = self.graph.node(id)?;
        node.stage()
            .ok_or_else(|| Error::StageUnavailable(node.name().to_string()))
    }

    /// Mutably borrow a node's stage. Unavailable while the pipeline runs.
    pub fn stage_mut(&mut self, id: NodeId) -> Result<&mut (dyn Stage + 'static)> {
        let node = self.graph.node_mut(id)?;
        let name = node.name().to_string();
        node.stage_mut().ok_or(Error::StageUnavailable(name))
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Every node's parameters under a sub-block named after the node.
    pub fn params(&self) -> ConfigBlock {
        self.graph.params()
    }

    /// Configure every node, including nodes added without execution.
    pub fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
        self.ensure_idle()?;
        let ids = self.graph.node_ids().to_vec();
        self.graph.configure_nodes(block, &ids)
    }

    /// Configure `id` and every node downstream of it.
    pub fn configure_downstream(&mut self, block: &ConfigBlock, id: NodeId) -> Result<()> {
        self.ensure_idle()?;
        self.graph.node(id)?;
        let ids = self.graph.downstream_nodes(id);
        self.graph.configure_nodes(block, &ids)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Validate the graph, create the edges and initialize every scheduled
    /// stage.
    pub fn initialize(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let feeds = &self.feeds;
        self.graph
            .validate_with(|id, port| feeds.iter().any(|f| f.node == id && f.port == port))?;

        for id in self.graph.execution_order() {
            let node = self.graph.node_mut(id)?;
            let name = node.name().to_string();
            let stage = node
                .stage_mut()
                .ok_or_else(|| Error::StageUnavailable(name.clone()))?;
            if let Err(e) = stage.initialize() {
                tracing::error!(pipeline = %self.name, node = %name, error = %e, "initialize failed");
                return Err(e);
            }
        }

        let capacity = self.config.edge_capacity;
        self.edges = self
            .graph
            .edge_indices()
            .map(|e| {
                let label = self.edge_label(e);
                Arc::new(BoundedEdge::new(capacity).with_label(label))
            })
            .collect();

        self.initialized = true;
        self.finished = false;
        tracing::debug!(
            pipeline = %self.name,
            edges = self.edges.len(),
            capacity,
            "pipeline initialized"
        );
        Ok(())
    }

    fn edge_label(&self, edge: daggy::EdgeIndex) -> String {
        let (Some(conn), Some((from, to))) =
            (self.graph.connection(edge), self.graph.endpoints(edge))
        else {
            return format!("edge-{}", edge.index());
        };
        let name = |id: NodeId| {
            self.graph
                .node(id)
                .map(|n| n.name().to_string())
                .unwrap_or_default()
        };
        match (conn.from_port(), conn.to_port()) {
            (Some(fp), Some(tp)) => format!("{}.{fp} -> {}.{tp}", name(from), name(to)),
            _ => format!("{} -> {}", name(from), name(to)),
        }
    }

    /// Whether [`initialize`](Self::initialize) succeeded since the last
    /// graph change.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Spawn one worker per scheduled node and return immediately.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_idle()?;
        if !self.initialized {
            return Err(Error::InvalidPipeline(format!(
                "pipeline '{}' must be initialized before start",
                self.name
            )));
        }

        let order = self.graph.execution_order();
        for &id in &order {
            let node = self.graph.node(id)?;
            if node.stage().is_none() {
                return Err(Error::StageUnavailable(node.name().to_string()));
            }
        }
        for edge in self.all_edges() {
            edge.reset()?;
        }

        self.stop.store(false, Ordering::Release);
        self.finished = false;
        let (done_tx, done_rx) = kanal::unbounded();

        for id in order {
            let worker = match self.prepare_worker(id, done_tx.clone()) {
                Ok(worker) => worker,
                Err(e) => {
                    self.abort_start();
                    return Err(e);
                }
            };
            let activity = Arc::clone(&worker.activity);
            let critical = worker.is_output;
            let thread_name = format!("{}:{}", self.name, worker.name);
            match std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker.run())
            {
                Ok(handle) => self.workers.push(WorkerHandle {
                    node: id,
                    critical,
                    activity,
                    handle,
                }),
                Err(e) => {
                    tracing::error!(pipeline = %self.name, error = %e, "failed to spawn worker");
                    // The stage went down with the closure.
                    if let Ok(node) = self.graph.node_mut(id) {
                        node.status = Some(ExecutionStatus::Failure);
                    }
                    self.abort_start();
                    return Err(Error::Io(e));
                }
            }
        }

        self.done_rx = Some(done_rx);
        tracing::info!(pipeline = %self.name, workers = self.workers.len(), "pipeline started");
        Ok(())
    }

    fn prepare_worker(&mut self, id: NodeId, done: kanal::Sender<NodeId>) -> Result<Worker> {
        let node = self.graph.node(id)?;
        let inputs = node
            .incoming
            .iter()
            .filter_map(|&e| {
                let conn = self.graph.connection(e)?;
                Some(WorkerInput {
                    edge: Arc::clone(self.edges.get(e.index())?),
                    port: conn.to_port().map(str::to_string),
                    optional: conn.is_optional(),
                })
            })
            .chain(self.feeds.iter().filter(|f| f.node == id).map(|f| WorkerInput {
                edge: Arc::clone(&f.edge),
                port: Some(f.port.clone()),
                optional: false,
            }))
            .collect::<Vec<_>>();
        let outputs = node
            .outgoing
            .iter()
            .filter_map(|&e| {
                let conn = self.graph.connection(e)?;
                Some(WorkerOutput {
                    edge: Arc::clone(self.edges.get(e.index())?),
                    port: conn.from_port().map(str::to_string),
                })
            })
            .chain(self.taps.iter().filter(|t| t.node == id).map(|t| WorkerOutput {
                edge: Arc::clone(&t.edge),
                port: Some(t.port.clone()),
            }))
            .collect::<Vec<_>>();
        let is_output = self.graph.is_output(id);

        let node = self.graph.node_mut(id)?;
        let name = node.name().to_string();
        let stage = node
            .take_stage()
            .ok_or_else(|| Error::StageUnavailable(name.clone()))?;
        node.status = None;
        for input in &inputs {
            input.edge.set_consumer_active(true);
        }
        let activity = Arc::new(NodeActivity::default());
        activity.set_running(true);

        Ok(Worker {
            pipeline: self.name.clone(),
            node: id,
            type_name: node.type_name().to_string(),
            name,
            stage,
            inputs,
            outputs,
            is_output,
            activity,
            stop: Arc::clone(&self.stop),
            stats: node.stats,
            metrics: node.metrics.clone(),
            done,
        })
    }

    fn abort_start(&mut self) {
        self.done_rx = None;
        if let Err(e) = self.shutdown() {
            tracing::error!(pipeline = %self.name, error = %e, "shutdown after failed start");
        }
        for edge in self.all_edges() {
            edge.set_consumer_active(false);
        }
    }

    /// Block until every output node has finished, then stop the remaining
    /// workers and take the stages back.
    ///
    /// Returns [`Error::WorkerPanicked`] if a stage panicked; the node is
    /// marked `FAILURE` and its stage is lost.
    pub fn wait(&mut self) -> Result<()> {
        let Some(done_rx) = self.done_rx.take() else {
            return Ok(());
        };
        let mut pending: HashSet<NodeId> = self
            .workers
            .iter()
            .filter(|w| w.critical)
            .map(|w| w.node)
            .collect();
        while !pending.is_empty() {
            match done_rx.recv() {
                Ok(id) => {
                    pending.remove(&id);
                }
                Err(_) => break,
            }
        }
        tracing::debug!(pipeline = %self.name, "output nodes finished");
        self.shutdown()
    }

    /// Start the workers and wait for them to finish.
    pub fn run(&mut self) -> Result<()> {
        let span = span_pipeline(&self.name);
        let _guard = span.enter();
        self.start()?;
        let result = self.wait();
        let steps = self
            .graph
            .nodes()
            .map(|(_, n)| n.stats().steps)
            .max()
            .unwrap_or(0);
        trace_finished(&self.name, steps);
        result
    }

    /// Ask every worker to stop after its current step and join them.
    pub fn cancel(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }
        tracing::info!(pipeline = %self.name, "cancelling pipeline");
        self.done_rx = None;
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        for edge in self.all_edges() {
            edge.close();
        }

        let mut first_error = None;
        for worker in self.workers.drain(..) {
            let joined = worker.handle.join();
            let Ok(node) = self.graph.node_mut(worker.node) else {
                continue;
            };
            match joined {
                Ok(exit) => {
                    node.restore_stage(exit.stage);
                    node.stats = exit.stats;
                    node.status = exit.status;
                }
                Err(_) => {
                    tracing::error!(pipeline = %self.name, node = %node.name(), "worker panicked");
                    node.status = Some(ExecutionStatus::Failure);
                    first_error.get_or_insert_with(|| Error::WorkerPanicked(node.name().to_string()));
                }
            }
        }
        self.finished = true;

        if self.config.detailed_report {
            self.report().log();
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Whether any worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().any(|w| w.activity.is_running())
    }

    /// Whether every output node has finished.
    pub fn is_done(&self) -> bool {
        if self.workers.is_empty() {
            return self.finished;
        }
        self.workers
            .iter()
            .filter(|w| w.critical)
            .all(|w| !w.activity.is_running())
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// Clear every edge and node status and reset every scheduled stage,
    /// so the pipeline can be started again.
    ///
    /// Fails with [`Error::Running`] until the workers have been joined.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_idle()?;
        for edge in self.all_edges() {
            edge.reset()?;
        }
        self.finished = false;
        let ids = self.graph.node_ids().to_vec();
        self.reset_nodes(&ids)
    }

    /// Clear one node's status and outgoing edges and reset its stage.
    pub fn reset_node(&mut self, id: NodeId) -> Result<()> {
        self.ensure_idle()?;
        self.reset_outgoing(&[id])?;
        self.reset_nodes(&[id])
    }

    /// Reset `id` and every node downstream of it, with their outgoing
    /// edges.
    pub fn reset_downstream(&mut self, id: NodeId) -> Result<()> {
        self.ensure_idle()?;
        self.graph.node(id)?;
        let ids = self.graph.downstream_nodes(id);
        self.reset_outgoing(&ids)?;
        self.reset_nodes(&ids)
    }

    fn reset_outgoing(&self, ids: &[NodeId]) -> Result<()> {
        for &id in ids {
            for &e in &self.graph.node(id)?.outgoing {
                if let Some(edge) = self.edges.get(e.index()) {
                    edge.reset()?;
                }
            }
            for tap in self.taps.iter().filter(|t| t.node == id) {
                tap.edge.reset()?;
            }
        }
        Ok(())
    }

    fn reset_nodes(&mut self, ids: &[NodeId]) -> Result<()> {
        let mut first_error = None;
        for &id in ids {
            let node = self.graph.node_mut(id)?;
            if !node.is_executable() {
                continue;
            }
            node.status = None;
            let name = node.name().to_string();
            if let Some(stage) = node.stage_mut() {
                if let Err(e) = stage.reset() {
                    tracing::error!(pipeline = %self.name, node = %name, error = %e, "reset failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Per-node status and timing. Stage details are only available once
    /// the workers have been joined.
    pub fn report(&self) -> PipelineReport {
        let mut report = self.graph.report(0);
        for worker in &self.workers {
            if let Ok(node) = self.graph.node(worker.node) {
                if let Some(entry) = report.nodes.iter_mut().find(|n| n.name == node.name()) {
                    entry.status = worker.activity.status();
                }
            }
        }
        report
    }

    /// Steps per second for every node, nested nodes keyed `composite:inner`.
    pub fn collect_node_timing(&self) -> BTreeMap<String, f64> {
        self.report().collect_node_timing()
    }

    /// Traffic counters for every edge, keyed by label. Attached external
    /// edges follow the internal ones.
    pub fn edge_stats(&self) -> Vec<(String, EdgeStats)> {
        self.all_edges()
            .map(|e| (e.label().to_string(), e.stats()))
            .collect()
    }

    /// Graphviz rendering of the graph.
    pub fn to_dot(&self) -> String {
        self.graph.to_dot()
    }
}

impl Drop for AsyncPipeline {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.config.detailed_report = false;
            let _ = self.cancel();
        }
    }
}

impl std::fmt::Debug for AsyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("name", &self.name)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.edges.len())
            .field("workers", &self.workers.len())
            .field("initialized", &self.initialized)
            .finish()
    }
}
