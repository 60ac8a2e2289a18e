//! Single-threaded, deterministic scheduler.
//!
//! Every tick walks the executable nodes once, parents before children, in
//! the caller's thread. A node observes its parents' statuses from the same
//! tick and receives their output values by direct call; no queue sits
//! between nodes.

use super::graph::{NodeId, PipelineGraph};
use super::node::{InputValues, InputVerdict, resolve_inputs};
use super::report::PipelineReport;
use crate::config::ConfigBlock;
use crate::error::{Error, Result};
use crate::observability::{PipelineMetrics, ThroughputMeter, span_pipeline, trace_finished};
use crate::stage::Stage;
use crate::status::{ExecutionStatus, OutputSummary};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`SyncPipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// How often to log ticks per second. `None` disables the log.
    pub report_interval: Option<Duration>,
    /// Log a per-node report when every output node fails.
    pub detailed_report: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            report_interval: Some(Duration::from_secs(10)),
            detailed_report: true,
        }
    }
}

impl SyncConfig {
    /// A quiet configuration: no throughput or detailed logging.
    pub fn quiet() -> Self {
        Self {
            report_interval: None,
            detailed_report: false,
        }
    }

    /// Set the throughput log interval.
    pub fn with_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.report_interval = interval;
        self
    }

    /// Enable or disable the detailed failure report.
    pub fn with_detailed_report(mut self, enabled: bool) -> Self {
        self.detailed_report = enabled;
        self
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// A pipeline executed tick by tick in the caller's thread.
///
/// # Example
///
/// ```rust
/// use vidpipe::prelude::*;
///
/// let mut n = 0;
/// let source = FnSource::new(move || {
///     n += 1;
///     if n <= 3 { Emit::Value(n) } else { Emit::Done }
/// });
/// let (sink, seen) = Collector::<i32>::new();
///
/// let mut pipeline = SyncPipeline::new("demo");
/// let src = pipeline.add("source", source).unwrap();
/// let dst = pipeline.add("sink", sink).unwrap();
/// pipeline.connect(src, "value", dst, "value").unwrap();
/// pipeline.initialize().unwrap();
///
/// assert_eq!(pipeline.run(), 4);
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
/// ```
pub struct SyncPipeline {
    name: String,
    graph: PipelineGraph,
    config: SyncConfig,
    order: Vec<NodeId>,
    outputs: Vec<NodeId>,
    initialized: bool,
    ticks: u64,
    meter: ThroughputMeter,
    metrics: PipelineMetrics,
}

impl SyncPipeline {
    /// Create an empty pipeline with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, SyncConfig::default())
    }

    /// Create an empty pipeline with the given configuration.
    pub fn with_config(name: impl Into<String>, config: SyncConfig) -> Self {
        let name = name.into();
        Self {
            graph: PipelineGraph::new(name.clone()),
            meter: ThroughputMeter::new(config.report_interval),
            metrics: PipelineMetrics::new(&name),
            config,
            order: Vec::new(),
            outputs: Vec::new(),
            initialized: false,
            ticks: 0,
            name,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The underlying graph.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
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
        self.initialized = false;
        self.graph.add_node(name, stage, true)
    }

    /// Register a node for configuration only; it is never stepped.
    pub fn add_without_execute(
        &mut self,
        name: impl Into<String>,
        stage: impl Stage + 'static,
    ) -> Result<NodeId> {
        self.graph.add_node(name, Box::new(stage), false)
    }

    /// Connect an output port to an input port.
    pub fn connect(&mut self, from: NodeId, from_port: &str, to: NodeId, to_port: &str) -> Result<()> {
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
        self.initialized = false;
        self.graph.connect(from, from_port, to, to_port, true).map(|_| ())
    }

    /// Run `to` after `from`, failing it when `from` fails.
    pub fn add_execution_dependency(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.initialized = false;
        self.graph.add_dependency(from, to, false).map(|_| ())
    }

    /// Run `to` after `from`, ignoring `from`'s failures.
    pub fn add_optional_execution_dependency(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.initialized = false;
        self.graph.add_dependency(from, to, true).map(|_| ())
    }

    /// Force a node in or out of the set of output nodes.
    pub fn set_output_node(&mut self, id: NodeId, output: bool) -> Result<()> {
        self.initialized = false;
        self.graph.set_output(id, output)
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Look up a node by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.graph.node_id(name)
    }

    /// Status of a node from the last tick.
    pub fn node_status(&self, id: NodeId) -> Result<Option<ExecutionStatus>> {
        Ok(self.graph.node(id)?.status())
    }

    /// Borrow a node's stage.
    pub fn stage(&self, id: NodeId) -> Result<&dyn Stage> {
        let node = self.graph.node(id)?;
        node.stage()
            .ok_or_else(|| Error::StageUnavailable(node.name().to_string()))
    }

    /// Mutably borrow a node's stage.
    pub fn stage_mut(&mut self, id: NodeId) -> Result<&mut (dyn Stage + 'static)> {
        let node = self.graph.node_mut(id)?;
        let name = node.name().to_string();
        node.stage_mut().ok_or(Error::StageUnavailable(name))
    }

    /// Ticks executed since creation or the last full reset.
    pub fn ticks(&self) -> u64 {
        self.ticks
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
        let ids = self.graph.node_ids().to_vec();
        self.graph.configure_nodes(block, &ids)
    }

    /// Configure `id` and every node downstream of it.
    pub fn configure_downstream(&mut self, block: &ConfigBlock, id: NodeId) -> Result<()> {
        self.graph.node(id)?;
        let ids = self.graph.downstream_nodes(id);
        self.graph.configure_nodes(block, &ids)
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Validate the graph, fix the execution order and initialize every
    /// scheduled stage.
    pub fn initialize(&mut self) -> Result<()> {
        self.graph.validate()?;
        self.order = self.graph.execution_order();
        self.outputs = self.graph.output_nodes();

        for &id in &self.order {
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

        self.initialized = true;
        tracing::debug!(
            pipeline = %self.name,
            nodes = self.order.len(),
            outputs = self.outputs.len(),
            "pipeline initialized"
        );
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) succeeded since the last
    /// graph change.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Execute one tick.
    ///
    /// Nodes that already failed are not evaluated again until reset.
    /// Returns `FAILURE` only when every output node failed; otherwise
    /// `FLUSH` if any output flushed, `SKIP` if any skipped, else `SUCCESS`.
    pub fn execute(&mut self) -> ExecutionStatus {
        if !self.initialized {
            tracing::error!(pipeline = %self.name, "execute called before initialize");
            return ExecutionStatus::Failure;
        }

        for i in 0..self.order.len() {
            let id = self.order[i];
            self.execute_node(id);
        }

        self.ticks += 1;
        self.metrics.record_tick();
        self.meter.tick(&self.name);

        let summary: OutputSummary = self
            .outputs
            .iter()
            .map(|&id| {
                self.graph
                    .node(id)
                    .ok()
                    .and_then(|n| n.status())
                    .unwrap_or(ExecutionStatus::Failure)
            })
            .collect();

        if summary.all_failed() && self.config.detailed_report {
            self.report().log();
        }
        summary.resolve()
    }

    fn execute_node(&mut self, id: NodeId) {
        let Ok(node) = self.graph.node(id) else {
            return;
        };
        if node.status() == Some(ExecutionStatus::Failure) {
            return;
        }

        let statuses = self.graph.incoming_statuses(id);
        let mut verdict = resolve_inputs(statuses);
        let mut inputs = InputValues::new();
        if verdict == InputVerdict::Step {
            match self.collect_inputs(id) {
                Ok(values) => inputs = values,
                Err(e) => {
                    tracing::error!(pipeline = %self.name, node = %node.name(), error = %e, "output transfer failed");
                    verdict = InputVerdict::Fail;
                }
            }
        }

        if let Ok(node) = self.graph.node_mut(id) {
            node.execute(&self.name, verdict, inputs);
        }
    }

    /// Pull the current value of every successful upstream data connection.
    fn collect_inputs(&self, id: NodeId) -> Result<InputValues> {
        let mut values = InputValues::new();
        for &edge in &self.graph.node(id)?.incoming {
            let (Some(conn), Some((parent, _))) =
                (self.graph.connection(edge), self.graph.endpoints(edge))
            else {
                continue;
            };
            let (Some(from_port), Some(to_port)) = (conn.from_port(), conn.to_port()) else {
                continue;
            };
            let parent = self.graph.node(parent)?;
            if parent.status() != Some(ExecutionStatus::Success) {
                continue;
            }
            let stage = parent
                .stage()
                .ok_or_else(|| Error::StageUnavailable(parent.name().to_string()))?;
            values.push((to_port.to_string(), stage.output(from_port)?));
        }
        Ok(values)
    }

    /// Execute ticks until one returns `FAILURE`; returns the number of
    /// `execute` calls made.
    pub fn run(&mut self) -> u64 {
        let span = span_pipeline(&self.name);
        let _guard = span.enter();
        self.meter.restart();

        let mut calls = 0u64;
        loop {
            calls += 1;
            if self.execute() == ExecutionStatus::Failure {
                break;
            }
        }
        trace_finished(&self.name, calls);
        calls
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// Clear every node's status and reset every scheduled stage.
    ///
    /// All nodes are attempted; the first error is returned afterwards.
    pub fn reset(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.graph.node_ids().to_vec();
        self.ticks = 0;
        self.meter.restart();
        self.reset_nodes(&ids)
    }

    /// Clear one node's status and reset its stage.
    pub fn reset_node(&mut self, id: NodeId) -> Result<()> {
        self.reset_nodes(&[id])
    }

    /// Reset `id` and every node downstream of it.
    pub fn reset_downstream(&mut self, id: NodeId) -> Result<()> {
        self.graph.node(id)?;
        let ids = self.graph.downstream_nodes(id);
        self.reset_nodes(&ids)
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

    /// Per-node status and timing.
    pub fn report(&self) -> PipelineReport {
        self.graph.report(self.ticks)
    }

    /// Steps per second for every node, nested nodes keyed `composite:inner`.
    pub fn collect_node_timing(&self) -> BTreeMap<String, f64> {
        self.report().collect_node_timing()
    }

    /// Graphviz rendering of the graph.
    pub fn to_dot(&self) -> String {
        self.graph.to_dot()
    }
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("name", &self.name)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .field("initialized", &self.initialized)
            .field("ticks", &self.ticks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{PortSpec, PortValue};
    use std::sync::{Arc, Mutex};

    /// Emits a scripted status sequence, repeating the last entry.
    struct Scripted {
        script: Vec<ExecutionStatus>,
        tick: usize,
        value: i32,
    }

    impl Scripted {
        fn new(script: Vec<ExecutionStatus>) -> Self {
            Self {
                script,
                tick: 0,
                value: 0,
            }
        }
    }

    impl Stage for Scripted {
        fn output_ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::output::<i32>("out")]
        }

        fn step(&mut self) -> ExecutionStatus {
            let status = self.script[self.tick.min(self.script.len() - 1)];
            self.tick += 1;
            self.value += 1;
            status
        }

        fn output(&self, _port: &str) -> Result<PortValue> {
            Ok(PortValue::new(self.value))
        }
    }

    #[derive(Clone, Default)]
    struct Sink {
        steps: Arc<Mutex<Vec<i32>>>,
    }

    impl Stage for Sink {
        fn input_ports(&self) -> Vec<PortSpec> {
            vec![PortSpec::required::<i32>("in")]
        }

        fn set_input(&mut self, _port: &str, value: PortValue) -> Result<()> {
            self.steps.lock().unwrap().push(value.downcast()?);
            Ok(())
        }

        fn step(&mut self) -> ExecutionStatus {
            ExecutionStatus::Success
        }
    }

    fn quiet(name: &str) -> SyncPipeline {
        SyncPipeline::with_config(name, SyncConfig::quiet())
    }

    #[test]
    fn test_execute_before_initialize_fails() {
        let mut p = quiet("p");
        p.add("src", Scripted::new(vec![ExecutionStatus::Success]))
            .unwrap();
        assert_eq!(p.execute(), ExecutionStatus::Failure);
    }

    #[test]
    fn test_values_flow_in_order() {
        let mut p = quiet("p");
        let sink = Sink::default();
        let seen = Arc::clone(&sink.steps);
        let a = p
            .add("src", Scripted::new(vec![ExecutionStatus::Success]))
            .unwrap();
        let b = p.add("sink", sink).unwrap();
        p.connect(a, "out", b, "in").unwrap();
        p.initialize().unwrap();

        for _ in 0..3 {
            assert_eq!(p.execute(), ExecutionStatus::Success);
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(p.ticks(), 3);
    }

    #[test]
    fn test_skip_propagates_without_value() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let sink = Sink::default();
        let seen = Arc::clone(&sink.steps);
        let a = p.add("src", Scripted::new(vec![Success, Skip, Success])).unwrap();
        let b = p.add("sink", sink).unwrap();
        p.connect(a, "out", b, "in").unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Success);
        assert_eq!(p.execute(), Skip);
        assert_eq!(p.execute(), Success);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_flush_propagates() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let a = p.add("src", Scripted::new(vec![Flush, Success])).unwrap();
        let b = p.add("sink", Sink::default()).unwrap();
        p.connect(a, "out", b, "in").unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Flush);
        assert_eq!(p.node_status(b).unwrap(), Some(Flush));
        assert_eq!(p.execute(), Success);
    }

    #[test]
    fn test_partial_failure_keeps_running() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let good = p.add("good", Scripted::new(vec![Success])).unwrap();
        let bad = p.add("bad", Scripted::new(vec![Failure])).unwrap();
        let s1 = p.add("s1", Sink::default()).unwrap();
        let s2 = p.add("s2", Sink::default()).unwrap();
        p.connect(good, "out", s1, "in").unwrap();
        p.connect(bad, "out", s2, "in").unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Success);
        assert_eq!(p.node_status(s2).unwrap(), Some(Failure));
        assert_eq!(p.node_status(s1).unwrap(), Some(Success));
    }

    #[test]
    fn test_failed_node_not_reevaluated_until_reset() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let a = p.add("src", Scripted::new(vec![Failure, Success])).unwrap();
        let b = p.add("sink", Sink::default()).unwrap();
        p.connect(a, "out", b, "in").unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Failure);
        assert_eq!(p.execute(), Failure);
        assert_eq!(p.report().node("src").unwrap().stats.steps, 1);

        p.reset_downstream(a).unwrap();
        assert_eq!(p.node_status(a).unwrap(), None);
        assert_eq!(p.execute(), Success);
    }

    #[test]
    fn test_optional_dependency_ignores_failure() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let gate = p.add("gate", Scripted::new(vec![Failure])).unwrap();
        let src = p.add("src", Scripted::new(vec![Success])).unwrap();
        let sink = p.add("sink", Sink::default()).unwrap();
        p.connect(src, "out", sink, "in").unwrap();
        p.add_optional_execution_dependency(gate, sink).unwrap();
        p.set_output_node(gate, false).unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Success);
    }

    #[test]
    fn test_required_dependency_fails_consumer() {
        use ExecutionStatus::*;
        let mut p = quiet("p");
        let gate = p.add("gate", Scripted::new(vec![Failure])).unwrap();
        let src = p.add("src", Scripted::new(vec![Success])).unwrap();
        let sink = p.add("sink", Sink::default()).unwrap();
        p.connect(src, "out", sink, "in").unwrap();
        p.add_execution_dependency(gate, sink).unwrap();
        p.initialize().unwrap();

        assert_eq!(p.execute(), Failure);
    }

    #[test]
    fn test_configure_routes_subblocks() {
        #[derive(Default)]
        struct Tunable {
            threshold: Arc<Mutex<f64>>,
        }
        impl Stage for Tunable {
            fn params(&self) -> ConfigBlock {
                ConfigBlock::new().with("threshold", *self.threshold.lock().unwrap())
            }
            fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
                *self.threshold.lock().unwrap() = block.require_f64("threshold")?;
                Ok(())
            }
            fn step(&mut self) -> ExecutionStatus {
                ExecutionStatus::Success
            }
        }

        let mut p = quiet("p");
        let on = Tunable::default();
        let off = Tunable::default();
        let on_value = Arc::clone(&on.threshold);
        let off_value = Arc::clone(&off.threshold);
        p.add("on", on).unwrap();
        p.add_without_execute("off", off).unwrap();

        let mut block = p.params();
        assert!(block.contains("on:threshold"));
        assert!(block.contains("off:threshold"));
        block.set("on:threshold", 0.5);
        block.set("off:threshold", 0.25);
        p.configure(&block).unwrap();
        assert_eq!(*on_value.lock().unwrap(), 0.5);
        assert_eq!(*off_value.lock().unwrap(), 0.25);

        assert!(p.configure(&ConfigBlock::new()).is_err());
    }
}
