//! Nodes and the per-tick node algorithm shared by both schedulers.

use crate::observability::{NodeMetrics, trace_node_status};
use crate::stage::{PortSpec, PortValue, Stage};
use crate::status::ExecutionStatus;
use daggy::EdgeIndex;
use smallvec::SmallVec;
use std::fmt;
use std::time::{Duration, Instant};

/// Values delivered to a node's input ports for one tick.
pub(crate) type InputValues = SmallVec<[(String, PortValue); 4]>;

/// Whether a node's status feeds the pipeline result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFlag {
    /// Decided by topology: a node without outgoing edges is an output.
    #[default]
    Unknown,
    /// Always an output node.
    Yes,
    /// Never an output node.
    No,
}

/// Cumulative step statistics of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeStats {
    /// Ticks in which the node was evaluated.
    pub executions: u64,
    /// Calls to `Stage::step`.
    pub steps: u64,
    /// Total time spent inside `Stage::step`.
    pub elapsed: Duration,
}

impl NodeStats {
    /// Steps per second of step time; zero before the first step.
    pub fn steps_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.steps as f64 / secs
        } else {
            0.0
        }
    }
}

/// The scheduler's wrapper around one stage.
pub struct Node {
    name: String,
    type_name: String,
    stage: Option<Box<dyn Stage>>,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    executable: bool,
    pub(crate) incoming: SmallVec<[EdgeIndex; 4]>,
    pub(crate) outgoing: SmallVec<[EdgeIndex; 4]>,
    pub(crate) status: Option<ExecutionStatus>,
    pub(crate) output_flag: OutputFlag,
    pub(crate) stats: NodeStats,
    pub(crate) metrics: NodeMetrics,
}

impl Node {
    pub(crate) fn new(
        pipeline: &str,
        name: String,
        stage: Box<dyn Stage>,
        executable: bool,
    ) -> Self {
        let metrics = NodeMetrics::new(pipeline, &name);
        Self {
            type_name: stage.type_name().to_string(),
            inputs: stage.input_ports(),
            outputs: stage.output_ports(),
            stage: Some(stage),
            name,
            executable,
            incoming: SmallVec::new(),
            outgoing: SmallVec::new(),
            status: None,
            output_flag: if executable {
                OutputFlag::Unknown
            } else {
                OutputFlag::No
            },
            stats: NodeStats::default(),
            metrics,
        }
    }

    /// Node name, unique within its pipeline.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage's type label.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Declared input ports.
    pub fn input_ports(&self) -> &[PortSpec] {
        &self.inputs
    }

    /// Declared output ports.
    pub fn output_ports(&self) -> &[PortSpec] {
        &self.outputs
    }

    /// Look up an input port.
    pub fn input_port(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name() == name)
    }

    /// Look up an output port.
    pub fn output_port(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name() == name)
    }

    /// Whether the scheduler steps this node.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Status from the last tick, `None` before the first tick or after a
    /// reset.
    pub fn status(&self) -> Option<ExecutionStatus> {
        self.status
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// The stage, unless a worker thread currently owns it.
    pub fn stage(&self) -> Option<&dyn Stage> {
        self.stage.as_deref()
    }

    /// Mutable access to the stage.
    pub fn stage_mut(&mut self) -> Option<&mut (dyn Stage + 'static)> {
        self.stage.as_deref_mut()
    }

    /// Take the stage out for execution on a worker thread.
    pub(crate) fn take_stage(&mut self) -> Option<Box<dyn Stage>> {
        self.stage.take()
    }

    /// Return a stage taken with [`Node::take_stage`].
    pub(crate) fn restore_stage(&mut self, stage: Box<dyn Stage>) {
        self.stage = Some(stage);
    }

    /// Run the node algorithm on the owned stage and record the status.
    pub(crate) fn execute(
        &mut self,
        pipeline: &str,
        verdict: InputVerdict,
        inputs: InputValues,
    ) -> ExecutionStatus {
        let status = match self.stage.as_deref_mut() {
            Some(stage) => execute_stage(
                stage,
                verdict,
                inputs,
                StepContext {
                    pipeline,
                    node: &self.name,
                    stats: &mut self.stats,
                    metrics: &self.metrics,
                },
            ),
            None => {
                tracing::error!(pipeline = %pipeline, node = %self.name, "stage unavailable");
                ExecutionStatus::Failure
            }
        };
        self.status = Some(status);
        status
    }

    pub(crate) fn is_output(&self) -> bool {
        match self.output_flag {
            OutputFlag::Yes => self.executable,
            OutputFlag::No => false,
            OutputFlag::Unknown => self.executable && self.outgoing.is_empty(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("executable", &self.executable)
            .field("status", &self.status)
            .field("incoming", &self.incoming.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

/// What the incoming edges allow a node to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputVerdict {
    /// Deliver values and step.
    Step,
    /// A required input failed.
    Fail,
    /// Every considered input skipped.
    Skip,
    /// An input flushed.
    Flush,
}

/// Fold incoming `(status, optional)` pairs into a verdict.
///
/// `FAILURE` on an optional edge is ignored. A node without inputs, or whose
/// only inputs are failed optional edges, always steps.
pub(crate) fn resolve_inputs<I>(inputs: I) -> InputVerdict
where
    I: IntoIterator<Item = (ExecutionStatus, bool)>,
{
    let mut considered = 0usize;
    let mut skipped = 0usize;
    let mut flushed = false;
    for (status, optional) in inputs {
        match status {
            ExecutionStatus::Failure if optional => continue,
            ExecutionStatus::Failure => return InputVerdict::Fail,
            ExecutionStatus::Skip => skipped += 1,
            ExecutionStatus::Flush => flushed = true,
            ExecutionStatus::Success => {}
        }
        considered += 1;
    }
    if considered > 0 && skipped == considered {
        InputVerdict::Skip
    } else if flushed {
        InputVerdict::Flush
    } else {
        InputVerdict::Step
    }
}

/// Mutable per-node bookkeeping used while executing a stage.
pub(crate) struct StepContext<'a> {
    pub pipeline: &'a str,
    pub node: &'a str,
    pub stats: &'a mut NodeStats,
    pub metrics: &'a NodeMetrics,
}

/// Run one tick of the node algorithm against `stage`.
///
/// Values are delivered only when the node actually steps. A rejected input
/// fails the node for this tick.
pub(crate) fn execute_stage(
    stage: &mut dyn Stage,
    verdict: InputVerdict,
    inputs: InputValues,
    mut ctx: StepContext<'_>,
) -> ExecutionStatus {
    let status = match verdict {
        InputVerdict::Fail => ExecutionStatus::Failure,
        InputVerdict::Flush => ExecutionStatus::Flush,
        InputVerdict::Skip if stage.recover_from_skip() => step_stage(stage, &mut ctx),
        InputVerdict::Skip => ExecutionStatus::Skip,
        InputVerdict::Step => {
            if deliver_inputs(stage, ctx.node, inputs) {
                step_stage(stage, &mut ctx)
            } else {
                ExecutionStatus::Failure
            }
        }
    };

    ctx.stats.executions += 1;
    ctx.metrics.record_status(status);
    trace_node_status(ctx.pipeline, ctx.node, status);
    status
}

fn deliver_inputs(stage: &mut dyn Stage, node: &str, inputs: InputValues) -> bool {
    for (port, value) in inputs {
        if let Err(e) = stage.set_input(&port, value) {
            tracing::error!(node = %node, port = %port, error = %e, "input rejected");
            return false;
        }
    }
    true
}

fn step_stage(stage: &mut dyn Stage, ctx: &mut StepContext<'_>) -> ExecutionStatus {
    let start = Instant::now();
    let status = stage.step();
    let elapsed = start.elapsed();
    ctx.stats.steps += 1;
    ctx.stats.elapsed += elapsed;
    ctx.metrics.record_step_time(elapsed);

    if status == ExecutionStatus::Failure && stage.recover_from_failure() {
        tracing::warn!(node = %ctx.node, "stage recovered from failure");
        return ExecutionStatus::Skip;
    }
    status
}
