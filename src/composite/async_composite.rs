//! Composite stage backed by a thread-per-node nested pipeline.

use super::pad::Pad;
use crate::config::ConfigBlock;
use crate::edge::{BoundedEdge, EdgeRead};
use crate::error::{Error, Result};
use crate::pipeline::{AsyncConfig, AsyncPipeline, NodeId, PipelineReport};
use crate::stage::{PortDirection, PortSpec, PortValue, Stage};
use crate::status::{ExecutionStatus, OutputSummary};
use smallvec::SmallVec;
use std::any::type_name;
use std::sync::Arc;

struct InputBridge {
    spec: PortSpec,
    node: NodeId,
    feed: Arc<BoundedEdge<PortValue>>,
    pending: Option<PortValue>,
}

struct OutputBridge {
    spec: PortSpec,
    node: NodeId,
    tap: Arc<BoundedEdge<PortValue>>,
    latest: Option<PortValue>,
    copy: fn(&PortValue) -> Result<PortValue>,
    fallback: fn() -> PortValue,
}

fn copy_value<T: Clone + Send + 'static>(value: &PortValue) -> Result<PortValue> {
    value
        .downcast_ref::<T>()
        .cloned()
        .map(PortValue::new)
        .ok_or_else(|| Error::ValueType {
            expected: type_name::<T>(),
            actual: value.type_name(),
        })
}

fn default_value<T: Default + Send + 'static>() -> PortValue {
    PortValue::new(T::default())
}

/// A stage implemented as a nested [`AsyncPipeline`].
///
/// Each pad is spliced to the parent through a [`BoundedEdge`]: a step
/// publishes the parent's values into the input pads' edges and then reads
/// one status from every output pad's edge. The nested nodes run on their
/// own worker threads, so independent branches of the nested graph step in
/// parallel, while the parent still sees exactly one status per step.
///
/// The output statuses of a tick fold like a pipeline result: `FAILURE`
/// once every output pad failed, then `FLUSH`, then `SKIP`. Reading exactly
/// one status per pad per step keeps the pads aligned on the same tick.
///
/// The nested workers start on the first step and stop when every output
/// pad has failed, on [`reset`](Stage::reset) or [`cancel`](Stage::cancel),
/// or when the composite is dropped.
///
/// # Example
///
/// ```rust
/// use vidpipe::prelude::*;
///
/// let mut scale = AsyncCompositeStage::new("scale");
/// let input = scale.add_input_pad::<i32>("in")?;
/// let output = scale.add_output_pad::<i32>("out")?;
/// let inner = scale.pipeline_mut();
/// let double = inner.add("double", FnMap::new(|x: i32| Emit::Value(x * 2)))?;
/// let shift = inner.add("shift", FnMap::new(|x: i32| Emit::Value(x + 1)))?;
/// inner.connect(input, "value", double, "input")?;
/// inner.connect(double, "output", shift, "input")?;
/// inner.connect(shift, "output", output, "value")?;
///
/// let mut n = 0;
/// let (sink, seen) = Collector::<i32>::new();
/// let mut pipeline = AsyncPipeline::new("top");
/// let src = pipeline.add("src", FnSource::new(move || {
///     n += 1;
///     if n <= 3 { Emit::Value(n) } else { Emit::Done }
/// }))?;
/// let sp = pipeline.add("scale", scale)?;
/// let out = pipeline.add("sink", sink)?;
/// pipeline.connect(src, "value", sp, "in")?;
/// pipeline.connect(sp, "out", out, "value")?;
/// pipeline.initialize()?;
/// pipeline.run()?;
///
/// assert_eq!(*seen.lock().unwrap(), vec![3, 5, 7]);
/// # Ok::<(), vidpipe::Error>(())
/// ```
pub struct AsyncCompositeStage {
    pipeline: AsyncPipeline,
    inputs: Vec<InputBridge>,
    outputs: Vec<OutputBridge>,
    capacity: usize,
    started: bool,
    max_restarts: u32,
    restarts: u32,
}

impl AsyncCompositeStage {
    /// Create an empty composite; `name` names the nested pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, AsyncConfig::default().with_detailed_report(false))
    }

    /// Create an empty composite whose nested pipeline uses `config`.
    ///
    /// The pad edges use the same capacity as the internal edges.
    pub fn with_config(name: impl Into<String>, config: AsyncConfig) -> Self {
        let capacity = config.edge_capacity;
        Self {
            pipeline: AsyncPipeline::with_config(name, config),
            inputs: Vec::new(),
            outputs: Vec::new(),
            capacity,
            started: false,
            max_restarts: 0,
            restarts: 0,
        }
    }

    /// Allow up to `max` consecutive failed ticks to be absorbed by
    /// restarting the nested pipeline.
    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    /// The nested pipeline.
    pub fn pipeline(&self) -> &AsyncPipeline {
        &self.pipeline
    }

    /// The nested pipeline, for adding and wiring internal nodes.
    pub fn pipeline_mut(&mut self) -> &mut AsyncPipeline {
        &mut self.pipeline
    }

    /// Restarts used since the last tick that did not fail.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Add an external input port backed by an input pad node.
    pub fn add_input_pad<T>(&mut self, name: &str) -> Result<NodeId>
    where
        T: Default + Clone + Send + 'static,
    {
        let id = self.pipeline.add(name, Pad::<T>::input())?;
        self.pipeline.set_output_node(id, false)?;
        let feed = Arc::new(
            BoundedEdge::new(self.capacity)
                .with_label(format!("{} <- {name}", self.pipeline.name())),
        );
        self.pipeline.attach_input(id, "value", Arc::clone(&feed))?;
        self.inputs.push(InputBridge {
            spec: PortSpec::required::<T>(name),
            node: id,
            feed,
            pending: None,
        });
        Ok(id)
    }

    /// Add an external output port backed by an output pad node.
    pub fn add_output_pad<T>(&mut self, name: &str) -> Result<NodeId>
    where
        T: Default + Clone + Send + 'static,
    {
        let id = self.pipeline.add(name, Pad::<T>::output())?;
        self.pipeline.set_output_node(id, true)?;
        let tap = Arc::new(
            BoundedEdge::new(self.capacity)
                .with_label(format!("{} -> {name}", self.pipeline.name())),
        );
        self.pipeline.attach_output(id, "value", Arc::clone(&tap))?;
        self.outputs.push(OutputBridge {
            spec: PortSpec::output::<T>(name),
            node: id,
            tap,
            latest: None,
            copy: copy_value::<T>,
            fallback: default_value::<T>,
        });
        Ok(id)
    }

    /// Node id of a pad.
    pub fn pad(&self, port: &str) -> Option<NodeId> {
        self.inputs
            .iter()
            .map(|i| (&i.spec, i.node))
            .chain(self.outputs.iter().map(|o| (&o.spec, o.node)))
            .find(|(spec, _)| spec.name() == port)
            .map(|(_, id)| id)
    }

    fn unknown_port(&self, port: &str, direction: PortDirection) -> Error {
        Error::UnknownPort {
            node: self.pipeline.name().to_string(),
            port: port.to_string(),
            direction,
        }
    }

    /// Join the nested workers once every output pad has failed.
    fn finish(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        if let Err(e) = self.pipeline.wait() {
            tracing::error!(pipeline = %self.pipeline.name(), error = %e, "nested pipeline ended with error");
        }
    }

    /// Stop the nested workers wherever they are.
    fn halt(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        if let Err(e) = self.pipeline.cancel() {
            tracing::error!(pipeline = %self.pipeline.name(), error = %e, "nested pipeline cancel failed");
        }
    }
}

impl Stage for AsyncCompositeStage {
    fn type_name(&self) -> &str {
        "async_composite"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        self.inputs.iter().map(|i| i.spec.clone()).collect()
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        self.outputs.iter().map(|o| o.spec.clone()).collect()
    }

    fn params(&self) -> ConfigBlock {
        self.pipeline.params()
    }

    fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
        self.pipeline.configure(block)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "composite '{}' has no output pads",
                self.pipeline.name()
            )));
        }
        self.halt();
        self.restarts = 0;
        self.pipeline.initialize()
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        let Some(index) = self.inputs.iter().position(|i| i.spec.name() == port) else {
            return Err(self.unknown_port(port, PortDirection::Input));
        };
        self.inputs[index].pending = Some(value);
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        if !self.started {
            if let Err(e) = self.pipeline.start() {
                tracing::error!(pipeline = %self.pipeline.name(), error = %e, "nested pipeline failed to start");
                return ExecutionStatus::Failure;
            }
            self.started = true;
        }

        for input in &mut self.inputs {
            let published = match input.pending.take() {
                Some(value) => input.feed.publish(ExecutionStatus::Success, Some(value)),
                None => input.feed.publish(ExecutionStatus::Skip, None),
            };
            if !published {
                tracing::debug!(pad = %input.spec.name(), "input pad no longer consumed");
            }
        }

        let reads: SmallVec<[EdgeRead<PortValue>; 4]> =
            self.outputs.iter().map(|o| o.tap.consume()).collect();
        let summary: OutputSummary = reads.iter().map(|r| r.status).collect();
        for (read, output) in reads.into_iter().zip(&mut self.outputs) {
            output.latest = read.value;
        }

        let status = summary.resolve();
        if status == ExecutionStatus::Failure {
            self.finish();
        } else {
            self.restarts = 0;
        }
        status
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        let Some(output) = self.outputs.iter().find(|o| o.spec.name() == port) else {
            return Err(self.unknown_port(port, PortDirection::Output));
        };
        match &output.latest {
            Some(value) => (output.copy)(value),
            None => Ok((output.fallback)()),
        }
    }

    fn recover_from_failure(&mut self) -> bool {
        if self.restarts >= self.max_restarts {
            return false;
        }
        self.restarts += 1;
        tracing::warn!(
            pipeline = %self.pipeline.name(),
            restart = self.restarts,
            max = self.max_restarts,
            "restarting nested pipeline"
        );
        self.halt();
        match self.pipeline.reset().and_then(|()| self.pipeline.initialize()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(pipeline = %self.pipeline.name(), error = %e, "restart failed");
                false
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.halt();
        self.restarts = 0;
        for input in &mut self.inputs {
            input.pending = None;
        }
        for output in &mut self.outputs {
            output.latest = None;
        }
        self.pipeline.reset()
    }

    fn cancel(&mut self) {
        self.halt();
    }

    fn nested_report(&self) -> Option<PipelineReport> {
        Some(self.pipeline.report())
    }
}

impl std::fmt::Debug for AsyncCompositeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCompositeStage")
            .field("pipeline", &self.pipeline)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("started", &self.started)
            .field("max_restarts", &self.max_restarts)
            .finish()
    }
}
