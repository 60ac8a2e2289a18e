//! Stages built from a nested pipeline.
//!
//! A [`CompositeStage`] owns a private [`SyncPipeline`] and exposes one
//! [`Pad`] node per external port. The parent sees an ordinary stage;
//! values set on the composite land in its input pads and outputs are
//! read from its output pads. Composites nest to any depth.
//!
//! An [`AsyncCompositeStage`] does the same over a nested
//! [`AsyncPipeline`](crate::pipeline::AsyncPipeline), splicing its pads to
//! the parent through bounded edges.
//!
//! Pads must be added before the composite is added to a parent
//! pipeline, since the parent reads the port list once.

mod async_composite;
mod pad;

pub use async_composite::AsyncCompositeStage;
pub use pad::Pad;

use crate::config::ConfigBlock;
use crate::error::{Error, Result};
use crate::pipeline::{NodeId, PipelineReport, SyncConfig, SyncPipeline};
use crate::stage::{PortDirection, PortSpec, PortValue, Stage};
use crate::status::ExecutionStatus;

/// A stage implemented as a nested pipeline.
///
/// # Example
///
/// ```rust
/// use vidpipe::prelude::*;
///
/// let mut scale = CompositeStage::new("scale");
/// let input = scale.add_input_pad::<i32>("in")?;
/// let output = scale.add_output_pad::<i32>("out")?;
/// let inner = scale.pipeline_mut();
/// let double = inner.add("double", FnMap::new(|x: i32| Emit::Value(x * 2)))?;
/// inner.connect(input, "value", double, "input")?;
/// inner.connect(double, "output", output, "value")?;
///
/// let mut n = 0;
/// let (sink, seen) = Collector::<i32>::new();
/// let mut pipeline = SyncPipeline::with_config("top", SyncConfig::quiet());
/// let src = pipeline.add("src", FnSource::new(move || {
///     n += 1;
///     if n <= 3 { Emit::Value(n) } else { Emit::Done }
/// }))?;
/// let sp = pipeline.add("scale", scale)?;
/// let out = pipeline.add("sink", sink)?;
/// pipeline.connect(src, "value", sp, "in")?;
/// pipeline.connect(sp, "out", out, "value")?;
/// pipeline.initialize()?;
/// pipeline.run();
///
/// assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6]);
/// # Ok::<(), vidpipe::Error>(())
/// ```
pub struct CompositeStage {
    pipeline: SyncPipeline,
    inputs: Vec<(PortSpec, NodeId)>,
    outputs: Vec<(PortSpec, NodeId)>,
    max_restarts: u32,
    restarts: u32,
}

impl CompositeStage {
    /// Create an empty composite; `name` names the nested pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pipeline: SyncPipeline::with_config(name, SyncConfig::quiet()),
            inputs: Vec::new(),
            outputs: Vec::new(),
            max_restarts: 0,
            restarts: 0,
        }
    }

    /// Allow up to `max` consecutive failed ticks to be absorbed by
    /// resetting and re-initializing the nested pipeline.
    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    /// The nested pipeline.
    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    /// The nested pipeline, for adding and wiring internal nodes.
    pub fn pipeline_mut(&mut self) -> &mut SyncPipeline {
        &mut self.pipeline
    }

    /// Restarts used since the last tick that did not fail.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Add an external input port backed by an input pad node.
    ///
    /// Wire the returned node's `value` output to the internal consumers.
    pub fn add_input_pad<T>(&mut self, name: &str) -> Result<NodeId>
    where
        T: Default + Clone + Send + 'static,
    {
        let id = self.pipeline.add(name, Pad::<T>::input())?;
        self.pipeline.set_output_node(id, false)?;
        self.inputs.push((PortSpec::required::<T>(name), id));
        Ok(id)
    }

    /// Add an external output port backed by an output pad node.
    ///
    /// Feed the returned node's `value` input from an internal producer.
    pub fn add_output_pad<T>(&mut self, name: &str) -> Result<NodeId>
    where
        T: Default + Clone + Send + 'static,
    {
        let id = self.pipeline.add(name, Pad::<T>::output())?;
        self.pipeline.set_output_node(id, true)?;
        self.outputs.push((PortSpec::output::<T>(name), id));
        Ok(id)
    }

    fn pad(&self, port: &str, direction: PortDirection) -> Result<NodeId> {
        let pads = match direction {
            PortDirection::Input => &self.inputs,
            PortDirection::Output => &self.outputs,
        };
        pads.iter()
            .find(|(spec, _)| spec.name() == port)
            .map(|&(_, id)| id)
            .ok_or_else(|| Error::UnknownPort {
                node: self.pipeline.name().to_string(),
                port: port.to_string(),
                direction,
            })
    }
}

impl Stage for CompositeStage {
    fn type_name(&self) -> &str {
        "composite"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        self.inputs.iter().map(|(spec, _)| spec.clone()).collect()
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        self.outputs.iter().map(|(spec, _)| spec.clone()).collect()
    }

    fn params(&self) -> ConfigBlock {
        self.pipeline.params()
    }

    fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
        self.pipeline.configure(block)
    }

    fn initialize(&mut self) -> Result<()> {
        self.restarts = 0;
        self.pipeline.initialize()
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        let id = self.pad(port, PortDirection::Input)?;
        self.pipeline.stage_mut(id)?.set_input("value", value)
    }

    fn step(&mut self) -> ExecutionStatus {
        let status = self.pipeline.execute();
        if status != ExecutionStatus::Failure {
            self.restarts = 0;
        }
        status
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        let id = self.pad(port, PortDirection::Output)?;
        self.pipeline.stage(id)?.output("value")
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
        match self.pipeline.reset().and_then(|()| self.pipeline.initialize()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(pipeline = %self.pipeline.name(), error = %e, "restart failed");
                false
            }
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.restarts = 0;
        self.pipeline.reset()
    }

    fn nested_report(&self) -> Option<PipelineReport> {
        Some(self.pipeline.report())
    }
}

impl std::fmt::Debug for CompositeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeStage")
            .field("pipeline", &self.pipeline)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("max_restarts", &self.max_restarts)
            .finish()
    }
}
