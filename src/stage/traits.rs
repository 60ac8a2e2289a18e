//! The stage trait every pluggable unit of work implements.

use super::port::{PortDirection, PortSpec, PortValue};
use crate::config::ConfigBlock;
use crate::error::{Error, Result};
use crate::pipeline::PipelineReport;
use crate::status::ExecutionStatus;

/// A unit of work with named, typed input and output ports.
///
/// The scheduler drives a stage through a fixed lifecycle:
///
/// 1. [`configure`](Stage::configure) with the stage's parameter block
/// 2. [`initialize`](Stage::initialize) once before the first tick
/// 3. per tick: [`set_input`](Stage::set_input) for every input that
///    delivered a value, then [`step`](Stage::step), then
///    [`output`](Stage::output) once per outgoing data edge
/// 4. optionally [`reset`](Stage::reset) and back to 2
///
/// Only `step` is mandatory; a stage without ports is a pure side effect.
/// `step` must run to completion and must not block indefinitely.
///
/// # Example
///
/// ```rust
/// use vidpipe::prelude::*;
///
/// struct Doubler {
///     value: i64,
/// }
///
/// impl Stage for Doubler {
///     fn type_name(&self) -> &str {
///         "doubler"
///     }
///
///     fn input_ports(&self) -> Vec<PortSpec> {
///         vec![PortSpec::required::<i64>("in")]
///     }
///
///     fn output_ports(&self) -> Vec<PortSpec> {
///         vec![PortSpec::output::<i64>("out")]
///     }
///
///     fn set_input(&mut self, _port: &str, value: PortValue) -> Result<()> {
///         self.value = value.downcast()?;
///         Ok(())
///     }
///
///     fn step(&mut self) -> ExecutionStatus {
///         self.value *= 2;
///         ExecutionStatus::Success
///     }
///
///     fn output(&self, _port: &str) -> Result<PortValue> {
///         Ok(PortValue::new(self.value))
///     }
/// }
/// ```
pub trait Stage: Send {
    /// Short type label used in reports and graph dumps.
    fn type_name(&self) -> &str {
        "stage"
    }

    /// Declared input ports.
    fn input_ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Declared output ports.
    fn output_ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Current parameters, including defaults.
    fn params(&self) -> ConfigBlock {
        ConfigBlock::new()
    }

    /// Apply parameters.
    fn configure(&mut self, _block: &ConfigBlock) -> Result<()> {
        Ok(())
    }

    /// Prepare for the first step.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run one tick.
    fn step(&mut self) -> ExecutionStatus;

    /// Receive a value on an input port before `step`.
    fn set_input(&mut self, port: &str, _value: PortValue) -> Result<()> {
        Err(Error::UnknownPort {
            node: self.type_name().to_string(),
            port: port.to_string(),
            direction: PortDirection::Input,
        })
    }

    /// Produce the value of an output port after a successful `step`.
    fn output(&self, port: &str) -> Result<PortValue> {
        Err(Error::UnknownPort {
            node: self.type_name().to_string(),
            port: port.to_string(),
            direction: PortDirection::Output,
        })
    }

    /// Called when every input skipped. Return `true` to step anyway with
    /// whatever input the stage last received.
    fn recover_from_skip(&mut self) -> bool {
        false
    }

    /// Called after `step` returned `FAILURE`. Return `true` if the stage
    /// recovered; the node then reports `SKIP` instead of failing.
    fn recover_from_failure(&mut self) -> bool {
        false
    }

    /// Return to the freshly configured state.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Cooperative stop request from an asynchronous scheduler.
    fn cancel(&mut self) {}

    /// Per-node report of a nested pipeline, for composite stages.
    fn nested_report(&self) -> Option<PipelineReport> {
        None
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        (**self).input_ports()
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        (**self).output_ports()
    }

    fn params(&self) -> ConfigBlock {
        (**self).params()
    }

    fn configure(&mut self, block: &ConfigBlock) -> Result<()> {
        (**self).configure(block)
    }

    fn initialize(&mut self) -> Result<()> {
        (**self).initialize()
    }

    fn step(&mut self) -> ExecutionStatus {
        (**self).step()
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        (**self).set_input(port, value)
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        (**self).output(port)
    }

    fn recover_from_skip(&mut self) -> bool {
        (**self).recover_from_skip()
    }

    fn recover_from_failure(&mut self) -> bool {
        (**self).recover_from_failure()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn cancel(&mut self) {
        (**self).cancel()
    }

    fn nested_report(&self) -> Option<PipelineReport> {
        (**self).nested_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Stage for Noop {
        fn step(&mut self) -> ExecutionStatus {
            ExecutionStatus::Success
        }
    }

    #[test]
    fn test_defaults() {
        let mut stage = Noop;
        assert_eq!(stage.type_name(), "stage");
        assert!(stage.input_ports().is_empty());
        assert!(stage.configure(&ConfigBlock::new()).is_ok());
        assert!(!stage.recover_from_skip());
        assert!(!stage.recover_from_failure());
        assert!(stage.nested_report().is_none());
        assert!(matches!(
            stage.set_input("x", PortValue::new(1u8)),
            Err(Error::UnknownPort { direction: PortDirection::Input, .. })
        ));
        assert!(stage.output("y").is_err());
    }

    #[test]
    fn test_boxed_stage_forwards() {
        let mut boxed: Box<dyn Stage> = Box::new(Noop);
        assert_eq!(boxed.step(), ExecutionStatus::Success);
    }
}
