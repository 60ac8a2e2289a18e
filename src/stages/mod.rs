//! Closure-driven stages for tests, benchmarks and small pipelines.
//!
//! | Stage | Inputs | Outputs |
//! |-------|--------|---------|
//! | [`FnSource`] | none | `value` |
//! | [`FnMap`] | `input` | `output` |
//! | [`FnCombine`] | `a`, `b` | `output` |
//! | [`Collector`] | `value` | none |

use crate::error::{Error, Result};
use crate::stage::{PortDirection, PortSpec, PortValue, Stage};
use crate::status::ExecutionStatus;
use std::sync::{Arc, Mutex, PoisonError};

/// What a closure stage produced this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit<T> {
    /// A fresh value; the stage reports `SUCCESS`.
    Value(T),
    /// Nothing this tick; the stage reports `SKIP`.
    Skip,
    /// A discontinuity; the stage reports `FLUSH`.
    Flush,
    /// End of stream; the stage reports `FAILURE`.
    Done,
}

impl<T> Emit<T> {
    fn into_parts(self) -> (ExecutionStatus, Option<T>) {
        match self {
            Emit::Value(v) => (ExecutionStatus::Success, Some(v)),
            Emit::Skip => (ExecutionStatus::Skip, None),
            Emit::Flush => (ExecutionStatus::Flush, None),
            Emit::Done => (ExecutionStatus::Failure, None),
        }
    }
}

fn unknown_port(stage: &str, port: &str, direction: PortDirection) -> Error {
    Error::UnknownPort {
        node: stage.to_string(),
        port: port.to_string(),
        direction,
    }
}

fn current_output<T: Clone + Send + 'static>(
    stage: &str,
    expected: &str,
    port: &str,
    current: &Option<T>,
) -> Result<PortValue> {
    if port != expected {
        return Err(unknown_port(stage, port, PortDirection::Output));
    }
    current
        .clone()
        .map(PortValue::new)
        .ok_or_else(|| Error::stage(stage, "no value produced yet"))
}

// ============================================================================
// Source
// ============================================================================

/// A source stage driven by a closure.
pub struct FnSource<T, F> {
    produce: F,
    current: Option<T>,
}

impl<T, F> FnSource<T, F>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Emit<T> + Send + 'static,
{
    /// Create a source; `produce` is called once per step.
    pub fn new(produce: F) -> Self {
        Self {
            produce,
            current: None,
        }
    }
}

impl<T, F> Stage for FnSource<T, F>
where
    T: Clone + Send + 'static,
    F: FnMut() -> Emit<T> + Send + 'static,
{
    fn type_name(&self) -> &str {
        "fn_source"
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<T>("value")]
    }

    fn step(&mut self) -> ExecutionStatus {
        let (status, value) = (self.produce)().into_parts();
        if value.is_some() {
            self.current = value;
        }
        status
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        current_output(self.type_name(), "value", port, &self.current)
    }

    fn reset(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

// ============================================================================
// Map
// ============================================================================

/// A one-input, one-output stage driven by a closure.
pub struct FnMap<I, O, F> {
    map: F,
    input: Option<I>,
    current: Option<O>,
}

impl<I, O, F> FnMap<I, O, F>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(I) -> Emit<O> + Send + 'static,
{
    /// Create a map stage.
    pub fn new(map: F) -> Self {
        Self {
            map,
            input: None,
            current: None,
        }
    }
}

impl<I, O, F> Stage for FnMap<I, O, F>
where
    I: Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(I) -> Emit<O> + Send + 'static,
{
    fn type_name(&self) -> &str {
        "fn_map"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::required::<I>("input")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<O>("output")]
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        if port != "input" {
            return Err(unknown_port(self.type_name(), port, PortDirection::Input));
        }
        self.input = Some(value.downcast()?);
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        let Some(input) = self.input.take() else {
            return ExecutionStatus::Skip;
        };
        let (status, value) = (self.map)(input).into_parts();
        if value.is_some() {
            self.current = value;
        }
        status
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        current_output(self.type_name(), "output", port, &self.current)
    }

    fn reset(&mut self) -> Result<()> {
        self.input = None;
        self.current = None;
        Ok(())
    }
}

// ============================================================================
// Combine
// ============================================================================

/// A two-input stage driven by a closure. Steps only when both inputs
/// delivered a value this tick.
pub struct FnCombine<A, B, O, F> {
    combine: F,
    a: Option<A>,
    b: Option<B>,
    current: Option<O>,
}

impl<A, B, O, F> FnCombine<A, B, O, F>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(A, B) -> Emit<O> + Send + 'static,
{
    /// Create a combine stage.
    pub fn new(combine: F) -> Self {
        Self {
            combine,
            a: None,
            b: None,
            current: None,
        }
    }
}

impl<A, B, O, F> Stage for FnCombine<A, B, O, F>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Clone + Send + 'static,
    F: FnMut(A, B) -> Emit<O> + Send + 'static,
{
    fn type_name(&self) -> &str {
        "fn_combine"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::required::<A>("a"), PortSpec::required::<B>("b")]
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<O>("output")]
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        match port {
            "a" => self.a = Some(value.downcast()?),
            "b" => self.b = Some(value.downcast()?),
            _ => return Err(unknown_port(self.type_name(), port, PortDirection::Input)),
        }
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        let (Some(a), Some(b)) = (self.a.take(), self.b.take()) else {
            return ExecutionStatus::Skip;
        };
        let (status, value) = (self.combine)(a, b).into_parts();
        if value.is_some() {
            self.current = value;
        }
        status
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        current_output(self.type_name(), "output", port, &self.current)
    }

    fn reset(&mut self) -> Result<()> {
        self.a = None;
        self.b = None;
        self.current = None;
        Ok(())
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Shared handle to the values a [`Collector`] received.
pub type Collected<T> = Arc<Mutex<Vec<T>>>;

/// A sink that appends every received value to a shared vector.
pub struct Collector<T> {
    pending: Option<T>,
    collected: Collected<T>,
}

impl<T: Send + 'static> Collector<T> {
    /// Create a collector and the handle to read what it received.
    pub fn new() -> (Self, Collected<T>) {
        let collected: Collected<T> = Arc::new(Mutex::new(Vec::new()));
        let stage = Self {
            pending: None,
            collected: Arc::clone(&collected),
        };
        (stage, collected)
    }
}

impl<T: Send + 'static> Stage for Collector<T> {
    fn type_name(&self) -> &str {
        "collector"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::required::<T>("value")]
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        if port != "value" {
            return Err(unknown_port(self.type_name(), port, PortDirection::Input));
        }
        self.pending = Some(value.downcast()?);
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        match self.pending.take() {
            Some(value) => {
                self.collected
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(value);
                ExecutionStatus::Success
            }
            None => ExecutionStatus::Skip,
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }
}
