//! Boundary nodes of a composite stage.

use crate::error::{Error, Result};
use crate::stage::{PortDirection, PortSpec, PortValue, Stage};
use crate::status::ExecutionStatus;

/// A pass-through node on the boundary of a [`CompositeStage`].
///
/// A pad holds the value set during the current tick and falls back to
/// `T::default()` when nothing was set, so the nested pipeline always sees
/// a value of the declared type.
///
/// [`CompositeStage`]: super::CompositeStage
#[derive(Debug)]
pub struct Pad<T> {
    required: bool,
    incoming: Option<T>,
    current: T,
}

impl<T: Default + Clone + Send + 'static> Pad<T> {
    /// A pad fed by the parent pipeline. Its input is never wired inside
    /// the nested graph.
    pub fn input() -> Self {
        Self {
            required: false,
            incoming: None,
            current: T::default(),
        }
    }

    /// A pad read by the parent pipeline. A nested node must feed it.
    pub fn output() -> Self {
        Self {
            required: true,
            incoming: None,
            current: T::default(),
        }
    }

    /// Value from the last step.
    pub fn current(&self) -> &T {
        &self.current
    }
}

impl<T: Default + Clone + Send + 'static> Stage for Pad<T> {
    fn type_name(&self) -> &str {
        "pad"
    }

    fn input_ports(&self) -> Vec<PortSpec> {
        if self.required {
            vec![PortSpec::required::<T>("value")]
        } else {
            vec![PortSpec::optional::<T>("value")]
        }
    }

    fn output_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output::<T>("value")]
    }

    fn set_input(&mut self, port: &str, value: PortValue) -> Result<()> {
        if port != "value" {
            return Err(Error::UnknownPort {
                node: "pad".to_string(),
                port: port.to_string(),
                direction: PortDirection::Input,
            });
        }
        self.incoming = Some(value.downcast()?);
        Ok(())
    }

    fn step(&mut self) -> ExecutionStatus {
        self.current = self.incoming.take().unwrap_or_default();
        ExecutionStatus::Success
    }

    fn output(&self, port: &str) -> Result<PortValue> {
        if port != "value" {
            return Err(Error::UnknownPort {
                node: "pad".to_string(),
                port: port.to_string(),
                direction: PortDirection::Output,
            });
        }
        Ok(PortValue::new(self.current.clone()))
    }

    fn reset(&mut self) -> Result<()> {
        self.incoming = None;
        self.current = T::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_falls_back_to_default() {
        let mut pad = Pad::<i32>::input();
        pad.set_input("value", PortValue::new(5)).unwrap();
        assert_eq!(pad.step(), ExecutionStatus::Success);
        assert_eq!(pad.output("value").unwrap().downcast::<i32>().unwrap(), 5);

        // Nothing set this tick.
        pad.step();
        assert_eq!(*pad.current(), 0);
    }

    #[test]
    fn test_pad_ports() {
        let mut input = Pad::<String>::input();
        let output = Pad::<String>::output();
        assert!(!input.input_ports()[0].is_required());
        assert!(output.input_ports()[0].is_required());
        assert!(input.set_input("other", PortValue::new(String::new())).is_err());
        assert!(output.output("other").is_err());
    }
}
