//! Typed, named ports and the values that travel across them.

use crate::error::{Error, Result};
use std::any::{Any, TypeId, type_name};
use std::fmt;

/// Direction of a port relative to its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Receives values from an upstream node.
    Input,
    /// Produces values for downstream nodes.
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// Declaration of one port on a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    name: String,
    direction: PortDirection,
    type_id: TypeId,
    type_name: &'static str,
    required: bool,
}

impl PortSpec {
    /// An input port that must be connected before the pipeline runs.
    pub fn required<T: Send + 'static>(name: impl Into<String>) -> Self {
        Self::new::<T>(name, PortDirection::Input, true)
    }

    /// An input port that may be left unconnected.
    ///
    /// A `FAILURE` arriving on an optional port does not fail the node.
    pub fn optional<T: Send + 'static>(name: impl Into<String>) -> Self {
        Self::new::<T>(name, PortDirection::Input, false)
    }

    /// An output port.
    pub fn output<T: Send + 'static>(name: impl Into<String>) -> Self {
        Self::new::<T>(name, PortDirection::Output, false)
    }

    fn new<T: Send + 'static>(
        name: impl Into<String>,
        direction: PortDirection,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            required,
        }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port direction.
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Type carried by the port.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Human-readable name of the carried type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether an input port must be connected.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Whether values of this port can be sent to `other`.
    pub fn accepts(&self, other: &PortSpec) -> bool {
        self.type_id == other.type_id
    }
}

/// A type-erased value moved from an output port to an input port.
///
/// Values are owned; each downstream edge receives its own copy produced by
/// the upstream stage's output getter.
pub struct PortValue {
    inner: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl PortValue {
    /// Wrap a value.
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            inner: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Name of the wrapped type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// [`TypeId`] of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }

    /// Whether the wrapped value is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Borrow the value as `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Unwrap the value as `T`.
    pub fn downcast<T: 'static>(self) -> Result<T> {
        let actual = self.type_name;
        self.inner
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::ValueType {
                expected: type_name::<T>(),
                actual,
            })
    }
}

impl fmt::Debug for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortValue")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}
