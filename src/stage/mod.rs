//! Stage contract and ports.
//!
//! A [`Stage`] is the pluggable unit of work a pipeline schedules. Stages
//! exchange owned, type-erased [`PortValue`]s through named ports declared
//! with [`PortSpec`]; the pipeline checks port types when nodes are
//! connected.

mod port;
mod traits;

pub use port::{PortDirection, PortSpec, PortValue};
pub use traits::Stage;
