//! Middle/back-end of a stencil compiler: symbolic finite-difference
//! equations in, a lowered and device-annotated program graph out.

pub mod clusters;
pub mod equations;
pub mod error;
pub mod iet;
pub mod operator;
pub mod options;
pub mod passes;
pub mod pipeline;
pub mod registry;
pub mod streaming;
pub mod symbolics;
pub mod target;

pub use error::{Error, Result};
pub use operator::{DeviceBackend, OptLevel, Operator, OperatorBuilder};
pub use options::{CompilerOptions, OptionValue, RawOptions};
