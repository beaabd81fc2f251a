//! Minimal symbolic layer: dimensions, functions, expressions, equations and
//! simultaneous substitution.

pub mod dimension;
pub mod equation;
pub mod expr;
pub mod function;

pub use dimension::{DimKind, Dimension, DimensionData, Side, SubRegion, Thickness};
pub use equation::{Equation, SubDomain};
pub use expr::{CmpOp, Expr, Indexed, Substitution, Symbol};
pub use function::{Function, FunctionData, FunctionKind};
