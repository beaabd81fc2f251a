//! Equation-level algorithms run ahead of clusterization.

pub mod concretize;
pub mod derivatives;
pub mod lower;
pub mod sort;

pub use concretize::concretize_subdims;
pub use derivatives::{collect_derivatives, evaluate_derivatives};
pub use lower::{lower_expr, lower_exprs};
pub use sort::dimension_sort;
