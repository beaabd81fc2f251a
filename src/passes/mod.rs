pub mod cluster;
pub mod graph;

use crate::equations::collect_derivatives;
use crate::pipeline::PassContext;
use crate::registry::SymbolRegistry;
use crate::symbolics::Equation;

/// Merges derivative terms over the same function and dimension.
pub fn collect_derivs(
    exprs: Vec<Equation>,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Equation>> {
    Ok(collect_derivatives(&exprs))
}
