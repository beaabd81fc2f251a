use super::{Dimension, Expr, Indexed};
use std::fmt;
use std::sync::Arc;

/// A discretized field or compiler temporary defined over dimensions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Function(Arc<FunctionData>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionData {
    pub name: String,
    pub kind: FunctionKind,
    pub dimensions: Vec<Dimension>,
    pub halo: Vec<(usize, usize)>,
    pub padding: Vec<(usize, usize)>,
    pub values: Option<Arc<[i64]>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Dense,
    TimeDense,
    /// Compiler temporary. `origin` is the function it was derived from, if
    /// any.
    Array {
        initvalue: Option<Vec<Expr>>,
        origin: Option<Function>,
    },
    /// Composite of several functions (vector/tensor fields).
    Tensor { components: Vec<Function> },
}

impl Function {
    pub fn from_data(data: FunctionData) -> Self {
        Function(Arc::new(data))
    }

    fn build(
        name: &str,
        kind: FunctionKind,
        dimensions: Vec<Dimension>,
        halo: Vec<(usize, usize)>,
    ) -> Self {
        let padding = vec![(0, 0); dimensions.len()];
        Self::from_data(FunctionData {
            name: name.to_string(),
            kind,
            dimensions,
            halo,
            padding,
            values: None,
        })
    }

    fn stencil_halo(dimensions: &[Dimension], space_order: usize) -> Vec<(usize, usize)> {
        dimensions
            .iter()
            .map(|d| if d.is_time() { (0, 0) } else { (space_order, space_order) })
            .collect()
    }

    /// Field with a halo of `space_order` points on every space dimension.
    pub fn dense(name: &str, dimensions: Vec<Dimension>, space_order: usize) -> Self {
        let halo = Self::stencil_halo(&dimensions, space_order);
        Self::build(name, FunctionKind::Dense, dimensions, halo)
    }

    pub fn time_dense(name: &str, dimensions: Vec<Dimension>, space_order: usize) -> Self {
        let halo = Self::stencil_halo(&dimensions, space_order);
        Self::build(name, FunctionKind::TimeDense, dimensions, halo)
    }

    pub fn array(name: &str, dimensions: Vec<Dimension>) -> Self {
        let halo = vec![(0, 0); dimensions.len()];
        Self::build(name, FunctionKind::Array { initvalue: None, origin: None }, dimensions, halo)
    }

    pub fn tensor(name: &str, components: Vec<Function>) -> Self {
        Self::build(name, FunctionKind::Tensor { components }, Vec::new(), Vec::new())
    }

    pub fn with_halo(&self, halo: Vec<(usize, usize)>) -> Self {
        let mut data = self.data().clone();
        data.halo = halo;
        Self::from_data(data)
    }

    pub fn with_padding(&self, padding: Vec<(usize, usize)>) -> Self {
        let mut data = self.data().clone();
        data.padding = padding;
        Self::from_data(data)
    }

    pub fn with_values(&self, values: Vec<i64>) -> Self {
        let mut data = self.data().clone();
        data.values = Some(values.into());
        Self::from_data(data)
    }

    /// Array with an inline initializer. No-op on non-arrays.
    pub fn with_initvalue(&self, init: Vec<Expr>) -> Self {
        let mut data = self.data().clone();
        if let FunctionKind::Array { initvalue, .. } = &mut data.kind {
            *initvalue = Some(init);
        }
        Self::from_data(data)
    }

    pub fn data(&self) -> &FunctionData {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.0.kind
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.0.dimensions
    }

    pub fn halo(&self) -> &[(usize, usize)] {
        &self.0.halo
    }

    pub fn padding(&self) -> &[(usize, usize)] {
        &self.0.padding
    }

    pub fn values(&self) -> Option<&[i64]> {
        self.0.values.as_deref()
    }

    /// Halo plus padding on the left of dimension `pos`.
    pub fn left_nodomain(&self, pos: usize) -> usize {
        let halo = self.0.halo.get(pos).map_or(0, |h| h.0);
        let padding = self.0.padding.get(pos).map_or(0, |p| p.0);
        halo + padding
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.kind, FunctionKind::Array { .. })
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.0.kind, FunctionKind::Tensor { .. })
    }

    pub fn initvalue(&self) -> Option<&[Expr]> {
        match &self.0.kind {
            FunctionKind::Array { initvalue, .. } => initvalue.as_deref(),
            _ => None,
        }
    }

    pub fn origin(&self) -> Option<&Function> {
        match &self.0.kind {
            FunctionKind::Array { origin, .. } => origin.as_ref(),
            _ => None,
        }
    }

    /// The constituent functions of a composite, or the function itself.
    pub fn components(&self) -> Vec<Function> {
        match &self.0.kind {
            FunctionKind::Tensor { components } => {
                components.iter().flat_map(|c| c.components()).collect()
            }
            _ => vec![self.clone()],
        }
    }

    pub fn time_dim(&self) -> Option<&Dimension> {
        self.0.dimensions.iter().find(|d| d.is_time())
    }

    /// Only user fields with a time axis can be too large for device memory.
    pub fn is_streamable(&self) -> bool {
        !self.is_array() && !self.is_tensor() && self.time_dim().is_some()
    }

    pub fn at(&self, indices: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Indexed(Indexed { function: self.clone(), indices: indices.into_iter().collect() })
    }

    /// Bare application `f(args)`.
    pub fn apply(&self, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Func(self.clone(), args.into_iter().collect())
    }

    /// Bare application over the function's own dimensions.
    pub fn call(&self) -> Expr {
        self.apply(self.0.dimensions.iter().map(Dimension::expr))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_halo_skips_time() {
        let t = Dimension::time("t");
        let x = Dimension::space("x");
        let u = Function::time_dense("u", vec![t.clone(), x.clone()], 4)
            .with_padding(vec![(0, 0), (1, 0)]);
        assert_eq!(u.left_nodomain(0), 0);
        assert_eq!(u.left_nodomain(1), 5);
        assert_eq!(u.time_dim(), Some(&t));
        assert!(u.is_streamable());
    }

    #[test]
    fn tensor_components_flatten() {
        let x = Dimension::space("x");
        let a = Function::dense("a", vec![x.clone()], 1);
        let b = Function::dense("b", vec![x.clone()], 1);
        let v = Function::tensor("v", vec![a.clone(), Function::tensor("w", vec![b.clone()])]);
        assert_eq!(v.components(), vec![a, b]);
        assert!(!v.is_streamable());
    }
}
