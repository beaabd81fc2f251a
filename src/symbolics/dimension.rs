use super::{Expr, Function, Symbol};
use std::fmt;
use std::sync::Arc;

/// Named iteration/index axis.
///
/// Dimensions are immutable and compared structurally; "rebuilding" one
/// produces a new, distinct value and leaves every other holder of the
/// original untouched.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Dimension(Arc<DimensionData>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionData {
    pub name: String,
    pub kind: DimKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// Which part of the parent range a sub-dimension spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubRegion {
    Middle,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Thickness {
    pub token: Symbol,
    pub side: Side,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimKind {
    Space {
        spacing: Symbol,
    },
    Time {
        spacing: Symbol,
    },
    /// Buffer-cycling index over a time dimension (`t` over `time`).
    Stepping {
        parent: Dimension,
    },
    Sub {
        parent: Dimension,
        region: SubRegion,
        thickness: [Thickness; 2],
        symbolic_min: Expr,
        symbolic_max: Expr,
        concrete: bool,
    },
    Conditional {
        parent: Dimension,
        condition: Option<Expr>,
        factor: Option<i64>,
        indirect: bool,
    },
    MultiSub {
        parent: Dimension,
        thickness: [Symbol; 2],
        implicit_dimension: Option<Dimension>,
        functions: Function,
        concrete: bool,
    },
    /// Tile iterator introduced by blocking.
    Block {
        parent: Dimension,
        step: Symbol,
    },
    /// Stencil-offset placeholder, lowered by dedicated passes.
    Stencil {
        min: i64,
        max: i64,
    },
}

impl Dimension {
    pub fn from_data(data: DimensionData) -> Self {
        Dimension(Arc::new(data))
    }

    fn with_kind(name: impl Into<String>, kind: DimKind) -> Self {
        Self::from_data(DimensionData { name: name.into(), kind })
    }

    pub fn space(name: &str) -> Self {
        let spacing = Symbol::new(format!("h_{name}"));
        Self::with_kind(name, DimKind::Space { spacing })
    }

    pub fn time(name: &str) -> Self {
        Self::with_kind(name, DimKind::Time { spacing: Symbol::new("dt") })
    }

    pub fn stepping(name: &str, parent: &Dimension) -> Self {
        Self::with_kind(name, DimKind::Stepping { parent: parent.clone() })
    }

    fn tokens(name: &str) -> [Symbol; 2] {
        [Symbol::new(format!("{name}_ltkn")), Symbol::new(format!("{name}_rtkn"))]
    }

    fn sub(name: &str, parent: &Dimension, region: SubRegion, left: i64, right: i64) -> Self {
        let [ltkn, rtkn] = Self::tokens(name);
        let (pmin, pmax) = (parent.symbolic_min(), parent.symbolic_max());
        let (symbolic_min, symbolic_max) = match region {
            SubRegion::Middle => (pmin + ltkn.expr(), pmax - rtkn.expr()),
            SubRegion::Left => (pmin.clone(), pmin + ltkn.expr() - 1),
            SubRegion::Right => (pmax.clone() - rtkn.expr() + 1, pmax),
        };
        let thickness = [
            Thickness { token: ltkn, side: Side::Left, value: left },
            Thickness { token: rtkn, side: Side::Right, value: right },
        ];
        Self::with_kind(
            name,
            DimKind::Sub {
                parent: parent.clone(),
                region,
                thickness,
                symbolic_min,
                symbolic_max,
                concrete: false,
            },
        )
    }

    /// Interior of `parent`, `left` and `right` points away from its ends.
    pub fn sub_middle(name: &str, parent: &Dimension, left: i64, right: i64) -> Self {
        Self::sub(name, parent, SubRegion::Middle, left, right)
    }

    /// First `thickness` points of `parent`.
    pub fn sub_left(name: &str, parent: &Dimension, thickness: i64) -> Self {
        Self::sub(name, parent, SubRegion::Left, thickness, 0)
    }

    /// Last `thickness` points of `parent`.
    pub fn sub_right(name: &str, parent: &Dimension, thickness: i64) -> Self {
        Self::sub(name, parent, SubRegion::Right, 0, thickness)
    }

    pub fn conditional(
        name: &str,
        parent: &Dimension,
        factor: Option<i64>,
        condition: Option<Expr>,
        indirect: bool,
    ) -> Self {
        Self::with_kind(
            name,
            DimKind::Conditional {
                parent: parent.clone(),
                condition,
                factor,
                indirect,
            },
        )
    }

    /// Variable sub-range whose per-index bounds live in `functions`, an
    /// array over `(implicit_dimension, ...)`.
    pub fn multi_sub(
        name: &str,
        parent: &Dimension,
        implicit_dimension: Option<Dimension>,
        functions: Function,
    ) -> Self {
        Self::with_kind(
            name,
            DimKind::MultiSub {
                parent: parent.clone(),
                thickness: Self::tokens(name),
                implicit_dimension,
                functions,
                concrete: false,
            },
        )
    }

    pub fn block(name: &str, parent: &Dimension, step: Symbol) -> Self {
        Self::with_kind(name, DimKind::Block { parent: parent.clone(), step })
    }

    pub fn stencil(name: &str, min: i64, max: i64) -> Self {
        Self::with_kind(name, DimKind::Stencil { min, max })
    }

    pub fn data(&self) -> &DimensionData {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &DimKind {
        &self.0.kind
    }

    pub fn expr(&self) -> Expr {
        Expr::Dim(self.clone())
    }

    /// Same dimension under a new name.
    pub fn renamed(&self, name: impl Into<String>) -> Dimension {
        Self::with_kind(name, self.0.kind.clone())
    }

    /// Same name, new kind payload.
    pub fn rebuild(&self, kind: DimKind) -> Dimension {
        Self::with_kind(self.0.name.clone(), kind)
    }

    pub fn parent(&self) -> Option<&Dimension> {
        match &self.0.kind {
            DimKind::Stepping { parent }
            | DimKind::Sub { parent, .. }
            | DimKind::Conditional { parent, .. }
            | DimKind::MultiSub { parent, .. }
            | DimKind::Block { parent, .. } => Some(parent),
            DimKind::Space { .. } | DimKind::Time { .. } | DimKind::Stencil { .. } => None,
        }
    }

    pub fn is_derived(&self) -> bool {
        self.parent().is_some()
    }

    pub fn indirect(&self) -> bool {
        matches!(self.0.kind, DimKind::Conditional { indirect: true, .. })
    }

    pub fn is_stencil(&self) -> bool {
        matches!(self.0.kind, DimKind::Stencil { .. })
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self.0.kind, DimKind::Conditional { .. })
    }

    pub fn is_block(&self) -> bool {
        matches!(self.0.kind, DimKind::Block { .. })
    }

    pub fn is_time(&self) -> bool {
        matches!(self.root().0.kind, DimKind::Time { .. })
    }

    /// Whether the bound symbols of this dimension were already minted for a
    /// single use.
    pub fn is_concrete(&self) -> bool {
        matches!(
            self.0.kind,
            DimKind::Sub { concrete: true, .. } | DimKind::MultiSub { concrete: true, .. }
        )
    }

    /// The dimension used to index into functions.
    pub fn index(&self) -> &Dimension {
        match self.parent() {
            Some(parent) if !self.indirect() => parent,
            _ => self,
        }
    }

    pub fn root(&self) -> &Dimension {
        let mut d = self;
        while let Some(parent) = d.parent() {
            d = parent;
        }
        d
    }

    /// Parent chain, nearest first.
    pub fn ancestors(&self) -> Vec<Dimension> {
        let mut out = Vec::new();
        let mut d = self;
        while let Some(parent) = d.parent() {
            out.push(parent.clone());
            d = parent;
        }
        out
    }

    /// This dimension followed by its ancestors.
    pub fn defines(&self) -> Vec<Dimension> {
        let mut out = vec![self.clone()];
        out.extend(self.ancestors());
        out
    }

    pub fn spacing(&self) -> Option<&Symbol> {
        match &self.root().0.kind {
            DimKind::Space { spacing } | DimKind::Time { spacing } => Some(spacing),
            _ => None,
        }
    }

    pub fn symbolic_min(&self) -> Expr {
        match &self.0.kind {
            DimKind::Space { .. } | DimKind::Time { .. } => {
                Symbol::new(format!("{}_m", self.name())).expr()
            }
            DimKind::Sub { symbolic_min, .. } => symbolic_min.clone(),
            DimKind::MultiSub { parent, thickness, .. } => {
                parent.symbolic_min() + thickness[0].expr()
            }
            DimKind::Stencil { min, .. } => Expr::Int(*min),
            DimKind::Stepping { parent }
            | DimKind::Conditional { parent, .. }
            | DimKind::Block { parent, .. } => parent.symbolic_min(),
        }
    }

    pub fn symbolic_max(&self) -> Expr {
        match &self.0.kind {
            DimKind::Space { .. } | DimKind::Time { .. } => {
                Symbol::new(format!("{}_M", self.name())).expr()
            }
            DimKind::Sub { symbolic_max, .. } => symbolic_max.clone(),
            DimKind::MultiSub { parent, thickness, .. } => {
                parent.symbolic_max() - thickness[1].expr()
            }
            DimKind::Stencil { max, .. } => Expr::Int(*max),
            DimKind::Stepping { parent }
            | DimKind::Conditional { parent, .. }
            | DimKind::Block { parent, .. } => parent.symbolic_max(),
        }
    }

    /// Left/right thickness tokens of (multi) sub-dimensions.
    pub fn thickness_tokens(&self) -> Vec<Symbol> {
        match &self.0.kind {
            DimKind::Sub { thickness, .. } => thickness.iter().map(|t| t.token.clone()).collect(),
            DimKind::MultiSub { thickness, .. } => thickness.to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn condition(&self) -> Option<&Expr> {
        match &self.0.kind {
            DimKind::Conditional { condition, .. } => condition.as_ref(),
            _ => None,
        }
    }

    pub fn implicit_dimension(&self) -> Option<&Dimension> {
        match &self.0.kind {
            DimKind::MultiSub { implicit_dimension, .. } => implicit_dimension.as_ref(),
            _ => None,
        }
    }

    pub fn functions(&self) -> Option<&Function> {
        match &self.0.kind {
            DimKind::MultiSub { functions, .. } => Some(functions),
            _ => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dimension({})", self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdimension_bounds_use_thickness_tokens() {
        let x = Dimension::space("x");
        let xi = Dimension::sub_middle("xi", &x, 2, 2);
        assert_eq!(xi.symbolic_min().to_string(), "x_m + xi_ltkn");
        assert_eq!(xi.symbolic_max().to_string(), "x_M - xi_rtkn");
        assert_eq!(xi.index(), &x);
        assert_eq!(xi.spacing(), x.spacing());
    }

    #[test]
    fn indirect_conditional_indexes_itself() {
        let time = Dimension::time("time");
        let direct = Dimension::conditional("t_sub", &time, Some(4), None, false);
        let indirect = Dimension::conditional("t_ind", &time, None, None, true);
        assert_eq!(direct.index(), &time);
        assert_eq!(indirect.index(), &indirect);
        assert!(direct.is_time());
    }

    #[test]
    fn rebuilt_dimension_is_distinct() {
        let x = Dimension::space("x");
        let xi = Dimension::sub_left("xl", &x, 3);
        let again = xi.rebuild(xi.kind().clone());
        assert_eq!(xi, again);
        assert_ne!(xi, xi.renamed("xl0"));
        assert_eq!(xi.ancestors(), vec![x.clone()]);
        assert_eq!(xi.root(), &x);
    }
}
