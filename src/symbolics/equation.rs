use super::{Dimension, Expr, Function, Indexed, Substitution};
use indexmap::IndexSet;
use std::fmt;

/// Restriction of an equation to part of the grid, expressed as a remap of
/// root dimensions onto derived ones.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDomain {
    pub name: String,
    pub dimension_map: Vec<(Dimension, Dimension)>,
}

impl SubDomain {
    pub fn new(name: &str, dimension_map: Vec<(Dimension, Dimension)>) -> Self {
        Self { name: name.to_string(), dimension_map }
    }

    pub fn substitution(&self) -> Substitution {
        let mut subs = Substitution::new();
        for (from, to) in &self.dimension_map {
            subs.insert_dimension(from, to);
        }
        subs
    }
}

/// `lhs = rhs`, optionally restricted to a subdomain.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub lhs: Expr,
    pub rhs: Expr,
    pub subdomain: Option<SubDomain>,
    /// Dimensions the equation iterates over without indexing them.
    pub implicit_dims: Vec<Dimension>,
    /// Opt out of relation-driven dimension ordering.
    pub ignore_dim_sort: bool,
}

impl Equation {
    pub fn new(lhs: Expr, rhs: Expr) -> Self {
        Self {
            lhs,
            rhs,
            subdomain: None,
            implicit_dims: Vec::new(),
            ignore_dim_sort: false,
        }
    }

    pub fn with_subdomain(mut self, subdomain: SubDomain) -> Self {
        self.subdomain = Some(subdomain);
        self
    }

    pub fn with_implicit_dims(mut self, dims: Vec<Dimension>) -> Self {
        self.implicit_dims = dims;
        self
    }

    pub fn ignoring_dim_sort(mut self) -> Self {
        self.ignore_dim_sort = true;
        self
    }

    pub fn sides(&self) -> [&Expr; 2] {
        [&self.lhs, &self.rhs]
    }

    /// Same equation with `f` applied to both sides.
    pub fn map(&self, mut f: impl FnMut(&Expr) -> Expr) -> Equation {
        Equation {
            lhs: f(&self.lhs),
            rhs: f(&self.rhs),
            ..self.clone()
        }
    }

    pub fn apply(&self, subs: &Substitution) -> Equation {
        Equation {
            lhs: subs.apply(&self.lhs),
            rhs: subs.apply(&self.rhs),
            subdomain: self.subdomain.clone(),
            implicit_dims: self.implicit_dims.iter().map(|d| subs.apply_dimension(d)).collect(),
            ignore_dim_sort: self.ignore_dim_sort,
        }
    }

    pub fn indexeds(&self, deep: bool) -> Vec<Indexed> {
        let mut found: IndexSet<Indexed> = IndexSet::new();
        for side in self.sides() {
            found.extend(side.indexeds(deep));
        }
        found.into_iter().collect()
    }

    /// Dimensions occurring in either side, at any depth.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut found: IndexSet<Dimension> = IndexSet::new();
        for side in self.sides() {
            found.extend(side.dimensions());
        }
        found.into_iter().collect()
    }

    pub fn functions(&self) -> Vec<Function> {
        let mut found: IndexSet<Function> = IndexSet::new();
        for side in self.sides() {
            found.extend(side.functions());
        }
        found.into_iter().collect()
    }

    /// The function written by this equation, if the target is not a scalar.
    pub fn write(&self) -> Option<&Function> {
        match &self.lhs {
            Expr::Indexed(i) => Some(&i.function),
            Expr::Func(f, _) => Some(f),
            _ => None,
        }
    }

    /// Functions read: everything on the right plus index-only reads on the
    /// left.
    pub fn reads(&self) -> Vec<Function> {
        let mut found: IndexSet<Function> = self.rhs.functions().into_iter().collect();
        for child in self.lhs.children() {
            found.extend(child.functions());
        }
        found.into_iter().collect()
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.lhs, self.rhs)
    }
}
