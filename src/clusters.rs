use crate::equations::dimension_sort;
use crate::error::Result;
use crate::symbolics::{DimKind, Dimension, Equation, Expr, Function};
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use tracing::debug;

/// One loop of an iteration space. Stepping dimensions ride along their
/// parent's loop as sub-iterators.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub dim: Dimension,
    pub sub_iterators: Vec<Dimension>,
}

impl Interval {
    pub fn new(dim: Dimension) -> Self {
        Self { dim, sub_iterators: Vec::new() }
    }

    /// Whether iterating this interval also iterates `d`.
    pub fn defines(&self, d: &Dimension) -> bool {
        &self.dim == d || self.sub_iterators.contains(d) || self.dim.ancestors().contains(d)
    }
}

/// Ordered loop nest, outermost first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationSpace {
    intervals: Vec<Interval>,
}

impl IterationSpace {
    pub fn new(intervals: Vec<Interval>) -> Self {
        Self { intervals }
    }

    /// Builds the loop nest for dimensions already in dependence order.
    pub fn from_dimensions(dims: &[Dimension]) -> Self {
        let mut intervals: Vec<Interval> = Vec::new();
        for d in dims {
            match d.kind() {
                DimKind::Stencil { .. } | DimKind::Conditional { .. } => continue,
                DimKind::Stepping { parent } => {
                    match intervals.iter_mut().find(|i| &i.dim == parent) {
                        Some(interval) => interval.sub_iterators.push(d.clone()),
                        None => intervals.push(Interval {
                            dim: parent.clone(),
                            sub_iterators: vec![d.clone()],
                        }),
                    }
                }
                // A sub-range replaces the loop over its parent
                DimKind::Sub { parent, .. } | DimKind::MultiSub { parent, .. } => {
                    match intervals.iter_mut().find(|i| &i.dim == parent) {
                        Some(interval) => interval.dim = d.clone(),
                        None => intervals.push(Interval::new(d.clone())),
                    }
                }
                _ => {
                    if !intervals.iter().any(|i| i.defines(d)) {
                        intervals.push(Interval::new(d.clone()));
                    }
                }
            }
        }
        Self { intervals }
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn dimensions(&self) -> Vec<Dimension> {
        self.intervals.iter().map(|i| i.dim.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The loop dimension through which `d` is iterated, if any.
    pub fn lookup(&self, d: &Dimension) -> Option<&Dimension> {
        self.intervals.iter().find(|i| i.defines(d)).map(|i| &i.dim)
    }

    pub fn position(&self, d: &Dimension) -> Option<usize> {
        self.intervals.iter().position(|i| &i.dim == d)
    }

    pub fn insert(&mut self, pos: usize, interval: Interval) {
        self.intervals.insert(pos, interval);
    }

    /// Sub-space made of the loops `keep` accepts, order preserved.
    pub fn project(&self, keep: impl Fn(&Interval) -> bool) -> IterationSpace {
        Self { intervals: self.intervals.iter().filter(|i| keep(i)).cloned().collect() }
    }

    /// Length of the common outer prefix with `other`.
    pub fn common_prefix(&self, other: &IterationSpace) -> usize {
        self.intervals
            .iter()
            .zip(&other.intervals)
            .take_while(|(a, b)| a == b)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AsyncKind {
    /// Writes go to host memory: the cluster runs as an asynchronous task.
    Task(Dimension),
    /// Reads come from host memory: data is copied in ahead of use.
    Memcpy(Dimension),
}

impl AsyncKind {
    pub fn dim(&self) -> &Dimension {
        match self {
            AsyncKind::Task(d) | AsyncKind::Memcpy(d) => d,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// Loops carrying a dependence; every other loop is parallel.
    pub sequential: IndexSet<Dimension>,
    pub blocked: bool,
    pub async_kind: Option<AsyncKind>,
    /// Host-side functions read through a device buffer.
    pub buffered: Vec<Function>,
}

/// Functions read and written by a cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    pub reads: Vec<Function>,
    pub writes: Vec<Function>,
}

impl Scope {
    /// True if `later` must stay after `self`'s owner: flow, anti or output
    /// dependence.
    pub fn conflicts(&self, later: &Scope) -> bool {
        later.reads.iter().any(|f| self.writes.contains(f))
            || later.writes.iter().any(|f| self.writes.contains(f) || self.reads.contains(f))
    }
}

/// Equations sharing an iteration space and guards.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub exprs: Vec<Equation>,
    pub ispace: IterationSpace,
    pub guards: IndexMap<Dimension, Expr>,
    pub properties: Properties,
}

impl Cluster {
    pub fn new(
        exprs: Vec<Equation>,
        ispace: IterationSpace,
        guards: IndexMap<Dimension, Expr>,
    ) -> Self {
        let sequential = detect_sequential(&exprs, &ispace);
        Self {
            exprs,
            ispace,
            guards,
            properties: Properties { sequential, ..Properties::default() },
        }
    }

    /// Same loops, guards and properties around new equations.
    pub fn rebuild(&self, exprs: Vec<Equation>) -> Self {
        let sequential = detect_sequential(&exprs, &self.ispace);
        Self {
            exprs,
            ispace: self.ispace.clone(),
            guards: self.guards.clone(),
            properties: Properties { sequential, ..self.properties.clone() },
        }
    }

    pub fn scope(&self) -> Scope {
        let mut reads: IndexSet<Function> = IndexSet::new();
        let mut writes: IndexSet<Function> = IndexSet::new();
        for eq in &self.exprs {
            reads.extend(eq.reads());
            writes.extend(eq.write().cloned());
        }
        Scope { reads: reads.into_iter().collect(), writes: writes.into_iter().collect() }
    }

    pub fn is_parallel(&self, d: &Dimension) -> bool {
        self.ispace.position(d).is_some() && !self.properties.sequential.contains(d)
    }

    /// Clusters may only be merged when they would produce the same loop nest.
    pub fn is_fusible_with(&self, other: &Cluster) -> bool {
        self.ispace == other.ispace
            && self.guards == other.guards
            && self.properties.async_kind == other.properties.async_kind
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, eq) in self.exprs.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{eq}")?;
        }
        Ok(())
    }
}

/// Splits an index into its symbolic part and integer offset.
pub(crate) fn split_offset(index: &Expr) -> (Expr, i64) {
    match index {
        Expr::Int(v) => (Expr::Int(0), *v),
        Expr::Add(terms) => match terms.last() {
            Some(Expr::Int(v)) => (Expr::add(terms[..terms.len() - 1].iter().cloned()), *v),
            _ => (index.clone(), 0),
        },
        _ => (index.clone(), 0),
    }
}

enum Distance {
    Zero,
    Carried,
    Unknown,
}

fn distance(a: &Expr, b: &Expr) -> Distance {
    let (base_a, off_a) = split_offset(a);
    let (base_b, off_b) = split_offset(b);
    match (base_a == base_b, off_a == off_b) {
        (true, true) => Distance::Zero,
        (true, false) => Distance::Carried,
        (false, _) => Distance::Unknown,
    }
}

/// Loops carrying a dependence between a write and any other access to the
/// written function. The outermost loop along which two accesses differ
/// carries their dependence; scalar temporaries are private to an iteration.
fn detect_sequential(exprs: &[Equation], ispace: &IterationSpace) -> IndexSet<Dimension> {
    // Time stepping is ordered regardless of the accesses
    let mut sequential: IndexSet<Dimension> = ispace
        .intervals()
        .iter()
        .filter(|i| i.dim.is_time() && !i.dim.is_block())
        .map(|i| i.dim.clone())
        .collect();
    let accesses: Vec<_> = exprs.iter().flat_map(|eq| eq.indexeds(true)).collect();
    let reads: IndexSet<Function> = exprs.iter().flat_map(|eq| eq.reads()).collect();

    for eq in exprs {
        let Expr::Indexed(write) = &eq.lhs else {
            continue;
        };
        let others = accesses.iter().filter(|a| a.function == write.function);
        for other in others {
            for interval in ispace.intervals() {
                let positions: Vec<usize> = write
                    .indices
                    .iter()
                    .enumerate()
                    .filter(|(_, index)| index.dimensions().iter().any(|d| interval.defines(d)))
                    .map(|(pos, _)| pos)
                    .collect();
                if positions.is_empty() {
                    // Not indexed along this loop: every iteration hits the same
                    // element, which only matters if it is also read
                    if reads.contains(&write.function) {
                        sequential.insert(interval.dim.clone());
                        break;
                    }
                    continue;
                }
                let mut zero = true;
                for pos in positions {
                    match (write.indices.get(pos), other.indices.get(pos)) {
                        (Some(a), Some(b)) => match distance(a, b) {
                            Distance::Zero => {}
                            Distance::Carried | Distance::Unknown => zero = false,
                        },
                        _ => zero = false,
                    }
                }
                if !zero {
                    sequential.insert(interval.dim.clone());
                    break;
                }
            }
        }
    }
    sequential
}

/// One cluster per equation, in input order.
pub fn clusterize(exprs: &[Equation]) -> Result<Vec<Cluster>> {
    let mut clusters = Vec::with_capacity(exprs.len());
    for eq in exprs {
        let dims = dimension_sort(eq)?;
        let ispace = IterationSpace::from_dimensions(&dims);
        let mut guards = IndexMap::new();
        for d in &dims {
            if let Some(condition) = d.condition() {
                guards.insert(d.clone(), condition.clone());
            }
        }
        clusters.push(Cluster::new(vec![eq.clone()], ispace, guards));
    }
    debug!(clusters = clusters.len(), "clusterized");
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolics::CmpOp;

    fn heat() -> (Dimension, Dimension, Dimension, Function, Equation) {
        let time = Dimension::time("time");
        let t = Dimension::stepping("t", &time);
        let x = Dimension::space("x");
        let u = Function::time_dense("u", vec![t.clone(), x.clone()], 1);
        let eq = Equation::new(
            u.at([t.expr() + 1, x.expr() + 1]),
            u.at([t.expr(), x.expr()]) + u.at([t.expr(), x.expr() + 2]),
        );
        (time, t, x, u, eq)
    }

    #[test]
    fn stepping_dimension_shares_its_parent_loop() {
        let (time, t, x, _, eq) = heat();
        let clusters = clusterize(&[eq]).unwrap();
        let ispace = &clusters[0].ispace;
        assert_eq!(ispace.dimensions(), vec![time.clone(), x.clone()]);
        assert_eq!(ispace.lookup(&t), Some(&time));
        assert_eq!(ispace.intervals()[0].sub_iterators, vec![t]);
    }

    #[test]
    fn time_carries_the_stencil_dependence() {
        let (time, _, x, _, eq) = heat();
        let c = &clusterize(&[eq]).unwrap()[0];
        assert!(!c.is_parallel(&time));
        assert!(c.is_parallel(&x));
    }

    #[test]
    fn in_place_update_is_fully_parallel() {
        let x = Dimension::space("x");
        let y = Dimension::space("y");
        let f = Function::dense("f", vec![x.clone(), y.clone()], 0);
        let eq = Equation::new(f.at([x.expr(), y.expr()]), f.at([x.expr(), y.expr()]) * 2);
        let c = &clusterize(&[eq]).unwrap()[0];
        assert!(c.properties.sequential.is_empty());
    }

    #[test]
    fn reductions_serialize_the_reduced_loop() {
        let x = Dimension::space("x");
        let y = Dimension::space("y");
        let f = Function::dense("f", vec![x.clone()], 0);
        let g = Function::dense("g", vec![x.clone(), y.clone()], 0);
        let eq = Equation::new(f.at([x.expr()]), f.at([x.expr()]) + g.at([x.expr(), y.expr()]));
        let c = &clusterize(&[eq]).unwrap()[0];
        assert!(c.is_parallel(&x));
        assert!(!c.is_parallel(&y));
    }

    #[test]
    fn subdimension_replaces_its_parent_loop() {
        let x = Dimension::space("x");
        let xi = Dimension::sub_middle("xi", &x, 1, 1);
        let f = Function::dense("f", vec![x.clone()], 0);
        let ispace = IterationSpace::from_dimensions(&[x.clone(), xi.clone()]);
        assert_eq!(ispace.dimensions(), vec![xi.clone()]);
        assert_eq!(ispace.lookup(&x), Some(&xi));
        let eq = Equation::new(f.at([xi.expr()]), Expr::Int(0));
        assert_eq!(clusterize(&[eq]).unwrap()[0].ispace.dimensions(), vec![xi]);
    }

    #[test]
    fn conditions_become_guards() {
        let time = Dimension::time("time");
        let x = Dimension::space("x");
        let cond = Expr::cmp(CmpOp::Gt, time.expr(), Expr::Int(10));
        let tc = Dimension::conditional("tc", &time, None, Some(cond.clone()), false);
        let f = Function::dense("f", vec![x.clone()], 0);
        let eq = Equation::new(f.at([x.expr()]), Expr::Int(1)).with_implicit_dims(vec![tc.clone()]);
        let c = &clusterize(&[eq]).unwrap()[0];
        assert_eq!(c.guards.get(&tc), Some(&cond));
        assert_eq!(c.ispace.dimensions(), vec![x, time]);
    }

    #[test]
    fn scope_tracks_reads_and_writes() {
        let (_, _, _, u, eq) = heat();
        let c = &clusterize(&[eq]).unwrap()[0];
        let scope = c.scope();
        assert_eq!(scope.writes, vec![u.clone()]);
        assert_eq!(scope.reads, vec![u]);
        assert!(scope.conflicts(&scope));
    }
}
