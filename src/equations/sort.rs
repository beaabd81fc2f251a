use crate::error::{Error, Result};
use crate::symbolics::{Dimension, Equation, Expr, Indexed};
use indexmap::IndexSet;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

/// Topologically sorts the dimensions of `expr` based on the order in which
/// they appear within its indexed accesses.
///
/// Index shapes that are neither affine in a single dimension nor nested
/// accesses fall back to every dimension they mention, sorted by name. That
/// fallback may order such dimensions differently from what the access
/// intends; it never fails.
pub fn dimension_sort(expr: &Equation) -> Result<Vec<Dimension>> {
    let mut relations: IndexSet<Vec<Dimension>> = IndexSet::new();
    if !expr.ignore_dim_sort {
        for indexed in expr.indexeds(false) {
            relations.insert(handle_indexed(&indexed));
        }
    }
    // Implicit dimensions (scalar temporaries, stepping) form a relation too
    relations.insert(expr.implicit_dims.clone());

    // Leftover free dimensions, plus pure data dimensions such as the one of A[3]
    let mut extra: IndexSet<Dimension> = expr.dimensions().into_iter().collect();
    for indexed in expr.indexeds(true) {
        for (d, index) in indexed.function.dimensions().iter().zip(&indexed.indices) {
            if index.is_integer() {
                extra.insert(d.clone());
            }
        }
    }
    let mut extra: Vec<Dimension> = extra.into_iter().collect();
    extra.sort_by(|a, b| a.name().cmp(b.name()));

    let mut implicit: IndexSet<Vec<Dimension>> = IndexSet::new();
    // A dimension's backing index goes right before it, so that `(time, xi)`
    // becomes `(time, x, xi)` rather than letting `x` float before `time`
    for relation in &relations {
        let mut dims: IndexSet<Dimension> = IndexSet::new();
        for d in relation {
            if d.index().name() != d.name() {
                dims.insert(d.index().clone());
            }
            dims.insert(d.clone());
        }
        implicit.insert(dims.into_iter().collect());
    }
    // (parent, d) and never (d, parent)
    for d in &extra {
        if let Some(parent) = d.parent() {
            if !d.indirect() {
                implicit.insert(vec![parent.clone(), d.clone()]);
            }
        }
    }

    let mut order = PartialOrder::default();
    for relation in &implicit {
        order.chain(relation);
    }
    for d in &extra {
        order.node(d);
    }
    let sorted = order.sort(expr)?;
    trace!(eq = %expr, order = ?sorted, "dimensions sorted");
    Ok(sorted)
}

fn handle_indexed(indexed: &Indexed) -> Vec<Dimension> {
    let mut relation = Vec::new();
    for index in &indexed.indices {
        if let Some(d) = affine_dimension(index) {
            relation.push(d);
            continue;
        }

        // Maybe there are nested accesses, as in A[B[i]]
        let nested: Vec<Dimension> =
            index.indexeds(false).iter().flat_map(handle_indexed).collect();
        if !nested.is_empty() {
            relation.extend(nested);
            continue;
        }

        let mut atoms = index.dimensions();
        atoms.sort_by(|a, b| a.name().cmp(b.name()));
        relation.extend(atoms);
    }
    // Stencil dimensions are lowered by dedicated passes later on
    relation.retain(|d| !d.is_stencil());
    relation
}

/// The dimension `d` if `index` has the shape `a*d + b` with `b` free of any
/// other non-stencil dimension.
fn affine_dimension(index: &Expr) -> Option<Dimension> {
    let mut has_nested = false;
    index.visit(&mut |e| {
        if let Expr::Indexed(_) = e {
            has_nested = true;
        }
        !has_nested
    });
    if has_nested {
        return None;
    }
    let dims: Vec<Dimension> =
        index.dimensions().into_iter().filter(|d| !d.is_stencil()).collect();
    match dims.as_slice() {
        [d] if is_affine_in(index, d) => Some(d.clone()),
        _ => None,
    }
}

fn mentions(e: &Expr, d: &Dimension) -> bool {
    e.dimensions().contains(d)
}

fn is_affine_in(e: &Expr, d: &Dimension) -> bool {
    match e {
        Expr::Int(_) | Expr::Sym(_) | Expr::Dim(_) => true,
        Expr::Add(terms) => terms.iter().all(|t| is_affine_in(t, d)),
        Expr::Mul(factors) => {
            let mut dependent = factors.iter().filter(|f| mentions(f, d));
            match (dependent.next(), dependent.next()) {
                (None, _) => true,
                (Some(f), None) => is_affine_in(f, d),
                _ => false,
            }
        }
        _ => !mentions(e, d),
    }
}

/// Dimension DAG whose ties are broken by discovery order.
#[derive(Default)]
struct PartialOrder {
    graph: DiGraph<Dimension, ()>,
    nodes: HashMap<Dimension, NodeIndex>,
}

impl PartialOrder {
    fn node(&mut self, d: &Dimension) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(d) {
            return idx;
        }
        let idx = self.graph.add_node(d.clone());
        self.nodes.insert(d.clone(), idx);
        idx
    }

    fn chain(&mut self, dims: &[Dimension]) {
        let idxs: Vec<NodeIndex> = dims.iter().map(|d| self.node(d)).collect();
        for pair in idxs.windows(2) {
            if pair[0] != pair[1] {
                self.graph.update_edge(pair[0], pair[1], ());
            }
        }
    }

    fn sort(self, expr: &Equation) -> Result<Vec<Dimension>> {
        if let Err(cycle) = toposort(&self.graph, None) {
            let offending = cycle.node_id();
            let dims = tarjan_scc(&self.graph)
                .into_iter()
                .find(|scc| scc.contains(&offending))
                .unwrap_or_else(|| vec![offending])
                .into_iter()
                .map(|idx| self.graph[idx].name().to_string())
                .collect();
            return Err(Error::DimensionCycle { equation: expr.to_string(), dims });
        }

        let mut indegree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut sorted = Vec::with_capacity(indegree.len());
        while let Some(Reverse(i)) = ready.pop() {
            let n = NodeIndex::new(i);
            sorted.push(self.graph[n].clone());
            for m in self.graph.neighbors_directed(n, Direction::Outgoing) {
                indegree[m.index()] -= 1;
                if indegree[m.index()] == 0 {
                    ready.push(Reverse(m.index()));
                }
            }
        }
        Ok(sorted)
    }
}
