//! Final program graph: loop nests annotated for device execution.

use crate::clusters::{AsyncKind, Cluster, Interval, IterationSpace};
use crate::symbolics::{DimKind, Dimension, Equation, Expr, Function};
use indexmap::IndexSet;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub dim: Dimension,
    pub lower: Expr,
    pub upper: Expr,
    pub step: Expr,
    /// Clamp on the upper bound: the loop runs up to `min(upper, limit)`.
    pub limit: Option<Expr>,
    pub parallel: bool,
    pub pragmas: Vec<String>,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Iteration(Iteration),
    Expression(Equation),
    Guard { condition: Expr, body: Vec<Node> },
    /// Halo exchange of `functions` ahead of `body`.
    HaloSpot { functions: Vec<Function>, body: Vec<Node> },
    /// Region yet to be orchestrated.
    Async { kind: AsyncKind, body: Vec<Node> },
    /// Orchestrated asynchronous region, on a device queue or a host thread.
    Region { name: String, threaded: bool, body: Vec<Node> },
    Pragma(String),
    Call { name: String, args: Vec<String> },
    /// Runtime progress hook.
    Prodder { name: String, periodic: bool },
    /// Numerical stability check over the given functions.
    Check { functions: Vec<Function> },
}

impl Node {
    pub fn body(&self) -> Option<&Vec<Node>> {
        match self {
            Node::Iteration(it) => Some(&it.body),
            Node::Guard { body, .. }
            | Node::HaloSpot { body, .. }
            | Node::Async { body, .. }
            | Node::Region { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::Iteration(it) => Some(&mut it.body),
            Node::Guard { body, .. }
            | Node::HaloSpot { body, .. }
            | Node::Async { body, .. }
            | Node::Region { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Pre-order traversal.
pub fn walk<'a>(nodes: &'a [Node], f: &mut impl FnMut(&'a Node)) {
    for node in nodes {
        f(node);
        if let Some(body) = node.body() {
            walk(body, f);
        }
    }
}

/// Pre-order traversal with mutable access.
pub fn walk_mut(nodes: &mut [Node], f: &mut impl FnMut(&mut Node)) {
    for node in nodes {
        f(node);
        if let Some(body) = node.body_mut() {
            walk_mut(body, f);
        }
    }
}

/// Rebuilds every node list bottom-up through `f`.
pub fn rewrite(nodes: Vec<Node>, f: &mut impl FnMut(Vec<Node>) -> Vec<Node>) -> Vec<Node> {
    let nodes = nodes
        .into_iter()
        .map(|mut node| {
            if let Some(body) = node.body_mut() {
                let inner = std::mem::take(body);
                *body = rewrite(inner, f);
            }
            node
        })
        .collect();
    f(nodes)
}

/// Symbol or array declared by the generated code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declaration {
    pub name: String,
    pub ctype: String,
    pub shape: Vec<String>,
    pub on_device: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    pub name: String,
    pub body: Vec<Node>,
    /// Runs once before `body`: device setup and data movement.
    pub init: Vec<Node>,
    /// Runs once after `body`.
    pub finalize: Vec<Node>,
    pub declarations: Vec<Declaration>,
    pub parameters: Vec<String>,
    pub linearized: bool,
}

impl Graph {
    pub fn iterations(&self) -> Vec<&Iteration> {
        let mut found = Vec::new();
        walk(&self.body, &mut |n| {
            if let Node::Iteration(it) = n {
                found.push(it);
            }
        });
        found
    }

    pub fn expressions(&self) -> Vec<&Equation> {
        let mut found = Vec::new();
        walk(&self.body, &mut |n| {
            if let Node::Expression(eq) = n {
                found.push(eq);
            }
        });
        found
    }

    /// Every function accessed by an expression, in order of appearance.
    pub fn functions(&self) -> Vec<Function> {
        let mut found: IndexSet<Function> = IndexSet::new();
        for eq in self.expressions() {
            found.extend(eq.functions());
        }
        found.into_iter().collect()
    }

    pub fn writes(&self) -> IndexSet<Function> {
        self.expressions().into_iter().filter_map(|eq| eq.write().cloned()).collect()
    }

    pub fn declare(&mut self, declaration: Declaration) {
        if !self.declarations.iter().any(|d| d.name == declaration.name) {
            self.declarations.push(declaration);
        }
    }

    pub fn add_parameter(&mut self, name: &str) {
        if !self.parameters.iter().any(|p| p == name) {
            self.parameters.push(name.to_string());
        }
    }
}

/// Loop bounds. A dimension tiled by an enclosing block (the block whose
/// parent it is) spans one tile of it; block loops step by their tile size.
fn bounds(interval: &Interval, ispace: &IterationSpace) -> (Expr, Expr, Expr) {
    let d = &interval.dim;
    let step = match d.kind() {
        DimKind::Block { step, .. } => step.expr(),
        _ => Expr::Int(1),
    };
    let tile = ispace.intervals().iter().find_map(|i| match i.dim.kind() {
        DimKind::Block { parent, step } if parent == d => Some((i.dim.clone(), step.clone())),
        _ => None,
    });
    match tile {
        Some((b, size)) => (b.expr(), b.expr() + size.expr() - 1, step),
        None => (d.symbolic_min(), d.symbolic_max(), step),
    }
}

fn iteration(cluster: &Cluster, interval: &Interval, body: Vec<Node>) -> Node {
    let (lower, upper, step) = bounds(interval, &cluster.ispace);
    Node::Iteration(Iteration {
        dim: interval.dim.clone(),
        lower,
        upper,
        step,
        limit: None,
        parallel: cluster.is_parallel(&interval.dim),
        pragmas: Vec::new(),
        body,
    })
}

fn leaf(cluster: &Cluster) -> Vec<Node> {
    let mut body: Vec<Node> = cluster.exprs.iter().cloned().map(Node::Expression).collect();
    if !cluster.guards.is_empty() {
        body = vec![Node::Guard {
            condition: Expr::and(cluster.guards.values().cloned()),
            body,
        }];
    }
    body
}

/// Loops of `cluster` from `level` inwards around its leaf. The body of the
/// loop an async region is keyed on becomes that region.
fn nest(cluster: &Cluster, level: usize) -> Vec<Node> {
    let mut body = leaf(cluster);
    for interval in cluster.ispace.intervals()[level..].iter().rev() {
        if let Some(kind) = &cluster.properties.async_kind {
            if kind.dim() == &interval.dim {
                body = vec![Node::Async { kind: kind.clone(), body }];
            }
        }
        body = vec![iteration(cluster, interval, body)];
    }
    body
}

fn insert(nodes: &mut Vec<Node>, cluster: &Cluster, level: usize, shared: usize) {
    if level < shared {
        if let Some(Node::Iteration(it)) = nodes.last_mut() {
            it.parallel &= cluster.is_parallel(&it.dim);
            insert(&mut it.body, cluster, level + 1, shared);
            return;
        }
    }
    let mut body = nest(cluster, level);
    // Entered through a shared loop the region is keyed on
    if let Some(kind) = &cluster.properties.async_kind {
        let keyed = level
            .checked_sub(1)
            .and_then(|pos| cluster.ispace.intervals().get(pos))
            .is_some_and(|i| &i.dim == kind.dim());
        if keyed {
            body = vec![Node::Async { kind: kind.clone(), body }];
        }
    }
    nodes.extend(body);
}

/// Number of outer loops two consecutive clusters share. Only sequential
/// loops are shared; each cluster gets its own parallel loops.
fn shared_depth(prev: &Cluster, next: &Cluster) -> usize {
    let mut depth = prev
        .ispace
        .intervals()
        .iter()
        .zip(next.ispace.intervals())
        .take_while(|(a, b)| a == b && !prev.is_parallel(&a.dim) && !next.is_parallel(&b.dim))
        .count();
    for c in [prev, next] {
        let scope = c.properties.async_kind.as_ref();
        if let Some(pos) = scope.and_then(|k| c.ispace.position(k.dim())) {
            depth = depth.min(pos + 1);
        }
    }
    depth
}

/// Schedules clusters into loop nests, sharing outer loops between
/// consecutive clusters where their iteration spaces agree.
pub fn build(name: &str, clusters: &[Cluster]) -> Graph {
    let mut body = Vec::new();
    let mut prev: Option<&Cluster> = None;
    for c in clusters {
        let shared = prev.map_or(0, |p| shared_depth(p, c));
        insert(&mut body, c, 0, shared);
        prev = Some(c);
    }
    let graph = Graph { name: name.to_string(), body, ..Graph::default() };
    debug!(nests = graph.body.len(), iterations = graph.iterations().len(), "graph built");
    graph
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}({})", self.name, self.parameters.join(", "))?;
        for d in &self.declarations {
            let shape: String = d.shape.iter().map(|s| format!("[{s}]")).collect();
            let device = if d.on_device { " (device)" } else { "" };
            writeln!(f, "  {} {}{shape};{device}", d.ctype, d.name)?;
        }
        for node in &self.init {
            write_node(f, node, 1)?;
        }
        for node in &self.body {
            write_node(f, node, 1)?;
        }
        for node in &self.finalize {
            write_node(f, node, 1)?;
        }
        Ok(())
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    let nested = |f: &mut fmt::Formatter<'_>, body: &[Node]| -> fmt::Result {
        for n in body {
            write_node(f, n, depth + 1)?;
        }
        Ok(())
    };
    match node {
        Node::Iteration(it) => {
            for p in &it.pragmas {
                writeln!(f, "{pad}#pragma {p}")?;
            }
            let upper = match &it.limit {
                Some(limit) => format!("min({}, {limit})", it.upper),
                None => it.upper.to_string(),
            };
            writeln!(f, "{pad}for {} in [{}, {upper}] step {}:", it.dim, it.lower, it.step)?;
            nested(f, &it.body)
        }
        Node::Expression(eq) => writeln!(f, "{pad}{eq};"),
        Node::Guard { condition, body } => {
            writeln!(f, "{pad}if ({condition}):")?;
            nested(f, body)
        }
        Node::HaloSpot { functions, body } => {
            let names: Vec<&str> = functions.iter().map(Function::name).collect();
            writeln!(f, "{pad}haloupdate({})", names.join(", "))?;
            nested(f, body)
        }
        Node::Async { kind, body } => {
            writeln!(f, "{pad}async {kind:?}:")?;
            nested(f, body)
        }
        Node::Region { name, threaded, body } => {
            let what = if *threaded { "thread" } else { "queue" };
            writeln!(f, "{pad}{what} {name}:")?;
            nested(f, body)
        }
        Node::Pragma(p) => writeln!(f, "{pad}#pragma {p}"),
        Node::Call { name, args } => writeln!(f, "{pad}{name}({});", args.join(", ")),
        Node::Prodder { name, .. } => writeln!(f, "{pad}{name}();"),
        Node::Check { functions } => {
            let names: Vec<&str> = functions.iter().map(Function::name).collect();
            writeln!(f, "{pad}check_stability({});", names.join(", "))
        }
    }
}
