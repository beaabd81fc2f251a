//! Cluster-level passes. Each takes the cluster list by value and returns
//! the rewritten list.

use crate::clusters::{AsyncKind, Cluster, Interval, IterationSpace, Properties, Scope};
use crate::pipeline::PassContext;
use crate::registry::SymbolRegistry;
use crate::streaming::{fits, memcpy_key, task_key};
use crate::symbolics::{
    DimKind, Dimension, Equation, Expr, Function, FunctionKind, Substitution, Symbol,
};
use indexmap::{IndexMap, IndexSet};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Reorders clusters along their dependence DAG so that clusters with the
/// same loop nest become adjacent, then fuses.
pub fn topofuse(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let n = clusters.len();
    let scopes: Vec<Scope> = clusters.iter().map(Cluster::scope).collect();

    // 1. Граф зависимостей между кластерами
    let mut dag: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..n).map(|i| dag.add_node(i)).collect();
    for i in 0..n {
        for j in i + 1..n {
            if scopes[i].conflicts(&scopes[j]) {
                dag.add_edge(nodes[i], nodes[j], ());
            }
        }
    }

    // 2. Kahn: among the ready clusters prefer one fusible with the last
    // scheduled, else the earliest
    let mut indegree: Vec<usize> = nodes
        .iter()
        .map(|&node| dag.neighbors_directed(node, Direction::Incoming).count())
        .collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    while !ready.is_empty() {
        let pick = order
            .last()
            .and_then(|&last| {
                ready.iter().position(|&i| clusters[i].is_fusible_with(&clusters[last]))
            })
            .unwrap_or(0);
        let i = ready.remove(pick);
        order.push(i);
        for next in dag.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = dag[next];
            indegree[j] -= 1;
            if indegree[j] == 0 {
                let pos = ready.partition_point(|&k| k < j);
                ready.insert(pos, j);
            }
        }
    }
    trace!(?order, "topological order");

    // 3. Перестановка и слияние
    let mut slots: Vec<Option<Cluster>> = clusters.into_iter().map(Some).collect();
    let ordered: Vec<Cluster> = order.iter().filter_map(|&i| slots[i].take()).collect();
    fuse(ordered, ctx, sregistry)
}

/// Merges adjacent clusters with identical loop nests, unless merging would
/// serialize a loop that was parallel in either of them.
pub fn fuse(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let before = clusters.len();
    let mut out: Vec<Cluster> = Vec::with_capacity(before);
    for c in clusters {
        if let Some(prev) = out.last_mut() {
            let tasks = matches!(c.properties.async_kind, Some(AsyncKind::Task(_)));
            if prev.is_fusible_with(&c) && (!tasks || ctx.options.fuse_tasks) {
                let mut exprs = prev.exprs.clone();
                exprs.extend(c.exprs.iter().cloned());
                let mut fused = prev.rebuild(exprs);
                let allowed: IndexSet<Dimension> = prev
                    .properties
                    .sequential
                    .union(&c.properties.sequential)
                    .cloned()
                    .collect();
                if fused.properties.sequential.is_subset(&allowed) {
                    fused.properties.buffered.extend(c.properties.buffered.iter().cloned());
                    *prev = fused;
                    continue;
                }
            }
        }
        out.push(c);
    }
    debug!(before, after = out.len(), "fuse");
    Ok(out)
}

fn expr_scope(eq: &Equation) -> (Scope, Option<Symbol>, Vec<Symbol>) {
    let scope = Scope { reads: eq.reads(), writes: eq.write().cloned().into_iter().collect() };
    let temp = match &eq.lhs {
        Expr::Sym(s) => Some(s.clone()),
        _ => None,
    };
    (scope, temp, eq.rhs.symbols())
}

/// Splits clusters carrying a dependence along a space loop into
/// independent groups of equations, so that groups free of it regain
/// their parallelism.
pub fn fission(
    clusters: Vec<Cluster>,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let mut out = Vec::with_capacity(clusters.len());
    for c in clusters {
        let carried = c.properties.sequential.iter().any(|d| !d.is_time());
        if c.exprs.len() < 2 || !carried || c.properties.async_kind.is_some() {
            out.push(c);
            continue;
        }
        let n = c.exprs.len();
        let scopes: Vec<_> = c.exprs.iter().map(expr_scope).collect();
        let mut groups = UnionFind::<usize>::new(n);
        for i in 0..n {
            for j in i + 1..n {
                let (si, ti, ri) = &scopes[i];
                let (sj, tj, rj) = &scopes[j];
                let scalar = ti.as_ref().is_some_and(|t| rj.contains(t))
                    || tj.as_ref().is_some_and(|t| ri.contains(t));
                if scalar || si.conflicts(sj) || sj.conflicts(si) {
                    groups.union(i, j);
                }
            }
        }
        let mut parts: IndexMap<usize, Vec<Equation>> = IndexMap::new();
        for (i, eq) in c.exprs.iter().enumerate() {
            parts.entry(groups.find(i)).or_default().push(eq.clone());
        }
        if parts.len() == 1 {
            out.push(c);
            continue;
        }
        debug!(cluster = %c, parts = parts.len(), "fission");
        out.extend(parts.into_values().map(|exprs| c.rebuild(exprs)));
    }
    Ok(out)
}

/// Hoists clusters computing loop-invariant temporaries out of the loops
/// they do not depend on. Lifted clusters run first.
pub fn lift(
    clusters: Vec<Cluster>,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let mut writers: HashMap<Function, usize> = HashMap::new();
    for c in &clusters {
        for f in c.scope().writes {
            *writers.entry(f).or_default() += 1;
        }
    }
    let mut lifted = Vec::new();
    let mut rest = Vec::with_capacity(clusters.len());
    for c in clusters {
        let scope = c.scope();
        let invariant = c.guards.is_empty()
            && c.properties.async_kind.is_none()
            && !scope.writes.is_empty()
            && scope.writes.iter().all(|f| f.is_array() && writers.get(f) == Some(&1))
            && scope.reads.iter().all(|f| !writers.contains_key(f));
        if !invariant {
            rest.push(c);
            continue;
        }
        let used: IndexSet<Dimension> = c.exprs.iter().flat_map(Equation::dimensions).collect();
        let ispace = c.ispace.project(|i| used.iter().any(|d| i.defines(d)));
        if ispace.len() == c.ispace.len() {
            rest.push(c);
            continue;
        }
        debug!(cluster = %c, from = c.ispace.len(), to = ispace.len(), "lift");
        lifted.push(Cluster::new(c.exprs.clone(), ispace, c.guards.clone()));
    }
    lifted.extend(rest);
    Ok(lifted)
}

/// Block (tile) dimensions over `d`, outermost first. Each tile iterates
/// within the tile enclosing it.
fn make_blocks(d: &Dimension, levels: usize, sregistry: &mut SymbolRegistry) -> Vec<Dimension> {
    let base = format!("{}_blk", d.name());
    let names: Vec<String> = (0..levels).map(|_| sregistry.make_name(&base)).collect();
    let mut parent = d.clone();
    let mut chain = Vec::with_capacity(levels);
    for name in names.iter().rev() {
        let size = format!("{name}_size");
        sregistry.reserve(&size);
        let block = Dimension::block(name, &parent, Symbol::new(size));
        parent = block.clone();
        chain.push(block);
    }
    chain.reverse();
    chain
}

/// Tiles the parallel space loops of every cluster, `blocklevels` deep.
pub fn blocking(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let levels = ctx.options.blocklevels;
    if levels == 0 {
        return Ok(clusters);
    }
    let mut tiles: HashMap<Dimension, Vec<Dimension>> = HashMap::new();
    let mut out = Vec::with_capacity(clusters.len());
    for c in clusters {
        let intervals = c.ispace.intervals();
        let innermost = intervals.len().saturating_sub(1);
        let candidates: Vec<usize> = (0..intervals.len())
            .filter(|&pos| {
                let d = &intervals[pos].dim;
                c.is_parallel(d)
                    && !d.is_time()
                    && !d.is_block()
                    && (ctx.options.blockrelax || !matches!(d.kind(), DimKind::MultiSub { .. }))
                    && (ctx.options.blockinner || pos != innermost)
            })
            .collect();
        if c.properties.blocked || candidates.is_empty() {
            out.push(c);
            continue;
        }

        let mut blocks: Vec<Vec<Dimension>> = Vec::with_capacity(candidates.len());
        for &pos in &candidates {
            let d = &intervals[pos].dim;
            let chain = tiles.entry(d.clone()).or_insert_with(|| make_blocks(d, levels, sregistry));
            blocks.push(chain.clone());
        }
        // Level-major: all outermost tiles first
        let at = candidates[0];
        let mut nest: Vec<Interval> = intervals[..at].to_vec();
        for level in 0..levels {
            nest.extend(blocks.iter().map(|chain| Interval::new(chain[level].clone())));
        }
        nest.extend(intervals[at..].iter().cloned());

        let rebuilt = Cluster::new(c.exprs.clone(), IterationSpace::new(nest), c.guards.clone());
        debug!(cluster = %c, tiled = candidates.len(), levels, "blocking");
        out.push(Cluster {
            properties: Properties {
                sequential: rebuilt.properties.sequential.clone(),
                blocked: true,
                ..c.properties.clone()
            },
            ..rebuilt
        });
    }
    Ok(out)
}

/// Symbol-like factors worth collecting: spacings and their powers.
fn coefficients(term: &Expr) -> IndexSet<Expr> {
    let is_coefficient = |e: &Expr| match e {
        Expr::Sym(_) => true,
        Expr::Pow(base, _) => matches!(**base, Expr::Sym(_)),
        _ => false,
    };
    match term {
        Expr::Mul(factors) => factors.iter().filter(|f| is_coefficient(f)).cloned().collect(),
        other if is_coefficient(other) => [other.clone()].into_iter().collect(),
        _ => IndexSet::new(),
    }
}

fn remove_factor(term: &Expr, factor: &Expr) -> Expr {
    match term {
        Expr::Mul(factors) => {
            let mut factors = factors.clone();
            if let Some(pos) = factors.iter().position(|f| f == factor) {
                factors.remove(pos);
            }
            Expr::mul(factors)
        }
        other if other == factor => Expr::Int(1),
        other => other.clone(),
    }
}

fn factorize_sum(terms: Vec<Expr>) -> Expr {
    let mut counts: IndexMap<Expr, usize> = IndexMap::new();
    for term in &terms {
        for factor in coefficients(term) {
            *counts.entry(factor).or_default() += 1;
        }
    }
    let best = counts
        .into_iter()
        .filter(|(_, n)| *n >= 2)
        .reduce(|best, next| if next.1 > best.1 { next } else { best });
    let Some((factor, _)) = best else {
        return Expr::add(terms);
    };
    let (with, mut rest): (Vec<Expr>, Vec<Expr>) =
        terms.into_iter().partition(|t| coefficients(t).contains(&factor));
    let inner = factorize_sum(with.iter().map(|t| remove_factor(t, &factor)).collect());
    rest.push(Expr::mul([factor, inner]));
    factorize_sum(rest)
}

fn factorize_expr(expr: &Expr) -> Expr {
    match expr.map_children(factorize_expr) {
        Expr::Add(terms) => factorize_sum(terms),
        other => other,
    }
}

/// Collects common coefficients of sums: `a*h + b*h` becomes `h*(a + b)`.
pub fn factorize(
    clusters: Vec<Cluster>,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    Ok(clusters
        .into_iter()
        .map(|c| {
            let exprs = c
                .exprs
                .iter()
                .map(|eq| Equation { rhs: factorize_expr(&eq.rhs), ..eq.clone() })
                .collect();
            c.rebuild(exprs)
        })
        .collect())
}

fn expand_pows(expr: &Expr) -> Expr {
    let expr = expr.map_children(expand_pows);
    if let Expr::Pow(base, exp) = &expr {
        if let Some(n @ 2..=4) = exp.as_int() {
            return Expr::mul(std::iter::repeat_n(base.as_ref().clone(), n as usize));
        }
    }
    expr
}

/// Small positive integer powers become products.
pub fn opt_pows(
    clusters: Vec<Cluster>,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    Ok(clusters
        .into_iter()
        .map(|c| {
            let exprs = c
                .exprs
                .iter()
                .map(|eq| Equation { rhs: expand_pows(&eq.rhs), ..eq.clone() })
                .collect();
            c.rebuild(exprs)
        })
        .collect())
}

fn eliminate(c: Cluster, min_cost: usize, sregistry: &mut SymbolRegistry) -> Cluster {
    let written: IndexSet<Function> = c.scope().writes.into_iter().collect();
    let is_candidate = |e: &Expr| {
        matches!(e, Expr::Add(_) | Expr::Mul(_) | Expr::Pow(..))
            && e.op_count() >= min_cost.max(1)
            && e.functions().iter().all(|f| !written.contains(f))
    };
    let mut temps: Vec<Equation> = Vec::new();
    let mut exprs = c.exprs.clone();
    loop {
        let mut counts: IndexMap<Expr, usize> = IndexMap::new();
        for eq in temps.iter().chain(&exprs) {
            eq.rhs.visit(&mut |e| {
                if is_candidate(e) {
                    *counts.entry(e.clone()).or_default() += 1;
                }
                // index arithmetic stays inline
                !matches!(e, Expr::Indexed(_))
            });
        }
        let best = counts
            .into_iter()
            .filter(|(_, n)| *n >= 2)
            .reduce(|best, next| if next.0.op_count() > best.0.op_count() { next } else { best });
        let Some((target, _)) = best else {
            break;
        };
        let temp = Symbol::new(sregistry.make_name("r"));
        trace!(temp = %temp, expr = %target, "cse");
        let mut subs = Substitution::new();
        subs.insert(target.clone(), temp.expr());
        for eq in temps.iter_mut().chain(exprs.iter_mut()) {
            eq.rhs = subs.apply(&eq.rhs);
        }
        // after every temporary it depends on
        let used = target.symbols();
        let pos = temps
            .iter()
            .rposition(|t| matches!(&t.lhs, Expr::Sym(s) if used.contains(s)))
            .map_or(0, |p| p + 1);
        temps.insert(pos, Equation::new(temp.expr(), target));
    }
    if temps.is_empty() {
        return c;
    }
    debug!(cluster = %c, temps = temps.len(), "cse");
    temps.extend(exprs);
    c.rebuild(temps)
}

/// Common sub-expression elimination into scalar temporaries `r0, r1, ...`.
/// Sub-expressions reading a function the cluster writes are left alone.
pub fn cse(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let min_cost = ctx.options.cse_min_cost;
    Ok(clusters.into_iter().map(|c| eliminate(c, min_cost, sregistry)).collect())
}

/// The loop variable through which `d` is iterated: `d` itself when it rides
/// along a loop as a sub-iterator.
fn loop_index(ispace: &IterationSpace, d: &Dimension) -> Option<Dimension> {
    let interval = ispace.intervals().iter().find(|i| i.defines(d))?;
    if interval.sub_iterators.contains(d) {
        Some(d.clone())
    } else {
        Some(interval.dim.clone())
    }
}

fn make_buffer(f: &Function, sregistry: &mut SymbolRegistry) -> Function {
    let name = sregistry.make_name(&format!("{}b", f.name()));
    let mut data = Function::array(&name, f.dimensions().to_vec()).data().clone();
    data.kind = FunctionKind::Array { initvalue: None, origin: Some(f.clone()) };
    data.halo = f.halo().to_vec();
    data.padding = f.padding().to_vec();
    Function::from_data(data)
}

/// Reads of host-resident functions go through device buffers, filled by a
/// copy cluster placed right before the reader.
pub fn buffering(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    let mut buffers: IndexMap<Function, Function> = IndexMap::new();
    let mut out = Vec::with_capacity(clusters.len());
    for c in clusters {
        let scope = c.scope();
        let mut subs = Substitution::new();
        let mut copies = Vec::new();
        let mut buffered = Vec::new();
        for f in &scope.reads {
            if f.is_tensor() || fits(f, &ctx.options.gpu_fit) || scope.writes.contains(f) {
                continue;
            }
            let Some(indices) = f
                .dimensions()
                .iter()
                .enumerate()
                .map(|(pos, d)| {
                    loop_index(&c.ispace, d).map(|i| i.expr() + f.left_nodomain(pos) as i64)
                })
                .collect::<Option<Vec<Expr>>>()
            else {
                continue;
            };
            let buffer =
                buffers.entry(f.clone()).or_insert_with(|| make_buffer(f, sregistry)).clone();
            copies.push(Equation::new(buffer.at(indices.clone()), f.at(indices)));
            subs.insert_function(f.clone(), buffer);
            buffered.push(f.clone());
        }
        if copies.is_empty() {
            out.push(c);
            continue;
        }
        debug!(cluster = %c, buffered = buffered.len(), "buffering");
        out.push(Cluster::new(copies, c.ispace.clone(), c.guards.clone()));
        let mut reader = c.rebuild(c.exprs.iter().map(|eq| eq.apply(&subs)).collect());
        reader.properties.buffered.extend(buffered);
        out.push(reader);
    }
    Ok(out)
}

/// Clusters writing host-resident functions become asynchronous tasks.
pub fn tasking(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    clusters
        .into_iter()
        .map(|mut c| -> anyhow::Result<Cluster> {
            if let Some(d) = task_key(&c, &ctx.options.gpu_fit)? {
                debug!(cluster = %c, key = %d, "task");
                c.properties.async_kind = Some(AsyncKind::Task(d));
            }
            Ok(c)
        })
        .collect()
}

/// Clusters reading host-resident functions get their data copied in
/// asynchronously.
pub fn streaming(
    clusters: Vec<Cluster>,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Vec<Cluster>> {
    clusters
        .into_iter()
        .map(|mut c| -> anyhow::Result<Cluster> {
            if c.properties.async_kind.is_none() {
                if let Some(d) = memcpy_key(&c, &ctx.options.gpu_fit)? {
                    debug!(cluster = %c, key = %d, "memcpy");
                    c.properties.async_kind = Some(AsyncKind::Memcpy(d));
                }
            }
            Ok(c)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::clusterize;
    use crate::operator::OptLevel;
    use crate::options::RawOptions;
    use crate::target::OpenAcc;

    fn context(raw: RawOptions) -> PassContext {
        PassContext::new(raw, &OptLevel::Adv, Box::new(OpenAcc)).unwrap()
    }

    struct Grid {
        time: Dimension,
        t: Dimension,
        x: Dimension,
        y: Dimension,
    }

    fn grid() -> Grid {
        let time = Dimension::time("time");
        let t = Dimension::stepping("t", &time);
        Grid { time, t, x: Dimension::space("x"), y: Dimension::space("y") }
    }

    #[test]
    fn topofuse_brings_fusible_clusters_together() {
        let g = grid();
        let a = Function::dense("a", vec![g.x.clone()], 0);
        let b = Function::dense("b", vec![g.x.clone(), g.y.clone()], 0);
        let c = Function::dense("c", vec![g.x.clone()], 0);
        let eqs = vec![
            Equation::new(a.at([g.x.expr()]), Expr::Int(1)),
            Equation::new(b.at([g.x.expr(), g.y.expr()]), Expr::Int(2)),
            Equation::new(c.at([g.x.expr()]), a.at([g.x.expr()])),
        ];
        let ctx = context(RawOptions::new());
        let out = topofuse(clusterize(&eqs).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].exprs.len(), 2);
        assert_eq!(out[0].exprs[1].write(), Some(&c));
        assert_eq!(out[1].exprs[0].write(), Some(&b));
    }

    #[test]
    fn fuse_refuses_to_serialize_a_parallel_loop() {
        let g = grid();
        let a = Function::dense("a", vec![g.x.clone()], 1);
        let b = Function::dense("b", vec![g.x.clone()], 1);
        let eqs = vec![
            Equation::new(a.at([g.x.expr()]), Expr::Int(1)),
            Equation::new(b.at([g.x.expr()]), a.at([g.x.expr() + 1])),
        ];
        let ctx = context(RawOptions::new());
        let out = fuse(clusterize(&eqs).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.len(), 2);

        let eqs = vec![
            Equation::new(a.at([g.x.expr()]), Expr::Int(1)),
            Equation::new(b.at([g.x.expr()]), a.at([g.x.expr()])),
        ];
        let out = fuse(clusterize(&eqs).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_parallel(&g.x));
    }

    #[test]
    fn fission_separates_independent_equations() {
        let g = grid();
        let f = Function::dense("f", vec![g.x.clone()], 1);
        let h = Function::dense("h", vec![g.x.clone()], 1);
        let k = Function::dense("k", vec![g.x.clone()], 1);
        let eqs = vec![
            Equation::new(f.at([g.x.expr()]), f.at([g.x.expr() - 1])),
            Equation::new(h.at([g.x.expr()]), k.at([g.x.expr()])),
        ];
        let mut merged = clusterize(&eqs).unwrap().remove(0);
        merged = merged.rebuild(eqs.clone());
        assert!(!merged.is_parallel(&g.x));
        let ctx = context(RawOptions::new());
        let out = fission(vec![merged], &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out[0].is_parallel(&g.x));
        assert!(out[1].is_parallel(&g.x));
    }

    #[test]
    fn lift_hoists_invariant_temporaries() {
        let g = grid();
        let m = Function::dense("m", vec![g.x.clone()], 0);
        let a = Function::array("a", vec![g.x.clone()]);
        let eq = Equation::new(a.at([g.x.expr()]), m.at([g.x.expr()]) * 2)
            .with_implicit_dims(vec![g.time.clone()]);
        let clusters = clusterize(&[eq]).unwrap();
        assert_eq!(clusters[0].ispace.len(), 2);
        let ctx = context(RawOptions::new());
        let out = lift(clusters, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out[0].ispace.dimensions(), vec![g.x.clone()]);
    }

    #[test]
    fn blocking_tiles_parallel_space_loops() {
        let g = grid();
        let u = Function::time_dense("u", vec![g.t.clone(), g.x.clone(), g.y.clone()], 1);
        let eq = Equation::new(
            u.at([g.t.expr() + 1, g.x.expr(), g.y.expr()]),
            u.at([g.t.expr(), g.x.expr() + 1, g.y.expr()]),
        );
        let clusters = clusterize(&[eq]).unwrap();
        let mut sregistry = SymbolRegistry::new();

        let ctx = context(RawOptions::new());
        assert_eq!(blocking(clusters.clone(), &ctx, &mut sregistry).unwrap(), clusters);

        let ctx = context(RawOptions::new().with("blocklevels", 1).with("blockinner", false));
        let out = blocking(clusters, &ctx, &mut sregistry).unwrap();
        let names: Vec<String> =
            out[0].ispace.dimensions().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["time", "x_blk0", "x", "y"]);
        assert!(out[0].properties.blocked);
        assert!(out[0].is_parallel(&out[0].ispace.dimensions()[1]));
        assert!(sregistry.is_taken("x_blk0_size"));
    }

    #[test]
    fn hierarchical_blocks_nest_inside_each_other() {
        let g = grid();
        let f = Function::dense("f", vec![g.x.clone()], 0);
        let eq = Equation::new(f.at([g.x.expr()]), Expr::Int(0));
        let ctx = context(RawOptions::new().with("blocklevels", 2));
        let out = blocking(clusterize(&[eq]).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        let dims = out[0].ispace.dimensions();
        assert_eq!(dims.len(), 3);
        assert_eq!(dims[0].name(), "x_blk0");
        assert_eq!(dims[0].parent(), Some(&dims[1]));
        assert_eq!(dims[1].parent(), Some(&g.x));
    }

    #[test]
    fn factorize_collects_shared_coefficients() {
        let g = grid();
        let u = Function::dense("u", vec![g.x.clone()], 1);
        let v = Function::dense("v", vec![g.x.clone()], 1);
        let h = Symbol::new("h_x").expr();
        let rhs = u.at([g.x.expr()]) * h.clone() + v.at([g.x.expr()]) * h.clone() + 3;
        let eq = Equation::new(Function::dense("w", vec![g.x.clone()], 1).at([g.x.expr()]), rhs);
        let ctx = context(RawOptions::new());
        let out = factorize(clusterize(&[eq]).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out[0].exprs[0].rhs, h * (u.at([g.x.expr()]) + v.at([g.x.expr()])) + 3);
    }

    #[test]
    fn small_powers_become_products() {
        let x = Symbol::new("a").expr();
        assert_eq!(
            expand_pows(&Expr::pow(x.clone(), Expr::Int(3))),
            Expr::Mul(vec![x.clone(), x.clone(), x.clone()])
        );
        let inverse = Expr::pow(x.clone(), Expr::Int(-2));
        assert_eq!(expand_pows(&inverse), inverse);
    }

    #[test]
    fn cse_introduces_shared_temporaries() {
        let g = grid();
        let m = Function::dense("m", vec![g.x.clone()], 0);
        let f = Function::dense("f", vec![g.x.clone()], 0);
        let k = Function::dense("k", vec![g.x.clone()], 0);
        let common = m.at([g.x.expr()]) * Symbol::new("dt").expr();
        let eqs = vec![
            Equation::new(f.at([g.x.expr()]), common.clone() + 1),
            Equation::new(k.at([g.x.expr()]), Expr::pow(common.clone(), Expr::Int(2))),
        ];
        let cluster = clusterize(&eqs).unwrap()[0].rebuild(eqs.clone());
        let ctx = context(RawOptions::new());
        let out = cse(vec![cluster], &ctx, &mut SymbolRegistry::new()).unwrap();
        let exprs = &out[0].exprs;
        assert_eq!(exprs.len(), 3);
        assert_eq!(exprs[0], Equation::new(Symbol::new("r0").expr(), common));
        assert_eq!(exprs[1].rhs, Symbol::new("r0").expr() + 1);
    }

    #[test]
    fn buffering_reads_host_data_through_a_copy() {
        let g = grid();
        let u = Function::time_dense("u", vec![g.t.clone(), g.x.clone()], 1);
        let f = Function::dense("f", vec![g.x.clone()], 1);
        let eq = Equation::new(f.at([g.x.expr() + 1]), u.at([g.t.expr(), g.x.expr() + 2]))
            .with_implicit_dims(vec![g.t.clone()]);
        let mut raw = RawOptions::new();
        raw.set("gpu-fit", crate::options::OptionValue::Null);
        let ctx = context(raw);
        let out = buffering(clusterize(&[eq]).unwrap(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].exprs[0].to_string(), "ub0[t, x + 1] = u[t, x + 1]");
        assert_eq!(out[1].exprs[0].reads()[0].name(), "ub0");
        assert_eq!(out[1].properties.buffered, vec![u]);
    }

    #[test]
    fn tasking_and_streaming_mark_async_regions() {
        let g = grid();
        let u = Function::time_dense("u", vec![g.t.clone(), g.x.clone()], 1);
        let f = Function::dense("f", vec![g.x.clone()], 1);
        let eqs = vec![
            Equation::new(u.at([g.t.expr() + 1, g.x.expr()]), u.at([g.t.expr(), g.x.expr()])),
            Equation::new(f.at([g.x.expr()]), u.at([g.t.expr(), g.x.expr()]))
                .with_implicit_dims(vec![g.t.clone()]),
        ];
        let ctx = PassContext::new(
            RawOptions::new(),
            &OptLevel::Custom(vec!["tasking".into(), "streaming".into()]),
            Box::new(OpenAcc),
        )
        .unwrap();
        let mut sregistry = SymbolRegistry::new();
        let out = tasking(clusterize(&eqs).unwrap(), &ctx, &mut sregistry).unwrap();
        let out = streaming(out, &ctx, &mut sregistry).unwrap();
        assert_eq!(out[0].properties.async_kind, Some(AsyncKind::Task(g.time.clone())));
        assert_eq!(out[1].properties.async_kind, Some(AsyncKind::Memcpy(g.time.clone())));
    }

    #[test]
    fn tasks_never_stream_across_clusters() {
        let g = grid();
        let u = Function::time_dense("u", vec![g.t.clone(), g.x.clone()], 1);
        let v = Function::time_dense("v", vec![g.t.clone(), g.x.clone()], 1);
        let f = Function::dense("f", vec![g.x.clone()], 1);
        let eqs = vec![
            Equation::new(u.at([g.t.expr() + 1, g.x.expr()]), u.at([g.t.expr(), g.x.expr()]) + 1),
            Equation::new(f.at([g.x.expr()]), u.at([g.t.expr(), g.x.expr()]))
                .with_implicit_dims(vec![g.t.clone()]),
            Equation::new(
                v.at([g.t.expr() + 1, g.x.expr()]),
                f.at([g.x.expr()]) + u.at([g.t.expr() + 1, g.x.expr()]),
            ),
        ];
        let ctx = PassContext::new(
            RawOptions::new(),
            &OptLevel::Custom(vec!["tasking".into(), "streaming".into()]),
            Box::new(OpenAcc),
        )
        .unwrap();
        let mut sregistry = SymbolRegistry::new();
        let clusters = clusterize(&eqs).unwrap();
        let out = tasking(clusters.clone(), &ctx, &mut sregistry).unwrap();
        let out = streaming(out, &ctx, &mut sregistry).unwrap();
        assert_eq!(out.len(), 3);
        for (before, after) in clusters.iter().zip(&out) {
            let task = task_key(before, &ctx.options.gpu_fit).unwrap();
            if task.is_some() {
                assert_eq!(memcpy_key(before, &ctx.options.gpu_fit).unwrap(), None);
                assert!(matches!(after.properties.async_kind, Some(AsyncKind::Task(_))));
            }
        }
        assert!(matches!(out[1].properties.async_kind, Some(AsyncKind::Memcpy(_))));
        assert!(matches!(out[2].properties.async_kind, Some(AsyncKind::Task(_))));
    }
}
