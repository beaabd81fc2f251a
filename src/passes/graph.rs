//! Passes over the final program graph.

use crate::iet::{self, Declaration, Graph, Node};
use crate::options::{ErrCtl, MpiMode};
use crate::pipeline::PassContext;
use crate::registry::SymbolRegistry;
use crate::symbolics::{Expr, Function, Indexed, Symbol};
use indexmap::IndexSet;
use tracing::debug;

fn halo_reads(nodes: &[Node]) -> IndexSet<Function> {
    let mut found = IndexSet::new();
    iet::walk(nodes, &mut |n| {
        if let Node::Expression(eq) = n {
            found.extend(
                eq.reads()
                    .into_iter()
                    .filter(|f| !f.is_array() && f.halo().iter().any(|&(l, r)| l > 0 || r > 0)),
            );
        }
    });
    found
}

fn place_halos(
    nodes: Vec<Node>,
    written: &IndexSet<Function>,
    hoist: bool,
    hoisted: &mut IndexSet<Function>,
) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        let space_nest = matches!(&node, Node::Iteration(it) if !it.dim.is_time());
        if !space_nest {
            if let Some(body) = node.body_mut() {
                let inner = std::mem::take(body);
                *body = place_halos(inner, written, hoist, hoisted);
            }
            out.push(node);
            continue;
        }
        let mut exchanged: Vec<Function> =
            halo_reads(std::slice::from_ref(&node)).into_iter().collect();
        if hoist {
            // Never written: one exchange up front is enough
            let (once, every): (Vec<Function>, Vec<Function>) =
                exchanged.into_iter().partition(|f| !written.contains(f));
            hoisted.extend(once);
            exchanged = every;
        }
        if exchanged.is_empty() {
            out.push(node);
        } else {
            out.push(Node::HaloSpot { functions: exchanged, body: vec![node] });
        }
    }
    out
}

/// Halo exchanges ahead of every space loop nest reading functions with a
/// halo. In full mode with `opt-comms` and `dist-drop-unwritten`, exchanges
/// of read-only functions are hoisted out of the time loop.
pub fn mpi(
    mut graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    if !ctx.options.mpi.is_enabled() {
        return Ok(graph);
    }
    let hoist = ctx.options.mpi == MpiMode::Full
        && ctx.options.opt_comms
        && ctx.options.dist_drop_unwritten;
    let written = graph.writes();
    let mut hoisted = IndexSet::new();
    graph.body = place_halos(std::mem::take(&mut graph.body), &written, hoist, &mut hoisted);
    if !hoisted.is_empty() {
        debug!(hoisted = hoisted.len(), "halo exchanges hoisted");
        let functions = hoisted.into_iter().collect();
        graph.init.push(Node::HaloSpot { functions, body: Vec::new() });
    }
    Ok(graph)
}

/// Clamps loops iterating within a tile to the end of the domain, so that
/// tiles need not divide it.
pub fn relax(
    mut graph: Graph,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    let mut relaxed = 0;
    iet::walk_mut(&mut graph.body, &mut |node| {
        if let Node::Iteration(it) = node {
            if matches!(&it.lower, Expr::Dim(b) if b.is_block()) {
                it.limit = Some(it.dim.symbolic_max());
                relaxed += 1;
            }
        }
    });
    debug!(relaxed, "relax");
    Ok(graph)
}

pub fn parallel(
    graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    ctx.target.make_parallel(graph, ctx)
}

pub fn init(
    graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    ctx.target.initialize(graph, ctx)
}

pub fn data(
    graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    ctx.target.manage_data(graph, ctx)
}

pub fn orchestrate(
    graph: Graph,
    ctx: &PassContext,
    sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    ctx.target.orchestrate(graph, ctx, sregistry)
}

/// Async regions run on host threads rather than device queues.
pub fn pthreadify(
    mut graph: Graph,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    iet::walk_mut(&mut graph.body, &mut |node| {
        if let Node::Region { threaded, .. } = node {
            *threaded = true;
        }
    });
    Ok(graph)
}

fn hoist_prodders(nodes: Vec<Node>, in_parallel: bool, lifted: &mut Vec<Node>) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        let periodic = matches!(&node, Node::Prodder { periodic: true, .. });
        if periodic && in_parallel {
            if !lifted.contains(&node) {
                lifted.push(node);
            }
            continue;
        }
        match &mut node {
            Node::Iteration(it) if !in_parallel && !it.parallel => {
                let mut own = Vec::new();
                it.body = hoist_prodders(std::mem::take(&mut it.body), false, &mut own);
                it.body.extend(own);
            }
            Node::Iteration(it) => {
                it.body = hoist_prodders(std::mem::take(&mut it.body), true, lifted);
            }
            other => {
                if let Some(body) = other.body_mut() {
                    let inner = std::mem::take(body);
                    *body = hoist_prodders(inner, in_parallel, lifted);
                }
            }
        }
        out.push(node);
    }
    out
}

/// Periodic prodders nested in parallel loops move to the end of the
/// enclosing sequential loop body.
pub fn prodders(
    mut graph: Graph,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    let mut top = Vec::new();
    graph.body = hoist_prodders(std::mem::take(&mut graph.body), false, &mut top);
    graph.body.extend(top);
    Ok(graph)
}

fn writes_in(nodes: &[Node]) -> IndexSet<Function> {
    let mut found = IndexSet::new();
    iet::walk(nodes, &mut |n| {
        if let Node::Expression(eq) = n {
            found.extend(eq.write().cloned());
        }
    });
    found
}

/// Stability checks at the end of every time step.
pub fn stability(
    mut graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    let Some(level) = ctx.options.errctl else {
        return Ok(graph);
    };
    for node in graph.body.iter_mut() {
        let Node::Iteration(it) = node else {
            continue;
        };
        if !it.dim.is_time() {
            continue;
        }
        let functions: Vec<Function> = writes_in(&it.body)
            .into_iter()
            .filter(|f| level == ErrCtl::Max || !f.is_array())
            .collect();
        if !functions.is_empty() {
            it.body.push(Node::Check { functions });
        }
    }
    Ok(graph)
}

/// Declares scalar temporaries and lists the symbols the generated code
/// takes as arguments. Async regions nobody orchestrated run inline.
pub fn finalize(
    mut graph: Graph,
    _ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    // 0. Неоркестрованные async-регионы
    graph.body = iet::rewrite(std::mem::take(&mut graph.body), &mut |nodes| {
        nodes
            .into_iter()
            .flat_map(|node| match node {
                Node::Async { body, .. } => body,
                other => vec![other],
            })
            .collect()
    });

    // 1. Временные скаляры
    let mut temps: IndexSet<String> = IndexSet::new();
    for eq in graph.expressions() {
        if let Expr::Sym(s) = &eq.lhs {
            temps.insert(s.name().to_string());
        }
    }

    // 2. Параметры: функции, затем символы
    let mut params: IndexSet<String> = graph
        .functions()
        .iter()
        .filter(|f| !f.is_array())
        .map(|f| f.name().to_string())
        .collect();
    let mut symbols: Vec<Symbol> = Vec::new();
    iet::walk(&graph.body, &mut |n| match n {
        Node::Iteration(it) => {
            for e in [&it.lower, &it.upper, &it.step].into_iter().chain(it.limit.as_ref()) {
                symbols.extend(e.symbols());
            }
        }
        Node::Expression(eq) => {
            for side in eq.sides() {
                symbols.extend(side.symbols());
            }
        }
        Node::Guard { condition, .. } => symbols.extend(condition.symbols()),
        _ => {}
    });
    params.extend(symbols.iter().map(|s| s.name().to_string()).filter(|s| !temps.contains(s)));

    for name in temps {
        graph.declare(Declaration {
            name,
            ctype: "float".to_string(),
            shape: Vec::new(),
            on_device: false,
        });
    }
    for name in &params {
        graph.add_parameter(name);
    }
    Ok(graph)
}

fn flatten(expr: &Expr, strides: &mut IndexSet<Symbol>) -> Expr {
    match expr {
        Expr::Indexed(i) if i.indices.len() > 1 => {
            let last = i.indices.len() - 1;
            let mut terms = Vec::with_capacity(i.indices.len());
            for (k, index) in i.indices.iter().enumerate() {
                let index = flatten(index, strides);
                if k == last {
                    terms.push(index);
                } else {
                    let stride = Symbol::new(format!("{}_stride{k}", i.function.name()));
                    strides.insert(stride.clone());
                    terms.push(index * stride.expr());
                }
            }
            Expr::Indexed(Indexed { function: i.function.clone(), indices: vec![Expr::add(terms)] })
        }
        other => other.map_children(|c| flatten(c, strides)),
    }
}

/// Rewrites n-dimensional accesses into flat offsets over per-function
/// stride symbols.
pub fn linearize(
    mut graph: Graph,
    ctx: &PassContext,
    _sregistry: &mut SymbolRegistry,
) -> anyhow::Result<Graph> {
    if !ctx.options.linearize {
        return Ok(graph);
    }
    let mut strides: IndexSet<Symbol> = IndexSet::new();
    iet::walk_mut(&mut graph.body, &mut |node| {
        if let Node::Expression(eq) = node {
            *eq = eq.map(|side| flatten(side, &mut strides));
        }
    });
    let ctype = ctx.options.index_mode.ctype();
    for s in &strides {
        graph.declare(Declaration {
            name: s.name().to_string(),
            ctype: ctype.to_string(),
            shape: Vec::new(),
            on_device: false,
        });
    }
    graph.linearized = true;
    debug!(strides = strides.len(), "linearize");
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::{AsyncKind, clusterize};
    use crate::operator::OptLevel;
    use crate::options::RawOptions;
    use crate::symbolics::{Dimension, Equation};
    use crate::target::{OpenAcc, OpenMp};

    struct Heat {
        time: Dimension,
        graph: Graph,
        u: Function,
        m: Function,
    }

    fn heat() -> Heat {
        let time = Dimension::time("time");
        let t = Dimension::stepping("t", &time);
        let x = Dimension::space("x");
        let y = Dimension::space("y");
        let u = Function::time_dense("u", vec![t.clone(), x.clone(), y.clone()], 1);
        let m = Function::dense("m", vec![x.clone(), y.clone()], 1);
        let eq = Equation::new(
            u.at([t.expr() + 1, x.expr(), y.expr()]),
            u.at([t.expr(), x.expr() + 1, y.expr()]) * m.at([x.expr(), y.expr()]),
        );
        let graph = iet::build("kernel", &clusterize(&[eq]).unwrap());
        Heat { time, graph, u, m }
    }

    fn context(raw: RawOptions) -> PassContext {
        PassContext::new(raw, &OptLevel::Adv, Box::new(OpenAcc)).unwrap()
    }

    fn time_body(graph: &Graph) -> &[Node] {
        match &graph.body[0] {
            Node::Iteration(it) => &it.body,
            other => panic!("expected the time loop, got {other:?}"),
        }
    }

    #[test]
    fn mpi_is_a_noop_unless_enabled() {
        let h = heat();
        let ctx = context(RawOptions::new());
        let out = mpi(h.graph.clone(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out, h.graph);
    }

    #[test]
    fn basic_mpi_exchanges_before_each_space_nest() {
        let h = heat();
        let ctx = context(RawOptions::new().with("mpi", "basic"));
        let out = mpi(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        match &time_body(&out)[0] {
            Node::HaloSpot { functions, body } => {
                assert_eq!(functions, &vec![h.u.clone(), h.m.clone()]);
                assert!(matches!(body[0], Node::Iteration(_)));
            }
            other => panic!("expected a halo exchange, got {other:?}"),
        }
    }

    #[test]
    fn full_mpi_hoists_read_only_exchanges() {
        let h = heat();
        let ctx = context(RawOptions::new().with("mpi", true));
        let out = mpi(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        let up_front = Node::HaloSpot { functions: vec![h.m.clone()], body: Vec::new() };
        assert_eq!(out.init, vec![up_front]);
        assert!(matches!(
            &time_body(&out)[0],
            Node::HaloSpot { functions, .. } if functions == &vec![h.u.clone()]
        ));
    }

    #[test]
    fn read_only_exchanges_stay_when_unwritten_are_kept() {
        let h = heat();
        let ctx = context(RawOptions::new().with("mpi", true).with("dist-drop-unwritten", false));
        let out = mpi(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert!(out.init.is_empty());
        assert!(matches!(
            &time_body(&out)[0],
            Node::HaloSpot { functions, .. } if functions == &vec![h.u.clone(), h.m.clone()]
        ));
    }

    #[test]
    fn relax_clamps_loops_inside_tiles() {
        let x = Dimension::space("x");
        let b = Dimension::block("x_blk0", &x, Symbol::new("x_blk0_size"));
        let inner = iet::Iteration {
            dim: x.clone(),
            lower: b.expr(),
            upper: b.expr() + Symbol::new("x_blk0_size").expr() - 1,
            step: Expr::Int(1),
            limit: None,
            parallel: true,
            pragmas: Vec::new(),
            body: Vec::new(),
        };
        let graph = Graph { body: vec![Node::Iteration(inner)], ..Graph::default() };
        let out = relax(graph, &context(RawOptions::new()), &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.iterations()[0].limit, Some(x.symbolic_max()));
    }

    #[test]
    fn prodders_leave_parallel_loops() {
        let h = heat();
        let mut graph = h.graph;
        iet::walk_mut(&mut graph.body, &mut |node| {
            if let Node::Iteration(it) = node {
                if it.parallel && it.body.iter().all(|n| matches!(n, Node::Expression(_))) {
                    it.body.push(Node::Prodder { name: "q0_prefetch".to_string(), periodic: true });
                }
            }
        });
        let out = prodders(graph, &context(RawOptions::new()), &mut SymbolRegistry::new()).unwrap();
        let body = time_body(&out);
        assert!(matches!(body.last(), Some(Node::Prodder { name, .. }) if name == "q0_prefetch"));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn stability_checks_written_functions_per_time_step() {
        let h = heat();
        let ctx = context(RawOptions::new());
        let out = stability(h.graph.clone(), &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out, h.graph);

        let ctx = context(RawOptions::new().with("errctl", "basic"));
        let out = stability(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(time_body(&out).last(), Some(&Node::Check { functions: vec![h.u] }));
        assert!(matches!(&out.body[0], Node::Iteration(it) if it.dim == h.time));
    }

    #[test]
    fn finalize_lists_functions_then_symbols() {
        let h = heat();
        let ctx = context(RawOptions::new());
        let out = finalize(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(&out.parameters[..2], &["u".to_string(), "m".to_string()]);
        for bound in ["time_m", "time_M", "x_m", "x_M", "y_m", "y_M"] {
            assert!(out.parameters.contains(&bound.to_string()), "missing {bound}");
        }
        assert!(out.declarations.is_empty());
    }

    #[test]
    fn finalize_inlines_leftover_async_regions() {
        let h = heat();
        let mut graph = h.graph.clone();
        if let Node::Iteration(it) = &mut graph.body[0] {
            let body = std::mem::take(&mut it.body);
            it.body = vec![Node::Async { kind: AsyncKind::Task(h.time.clone()), body }];
        }
        let ctx = context(RawOptions::new());
        let out = finalize(graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        let expected = finalize(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert_eq!(out.body, expected.body);
    }

    #[test]
    fn linearize_flattens_accesses() {
        let h = heat();
        let ctx = PassContext::new(RawOptions::new(), &OptLevel::Adv, Box::new(OpenMp)).unwrap();
        let out = linearize(h.graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        assert!(out.linearized);
        let eq = out.expressions()[0].clone();
        match &eq.lhs {
            Expr::Indexed(i) => assert_eq!(i.indices.len(), 1),
            other => panic!("expected an access, got {other}"),
        }
        let names: Vec<&str> = out.declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["u_stride0", "u_stride1", "m_stride0"]);
        assert!(out.declarations.iter().all(|d| d.ctype == "int"));
    }

    #[test]
    fn pthreadify_moves_regions_to_threads() {
        let graph = Graph {
            body: vec![Node::Region { name: "q0".to_string(), threaded: false, body: Vec::new() }],
            ..Graph::default()
        };
        let ctx = context(RawOptions::new());
        let out = pthreadify(graph, &ctx, &mut SymbolRegistry::new()).unwrap();
        let region = Node::Region { name: "q0".to_string(), threaded: true, body: Vec::new() };
        assert_eq!(out.body[0], region);
    }
}
