//! Device backends. Exactly one target drives a compilation: it fills in its
//! option defaults, rejects what it cannot support, and lowers the final
//! graph onto its parallel/data/async programming model.

mod acc;
mod omp;

pub use acc::OpenAcc;
pub use omp::OpenMp;

use crate::clusters::AsyncKind;
use crate::error::Result;
use crate::iet::{self, Declaration, Graph, Iteration, Node};
use crate::options::{CompilerOptions, GpuFit, RawOptions};
use crate::pipeline::PassContext;
use crate::registry::SymbolRegistry;
use crate::streaming::fits;
use crate::symbolics::{DimKind, Function};
use indexmap::IndexSet;
use tracing::debug;

/// How a function enters or leaves device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    /// Allocate and copy host data in.
    CopyIn,
    /// Allocate without copying.
    Create,
    /// Copy back to the host and release.
    CopyOut,
    /// Release without copying back.
    Delete,
}

pub trait Target {
    /// Language marker, also the alias of the `parallel` pass in custom mode.
    fn name(&self) -> &'static str;

    /// Backend defaults, applied to the raw options before normalization.
    fn default_options(&self, _raw: &mut RawOptions) {}

    fn check_options(&self, _options: &CompilerOptions) -> Result<()> {
        Ok(())
    }

    fn loop_pragma(&self, collapse: usize, tiles: Option<&[usize]>, chunk: Option<usize>) -> String;
    fn device_init(&self) -> Vec<Node>;
    fn data_pragma(&self, f: &Function, movement: Movement) -> String;
    fn update_device(&self, f: &Function, queue: &str) -> String;
    fn wait(&self, queue: &str) -> String;

    /// Offloads the outermost parallel loop of every nest, collapsing the
    /// perfectly nested parallel loops below it. Nests touching functions
    /// that stay on the host run host-parallel, or sequentially when
    /// `par-disabled` is set.
    fn make_parallel(&self, mut graph: Graph, ctx: &PassContext) -> anyhow::Result<Graph> {
        let tiles = ctx.options.par_tile.tiles.as_deref();
        let mut offloaded = 0;
        let mut hosted = 0;
        parallelize(&mut graph.body, &mut |it| {
            let collapse = collapsible(it);
            if !touches_host(it, &ctx.options.gpu_fit) {
                let chunk = is_nonaffine(it).then_some(ctx.options.par_chunk_nonaffine);
                it.pragmas.push(self.loop_pragma(collapse, tiles, chunk));
                offloaded += 1;
            } else if !ctx.options.par_disabled {
                it.pragmas.push(host_pragma(collapse));
                hosted += 1;
            }
        });
        debug!(backend = self.name(), offloaded, hosted, "parallelized");
        Ok(graph)
    }

    /// Device setup, ahead of any data movement.
    fn initialize(&self, mut graph: Graph, _ctx: &PassContext) -> anyhow::Result<Graph> {
        let mut init = self.device_init();
        init.append(&mut graph.init);
        graph.init = init;
        graph.add_parameter("deviceid");
        Ok(graph)
    }

    /// Declares temporaries on the device and moves user functions that fit
    /// in and out of it around the computation.
    fn manage_data(&self, mut graph: Graph, ctx: &PassContext) -> anyhow::Result<Graph> {
        let written = graph.writes();
        for f in graph.functions() {
            if f.is_array() {
                graph.declare(Declaration {
                    name: f.name().to_string(),
                    ctype: "float".to_string(),
                    shape: f.dimensions().iter().map(|d| d.name().to_string()).collect(),
                    on_device: true,
                });
                continue;
            }
            if !ctx.options.place_transfers || !fits(&f, &ctx.options.gpu_fit) {
                continue;
            }
            let enter = if ctx.options.gpu_create.iter().any(|n| n == f.name()) {
                Movement::Create
            } else {
                Movement::CopyIn
            };
            let exit = if written.contains(&f) { Movement::CopyOut } else { Movement::Delete };
            graph.init.push(Node::Pragma(self.data_pragma(&f, enter)));
            graph.finalize.push(Node::Pragma(self.data_pragma(&f, exit)));
        }
        Ok(graph)
    }

    /// Materializes async regions: tasks run on their own queue, memcpy
    /// regions first bring host data over on a queue and wait for it.
    fn orchestrate(
        &self,
        mut graph: Graph,
        ctx: &PassContext,
        sregistry: &mut SymbolRegistry,
    ) -> anyhow::Result<Graph> {
        let body = std::mem::take(&mut graph.body);
        graph.body = iet::rewrite(body, &mut |nodes| {
            let mut out = Vec::with_capacity(nodes.len());
            for node in nodes {
                let (kind, body) = match node {
                    Node::Async { kind, body } => (kind, body),
                    other => {
                        out.push(other);
                        continue;
                    }
                };
                let queue = sregistry.make_name("q");
                match kind {
                    AsyncKind::Task(_) => {
                        out.push(Node::Region { name: queue.clone(), threaded: false, body });
                        out.push(Node::Pragma(self.wait(&queue)));
                    }
                    AsyncKind::Memcpy(_) => {
                        let mut reads: IndexSet<Function> = IndexSet::new();
                        iet::walk(&body, &mut |n| {
                            if let Node::Expression(eq) = n {
                                reads.extend(eq.reads());
                            }
                        });
                        for f in reads.iter().filter(|f| !fits(f, &ctx.options.gpu_fit)) {
                            out.push(Node::Pragma(self.update_device(f, &queue)));
                        }
                        out.push(Node::Pragma(self.wait(&queue)));
                        out.extend(body);
                        let name = format!("{queue}_prefetch");
                        out.push(Node::Prodder { name, periodic: true });
                    }
                }
            }
            out
        });
        Ok(graph)
    }
}

/// Visits the loops to offload: the first parallel loop on every path from
/// the root. Sequential loops are descended through.
fn parallelize(nodes: &mut [Node], f: &mut impl FnMut(&mut Iteration)) {
    for node in nodes {
        match node {
            Node::Iteration(it) if it.parallel => f(it),
            other => {
                if let Some(body) = other.body_mut() {
                    parallelize(body, f);
                }
            }
        }
    }
}

/// Whether the nest under `it` accesses a user function kept off the device.
fn touches_host(it: &Iteration, gpu_fit: &GpuFit) -> bool {
    let mut host = false;
    iet::walk(&it.body, &mut |n| {
        if let Node::Expression(eq) = n {
            host |= eq.functions().iter().any(|f| !f.is_array() && !fits(f, gpu_fit));
        }
    });
    host
}

fn host_pragma(collapse: usize) -> String {
    if collapse > 1 {
        format!("omp parallel for collapse({collapse}) schedule(static,1)")
    } else {
        "omp parallel for schedule(static,1)".to_string()
    }
}

/// Depth of the perfect nest of parallel loops rooted at `it`.
fn collapsible(it: &Iteration) -> usize {
    match it.body.as_slice() {
        [Node::Iteration(inner)] if inner.parallel => 1 + collapsible(inner),
        _ => 1,
    }
}

fn is_nonaffine(it: &Iteration) -> bool {
    matches!(it.dim.kind(), DimKind::MultiSub { .. })
        || matches!(it.dim.kind(), DimKind::Conditional { indirect: true, .. })
}
