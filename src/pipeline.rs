use crate::clusters::{clusterize, Cluster};
use crate::equations::{concretize_subdims, evaluate_derivatives, lower_exprs};
use crate::error::Result;
use crate::iet::{self, Graph};
use crate::operator::OptLevel;
use crate::options::{CompilerOptions, RawOptions};
use crate::registry::SymbolRegistry;
use crate::symbolics::{Equation, Substitution};
use crate::target::Target;
use std::time::Instant;
use tracing::{debug, info};

// Пасс получает весь уровень целиком и возвращает его переписанным
pub type ExprPassFn =
    fn(Vec<Equation>, &PassContext, &mut SymbolRegistry) -> anyhow::Result<Vec<Equation>>;
pub type ClusterPassFn =
    fn(Vec<Cluster>, &PassContext, &mut SymbolRegistry) -> anyhow::Result<Vec<Cluster>>;
pub type GraphPassFn = fn(Graph, &PassContext, &mut SymbolRegistry) -> anyhow::Result<Graph>;

/// Read-only state shared by every pass of one compilation.
pub struct PassContext {
    pub options: CompilerOptions,
    pub target: Box<dyn Target>,
}

impl PassContext {
    pub fn new(raw: RawOptions, mode: &OptLevel, target: Box<dyn Target>) -> Result<Self> {
        let options = CompilerOptions::normalize(raw, mode, target.as_ref())?;
        Ok(Self { options, target })
    }
}

pub struct CompilerContext {
    pub name: String,
    pub equations: Vec<Equation>,
    /// Caller substitutions applied while lowering.
    pub subs: Substitution,
    pub clusters: Vec<Cluster>,
    pub graph: Option<Graph>,
    pub sregistry: SymbolRegistry,
    pub pass: PassContext,
}

impl CompilerContext {
    pub fn new(
        name: &str,
        equations: Vec<Equation>,
        subs: Substitution,
        pass: PassContext,
    ) -> Self {
        let mut sregistry = SymbolRegistry::new();
        sregistry.reserve(name);
        sregistry.reserve_equations(&equations);
        Self {
            name: name.to_string(),
            equations,
            subs,
            clusters: Vec::new(),
            graph: None,
            sregistry,
            pass,
        }
    }
}

pub trait Stage {
    fn name(&self) -> &str;
    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn add_stage<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn execute(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        for stage in &self.stages {
            let start = Instant::now();
            info!(stage = stage.name(), "stage started");
            stage.run(ctx)?;
            info!(stage = stage.name(), elapsed = ?start.elapsed(), "stage finished");
        }
        Ok(())
    }
}

/// Equation-level passes, ahead of lowering.
#[derive(Default)]
pub struct ExprStage {
    passes: Vec<(&'static str, ExprPassFn)>,
}

impl ExprStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, name: &'static str, pass: ExprPassFn) -> Self {
        self.passes.push((name, pass));
        self
    }
}

impl Stage for ExprStage {
    fn name(&self) -> &str {
        "pre-clustering"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        let mut exprs = std::mem::take(&mut ctx.equations);
        for (name, pass) in &self.passes {
            debug!(pass = name, "running");
            exprs = pass(exprs, &ctx.pass, &mut ctx.sregistry)?;
        }
        ctx.equations = exprs;
        Ok(())
    }
}

/// Derivatives to finite differences, domain-aligned indexing, then
/// per-use concretization of derived dimensions.
pub struct LoweringStage;

impl Stage for LoweringStage {
    fn name(&self) -> &str {
        "lowering"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        // 1. Производные -> конечные разности
        let exprs = evaluate_derivatives(&ctx.equations);
        // 2. Индексация с учетом halo/padding
        let exprs = lower_exprs(&exprs, &ctx.subs);
        // 3. Конкретизация производных измерений
        ctx.equations = concretize_subdims(&exprs, &mut ctx.sregistry);
        debug!(exprs = ctx.equations.len(), "lowered");
        Ok(())
    }
}

pub struct ClusterStage {
    passes: Vec<(&'static str, ClusterPassFn)>,
}

impl Default for ClusterStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStage {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_pass(mut self, name: &'static str, pass: ClusterPassFn) -> Self {
        self.passes.push((name, pass));
        self
    }
}

impl Stage for ClusterStage {
    fn name(&self) -> &str {
        "clusters"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        let mut clusters = clusterize(&ctx.equations)?;
        for (name, pass) in &self.passes {
            clusters = pass(clusters, &ctx.pass, &mut ctx.sregistry)?;
            debug!(pass = name, clusters = clusters.len(), "cluster pass done");
        }
        ctx.clusters = clusters;
        Ok(())
    }
}

/// Builds the program graph from the clusters and runs the graph passes.
pub struct GraphStage {
    passes: Vec<(&'static str, GraphPassFn)>,
}

impl Default for GraphStage {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStage {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_pass(mut self, name: &'static str, pass: GraphPassFn) -> Self {
        self.passes.push((name, pass));
        self
    }
}

impl Stage for GraphStage {
    fn name(&self) -> &str {
        "iet"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        let mut graph = iet::build(&ctx.name, &ctx.clusters);
        for (name, pass) in &self.passes {
            graph = pass(graph, &ctx.pass, &mut ctx.sregistry)?;
            debug!(pass = name, "graph pass done");
        }
        ctx.graph = Some(graph);
        Ok(())
    }
}
