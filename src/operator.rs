//! Operator construction: picks the passes for an optimization level and a
//! device backend, then drives the staged pipeline over user equations.

use crate::error::{Error, Result};
use crate::iet::Graph;
use crate::options::{CompilerOptions, RawOptions};
use crate::passes::{self, cluster, graph};
use crate::pipeline::{
    ClusterPassFn, ClusterStage, CompilerContext, ExprPassFn, ExprStage, GraphPassFn, GraphStage,
    LoweringStage, PassContext, Pipeline,
};
use crate::symbolics::{Equation, Substitution};
use crate::target::{OpenAcc, OpenMp, Target};
use std::time::Instant;
use tracing::{debug, info};

/// Optimization level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptLevel {
    /// Parallelization and finalization only.
    Noop,
    Adv,
    /// Same passes as [`OptLevel::Adv`].
    Fsg,
    /// Caller-ordered pass names.
    Custom(Vec<String>),
}

impl OptLevel {
    /// `noop`, `advanced`, `advanced-fsg`, or a comma separated pass list.
    pub fn parse(mode: &str) -> Self {
        match mode {
            "noop" => OptLevel::Noop,
            "advanced" => OptLevel::Adv,
            "advanced-fsg" | "fsg" => OptLevel::Fsg,
            other => OptLevel::Custom(
                other
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ),
        }
    }

    /// Pass names of a custom level, the level name otherwise.
    pub fn names(&self) -> Vec<&str> {
        match self {
            OptLevel::Noop => vec!["noop"],
            OptLevel::Adv => vec!["advanced"],
            OptLevel::Fsg => vec!["advanced-fsg"],
            OptLevel::Custom(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceBackend {
    Omp,
    #[default]
    Acc,
}

impl DeviceBackend {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "omp" | "openmp" => Ok(DeviceBackend::Omp),
            "acc" | "openacc" => Ok(DeviceBackend::Acc),
            other => Err(Error::configuration("unknown device backend", [other])),
        }
    }

    pub fn target(self) -> Box<dyn Target> {
        match self {
            DeviceBackend::Omp => Box::new(OpenMp),
            DeviceBackend::Acc => Box::new(OpenAcc),
        }
    }
}

const EXPR_PASSES: &[(&str, ExprPassFn)] = &[("collect-derivs", passes::collect_derivs)];

const CLUSTER_PASSES: &[(&str, ClusterPassFn)] = &[
    ("buffering", cluster::buffering),
    ("blocking", cluster::blocking),
    ("tasking", cluster::tasking),
    ("streaming", cluster::streaming),
    ("factorize", cluster::factorize),
    ("fission", cluster::fission),
    ("fuse", cluster::fuse),
    ("lift", cluster::lift),
    ("cire-sops", cluster::factorize),
    ("cse", cluster::cse),
    ("opt-pows", cluster::opt_pows),
    ("topofuse", cluster::topofuse),
];

const GRAPH_PASSES: &[(&str, GraphPassFn)] = &[
    ("parallel", graph::parallel),
    ("orchestrate", graph::orchestrate),
    ("pthreadify", graph::pthreadify),
    ("mpi", graph::mpi),
    ("linearize", graph::linearize),
    ("prodders", graph::prodders),
    ("init", graph::init),
];

/// Known but unavailable on device backends.
const DISABLED_PASSES: &[&str] = &["denormals", "simd"];

fn lookup<F: Copy>(table: &[(&'static str, F)], name: &str) -> Option<(&'static str, F)> {
    table.iter().find(|(n, _)| *n == name).copied()
}

/// Rejects unknown and disabled pass names, all of them at once.
fn validate_custom(names: &[String], target: &dyn Target) -> Result<()> {
    let disabled: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| DISABLED_PASSES.contains(n))
        .collect();
    if !disabled.is_empty() {
        return Err(Error::configuration("disabled passes for device backends", disabled));
    }
    let unknown: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| {
            *n != target.name()
                && lookup(EXPR_PASSES, n).is_none()
                && lookup(CLUSTER_PASSES, n).is_none()
                && lookup(GRAPH_PASSES, n).is_none()
        })
        .collect();
    if !unknown.is_empty() {
        return Err(Error::configuration("unknown passes", unknown));
    }
    Ok(())
}

fn fixed_pipeline(options: &CompilerOptions) -> Pipeline {
    let mut clusters = ClusterStage::new()
        .with_pass("topofuse", cluster::topofuse)
        .with_pass("fission", cluster::fission)
        .with_pass("lift", cluster::lift);
    if options.blockeager {
        clusters = clusters.with_pass("blocking", cluster::blocking);
    }
    clusters = clusters
        .with_pass("factorize", cluster::factorize)
        .with_pass("opt-pows", cluster::opt_pows)
        .with_pass("fuse", cluster::fuse)
        .with_pass("cse", cluster::cse);
    if options.blocklazy {
        clusters = clusters.with_pass("blocking", cluster::blocking);
    }

    let mut pipeline = Pipeline::new();
    pipeline.add_stage(ExprStage::new().with_pass("collect-derivs", passes::collect_derivs));
    pipeline.add_stage(LoweringStage);
    pipeline.add_stage(clusters);
    pipeline.add_stage(
        GraphStage::new()
            .with_pass("mpi", graph::mpi)
            .with_pass("relax", graph::relax)
            .with_pass("parallel", graph::parallel)
            .with_pass("init", graph::init)
            .with_pass("data", graph::data)
            .with_pass("prodders", graph::prodders)
            .with_pass("stability", graph::stability)
            .with_pass("finalize", graph::finalize)
            .with_pass("linearize", graph::linearize),
    );
    pipeline
}

fn noop_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline.add_stage(LoweringStage);
    pipeline.add_stage(ClusterStage::new());
    pipeline.add_stage(
        GraphStage::new()
            .with_pass("mpi", graph::mpi)
            .with_pass("parallel", graph::parallel)
            .with_pass("init", graph::init)
            .with_pass("data", graph::data)
            .with_pass("finalize", graph::finalize),
    );
    pipeline
}

/// Caller's passes split across the stages by table, followed by the
/// mandatory data management and finalization.
fn custom_pipeline(names: &[String], target: &dyn Target) -> Pipeline {
    let mut exprs = ExprStage::new();
    let mut clusters = ClusterStage::new();
    let mut graphs = GraphStage::new();
    for name in names {
        if name == target.name() {
            graphs = graphs.with_pass("parallel", graph::parallel);
        } else if let Some((n, pass)) = lookup(EXPR_PASSES, name) {
            exprs = exprs.with_pass(n, pass);
        } else if let Some((n, pass)) = lookup(CLUSTER_PASSES, name) {
            clusters = clusters.with_pass(n, pass);
        } else if let Some((n, pass)) = lookup(GRAPH_PASSES, name) {
            graphs = graphs.with_pass(n, pass);
        }
    }
    graphs = graphs.with_pass("data", graph::data).with_pass("finalize", graph::finalize);

    let mut pipeline = Pipeline::new();
    pipeline.add_stage(exprs);
    pipeline.add_stage(LoweringStage);
    pipeline.add_stage(clusters);
    pipeline.add_stage(graphs);
    pipeline
}

/// A compiled operator.
#[derive(Debug)]
pub struct Operator {
    pub name: String,
    /// Equations after lowering and concretization.
    pub exprs: Vec<Equation>,
    pub graph: Graph,
    pub options: CompilerOptions,
}

impl Operator {
    pub fn builder(name: &str, equations: Vec<Equation>) -> OperatorBuilder {
        OperatorBuilder {
            name: name.to_string(),
            equations,
            subs: Substitution::new(),
            options: RawOptions::new(),
            mode: OptLevel::Adv,
            backend: DeviceBackend::default(),
        }
    }
}

pub struct OperatorBuilder {
    name: String,
    equations: Vec<Equation>,
    subs: Substitution,
    options: RawOptions,
    mode: OptLevel,
    backend: DeviceBackend,
}

impl OperatorBuilder {
    pub fn with_options(mut self, options: RawOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_mode(mut self, mode: OptLevel) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_backend(mut self, backend: DeviceBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Substitutions applied to every equation while lowering.
    pub fn with_subs(mut self, subs: Substitution) -> Self {
        self.subs = subs;
        self
    }

    pub fn build(self) -> Result<Operator> {
        let start = Instant::now();
        let target = self.backend.target();

        // 1. Проверка пассов и опций до запуска чего-либо
        if let OptLevel::Custom(names) = &self.mode {
            validate_custom(names, target.as_ref())?;
        }
        let pass = PassContext::new(self.options, &self.mode, target)?;
        debug!(language = pass.options.language, mode = ?self.mode, "options normalized");

        // 2. Сборка конвейера
        let pipeline = match &self.mode {
            OptLevel::Noop => noop_pipeline(),
            OptLevel::Adv | OptLevel::Fsg => fixed_pipeline(&pass.options),
            OptLevel::Custom(names) => custom_pipeline(names, pass.target.as_ref()),
        };

        // 3. Запуск
        let mut ctx = CompilerContext::new(&self.name, self.equations, self.subs, pass);
        pipeline.execute(&mut ctx)?;
        let graph = ctx
            .graph
            .ok_or_else(|| Error::Pass(anyhow::anyhow!("pipeline produced no graph")))?;

        info!(operator = %self.name, elapsed = ?start.elapsed(), "operator built");
        Ok(Operator {
            name: self.name,
            exprs: ctx.equations,
            graph,
            options: ctx.pass.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iet::Node;
    use crate::symbolics::{Dimension, Function};
    use test_case::test_case;

    fn heat() -> Vec<Equation> {
        let time = Dimension::time("time");
        let t = Dimension::stepping("t", &time);
        let x = Dimension::space("x");
        let u = Function::time_dense("u", vec![t.clone(), x.clone()], 1);
        vec![Equation::new(
            u.at([t.expr() + 1, x.expr()]),
            u.at([t.expr(), x.expr() - 1]) + u.at([t.expr(), x.expr() + 1]),
        )]
    }

    #[test_case("noop", OptLevel::Noop ; "noop")]
    #[test_case("advanced", OptLevel::Adv ; "advanced")]
    #[test_case("advanced-fsg", OptLevel::Fsg ; "fsg")]
    #[test_case(
        "tasking, parallel",
        OptLevel::Custom(vec!["tasking".into(), "parallel".into()]) ;
        "custom list"
    )]
    fn modes_parse(text: &str, expected: OptLevel) {
        assert_eq!(OptLevel::parse(text), expected);
    }

    #[test]
    fn backends_parse() {
        assert_eq!(DeviceBackend::parse("openmp").unwrap(), DeviceBackend::Omp);
        assert_eq!(DeviceBackend::parse("acc").unwrap(), DeviceBackend::Acc);
        let err = DeviceBackend::parse("cuda").unwrap_err();
        assert_eq!(err.keys(), ["cuda".to_string()]);
    }

    #[test]
    fn disabled_and_unknown_passes_are_rejected() {
        let target = OpenAcc;
        let err = validate_custom(&["simd".into(), "cse".into()], &target).unwrap_err();
        assert_eq!(err.keys(), ["simd".to_string()]);
        let names: [String; 3] = ["cse".into(), "bogus".into(), "openmp".into()];
        let err = validate_custom(&names, &target).unwrap_err();
        assert_eq!(err.keys(), ["bogus".to_string(), "openmp".to_string()]);
        let names: [String; 3] = ["openacc".into(), "cire-sops".into(), "init".into()];
        assert!(validate_custom(&names, &target).is_ok());
    }

    #[test]
    fn fixed_pipeline_runs_every_stage() {
        let pass = PassContext::new(RawOptions::new(), &OptLevel::Adv, Box::new(OpenAcc)).unwrap();
        let pipeline = fixed_pipeline(&pass.options);
        assert_eq!(pipeline.stage_names(), vec!["pre-clustering", "lowering", "clusters", "iet"]);
        assert_eq!(noop_pipeline().stage_names(), vec!["lowering", "clusters", "iet"]);
    }

    #[test]
    fn noop_operator_offloads_the_space_loop() {
        let op = Operator::builder("heat", heat())
            .with_mode(OptLevel::Noop)
            .build()
            .unwrap();
        let space = op.graph.iterations()[1];
        assert_eq!(space.pragmas, vec!["acc parallel loop".to_string()]);
        assert!(op.graph.init.contains(&Node::Pragma("acc enter data copyin(u)".to_string())));
        assert!(op.graph.parameters.contains(&"u".to_string()));
    }

    #[test]
    fn advanced_operator_under_openmp_is_linearized() {
        let op = Operator::builder("heat", heat())
            .with_backend(DeviceBackend::Omp)
            .build()
            .unwrap();
        assert!(op.graph.linearized);
        assert_eq!(op.options.language, "openmp");
    }

    #[test]
    fn custom_backend_alias_parallelizes() {
        let op = Operator::builder("heat", heat())
            .with_mode(OptLevel::parse("openacc"))
            .build()
            .unwrap();
        assert!(op.graph.iterations().iter().any(|it| !it.pragmas.is_empty()));
    }
}
