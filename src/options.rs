//! Optimization options: the raw caller-facing map and its normalized, typed
//! form.

use crate::error::{Error, Result};
use crate::operator::OptLevel;
use crate::symbolics::Function;
use crate::target::Target;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

/// A raw option value, as given by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<OptionValue>),
    Functions(Vec<Function>),
}

impl OptionValue {
    fn kind(&self) -> &'static str {
        match self {
            OptionValue::Null => "null",
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Str(_) => "string",
            OptionValue::List(_) => "list",
            OptionValue::Functions(_) => "functions",
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(i64::from(v))
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<Vec<i64>> for OptionValue {
    fn from(v: Vec<i64>) -> Self {
        OptionValue::List(v.into_iter().map(OptionValue::Int).collect())
    }
}

impl From<Function> for OptionValue {
    fn from(f: Function) -> Self {
        OptionValue::Functions(vec![f])
    }
}

impl From<Vec<Function>> for OptionValue {
    fn from(fs: Vec<Function>) -> Self {
        OptionValue::Functions(fs)
    }
}

impl From<serde_json::Value> for OptionValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => OptionValue::Null,
            Value::Bool(b) => OptionValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => OptionValue::Int(i),
                None => OptionValue::Str(n.to_string()),
            },
            Value::String(s) => OptionValue::Str(s),
            Value::Array(items) => {
                OptionValue::List(items.into_iter().map(OptionValue::from).collect())
            }
            other => OptionValue::Str(other.to_string()),
        }
    }
}

/// Caller options, in insertion order. Normalization consumes recognized
/// keys; whatever is left is an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOptions(IndexMap<String, OptionValue>);

impl RawOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let map: IndexMap<String, serde_json::Value> = serde_json::from_str(text)
            .map_err(|e| {
                Error::configuration(format!("malformed options: {e}"), Vec::<String>::new())
            })?;
        Ok(Self(map.into_iter().map(|(k, v)| (k, OptionValue::from(v))).collect()))
    }

    pub fn with(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.0.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn invalid(key: &str, value: &OptionValue, expected: &str) -> Error {
    Error::configuration(
        format!("invalid {} value for option `{key}`, expected {expected}", value.kind()),
        [key],
    )
}

/// Typed accessors that consume the key.
impl RawOptions {
    fn pop_bool(&mut self, key: &str, default: bool) -> Result<bool> {
        match self.remove(key) {
            None => Ok(default),
            Some(OptionValue::Bool(b)) => Ok(b),
            Some(other) => Err(invalid(key, &other, "a bool")),
        }
    }

    fn pop_usize(&mut self, key: &str, default: usize) -> Result<usize> {
        match self.remove(key) {
            None => Ok(default),
            Some(OptionValue::Int(i)) => usize::try_from(i)
                .map_err(|_| invalid(key, &OptionValue::Int(i), "a non-negative int")),
            Some(other) => Err(invalid(key, &other, "a non-negative int")),
        }
    }

    fn pop_opt_usize(&mut self, key: &str) -> Result<Option<usize>> {
        match self.remove(key) {
            None | Some(OptionValue::Null) => Ok(None),
            Some(OptionValue::Int(i)) => usize::try_from(i)
                .map(Some)
                .map_err(|_| invalid(key, &OptionValue::Int(i), "a non-negative int")),
            Some(other) => Err(invalid(key, &other, "a non-negative int or null")),
        }
    }

    fn pop_ints(&mut self, key: &str) -> Result<Option<Vec<usize>>> {
        match self.remove(key) {
            None | Some(OptionValue::Null) => Ok(None),
            Some(OptionValue::List(items)) => items
                .iter()
                .map(|v| match v {
                    OptionValue::Int(i) if *i > 0 => Ok(*i as usize),
                    other => Err(invalid(key, other, "a list of positive ints")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(other) => Err(invalid(key, &other, "a list of positive ints")),
        }
    }

    fn pop_names(&mut self, key: &str) -> Result<Vec<String>> {
        match self.remove(key) {
            None | Some(OptionValue::Null) => Ok(Vec::new()),
            Some(value) => names_of(key, value),
        }
    }
}

/// Flattens names and functions, expanding composites into their
/// components.
fn names_of(key: &str, value: OptionValue) -> Result<Vec<String>> {
    match value {
        OptionValue::Str(s) => Ok(vec![s]),
        OptionValue::Functions(fs) => Ok(fs
            .iter()
            .flat_map(|f| f.components())
            .map(|c| c.name().to_string())
            .collect()),
        OptionValue::List(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(names_of(key, item)?);
            }
            Ok(out)
        }
        other => Err(invalid(key, &other, "function names")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MpiMode {
    Off,
    Basic,
    /// Full mode: halo exchanges are also merged and hoisted where legal.
    Full,
}

impl MpiMode {
    pub fn is_enabled(self) -> bool {
        self != MpiMode::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CireSchedule {
    Automatic,
    Fixed(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivSchedule {
    Basic,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Int32,
    Int64,
}

impl IndexMode {
    pub fn ctype(self) -> &'static str {
        match self {
            IndexMode::Int32 => "int",
            IndexMode::Int64 => "long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrCtl {
    Basic,
    Max,
}

/// Thread-block shape for device loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParTile {
    /// `None` lets the backend pick; tiling is then not requested.
    pub tiles: Option<Vec<usize>>,
    pub sparse: Option<Vec<usize>>,
    pub reduce: Option<Vec<usize>>,
}

impl ParTile {
    pub const DEFAULT: [usize; 3] = [32, 4, 4];

    pub fn is_enabled(&self) -> bool {
        self.tiles.is_some()
    }
}

/// Which user functions live in device memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuFit {
    /// Assume every function fits.
    All,
    Nothing,
    Names(IndexSet<String>),
}

impl GpuFit {
    pub fn contains(&self, f: &Function) -> bool {
        match self {
            GpuFit::All => true,
            GpuFit::Nothing => false,
            GpuFit::Names(names) => names.contains(f.name()),
        }
    }
}

/// Knobs accepted and validated for compatibility with existing option
/// sets. No pass reads them; they only show up in the normalized dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InertOptions {
    buf_async_degree: Option<usize>,
    skewing: bool,
    cire_maxpar: bool,
    cire_ftemps: bool,
    cire_mingain: usize,
    cire_schedule: CireSchedule,
    expand: bool,
    deriv_schedule: DerivSchedule,
    deriv_unroll: bool,
    mapify_reduce: bool,
}

/// Normalized options. Every recognized key has a value here, defaults
/// included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerOptions {
    pub language: &'static str,
    pub mpi: MpiMode,
    pub fuse_tasks: bool,
    pub cse_min_cost: usize,
    pub blockinner: bool,
    pub blocklevels: usize,
    pub blockeager: bool,
    pub blocklazy: bool,
    pub blockrelax: bool,
    pub par_tile: ParTile,
    pub par_chunk_nonaffine: usize,
    /// Loops that cannot be offloaded stay sequential on the host instead
    /// of running host-parallel.
    pub par_disabled: bool,
    pub gpu_fit: GpuFit,
    pub gpu_create: Vec<String>,
    /// Never-written functions are exchanged once, ahead of time stepping.
    pub dist_drop_unwritten: bool,
    pub opt_comms: bool,
    pub linearize: bool,
    pub index_mode: IndexMode,
    pub place_transfers: bool,
    pub errctl: Option<ErrCtl>,
    #[serde(flatten)]
    pub inert: InertOptions,
}

impl CompilerOptions {
    pub const CSE_MIN_COST: usize = 1;
    pub const BLOCK_LEVELS: usize = 0;
    pub const CIRE_MINGAIN: usize = 10;
    pub const PAR_CHUNK_NONAFFINE: usize = 3;

    /// Every key `normalize` consumes.
    pub const KNOWN_KEYS: &'static [&'static str] = &[
        "mpi", "buf-async-degree", "fuse-tasks", "cse-min-cost", "blockinner", "blocklevels",
        "blockeager", "blocklazy", "blockrelax", "skewing", "cire-maxpar", "cire-ftemps",
        "cire-mingain", "cire-schedule", "par-tile", "par-tile-sparse", "par-tile-reduce",
        "par-chunk-nonaffine", "par-disabled", "gpu-fit", "gpu-create", "dist-drop-unwritten",
        "expand", "deriv-schedule", "deriv-unroll", "opt-comms", "linearize", "mapify-reduce",
        "index-mode", "place-transfers", "errctl", "openmp", "openacc",
    ];

    /// Validates `raw` for `mode` on `target`, filling in every default.
    /// Unknown keys are reported before any value is checked.
    pub fn normalize(mut raw: RawOptions, mode: &OptLevel, target: &dyn Target) -> Result<Self> {
        let unknown: Vec<&str> = raw.keys().filter(|k| !Self::KNOWN_KEYS.contains(k)).collect();
        if !unknown.is_empty() {
            return Err(Error::configuration("unsupported optimization options", unknown));
        }
        target.default_options(&mut raw);
        // Language markers are implied by the target
        raw.remove("openmp");
        raw.remove("openacc");

        let mpi = match raw.remove("mpi") {
            None | Some(OptionValue::Bool(false)) => MpiMode::Off,
            Some(OptionValue::Bool(true)) => MpiMode::Full,
            Some(OptionValue::Str(s)) if s == "basic" => MpiMode::Basic,
            Some(other) => return Err(invalid("mpi", &other, "true, false or \"basic\"")),
        };

        let buf_async_degree = raw.pop_opt_usize("buf-async-degree")?;
        let fuse_tasks = raw.pop_bool("fuse-tasks", false)?;
        let cse_min_cost = raw.pop_usize("cse-min-cost", Self::CSE_MIN_COST)?;

        let blockinner = raw.pop_bool("blockinner", true)?;
        let blocklevels = raw.pop_usize("blocklevels", Self::BLOCK_LEVELS)?;
        let blockeager = raw.pop_bool("blockeager", false)?;
        let blocklazy = raw.pop_bool("blocklazy", !blockeager)?;
        if blockeager && blocklazy {
            return Err(Error::configuration(
                "blocking cannot be both eager and lazy",
                ["blockeager", "blocklazy"],
            ));
        }
        let blockrelax = raw.pop_bool("blockrelax", false)?;
        let skewing = raw.pop_bool("skewing", false)?;

        let cire_maxpar = raw.pop_bool("cire-maxpar", true)?;
        let cire_ftemps = raw.pop_bool("cire-ftemps", false)?;
        let cire_mingain = raw.pop_usize("cire-mingain", Self::CIRE_MINGAIN)?;
        let cire_schedule = match raw.remove("cire-schedule") {
            None => CireSchedule::Automatic,
            Some(OptionValue::Str(s)) if s == "automatic" => CireSchedule::Automatic,
            Some(OptionValue::Int(i)) => CireSchedule::Fixed(i),
            Some(other) => return Err(invalid("cire-schedule", &other, "\"automatic\" or an int")),
        };

        let tiles = match raw.remove("par-tile") {
            None | Some(OptionValue::Null) | Some(OptionValue::Bool(false)) => None,
            Some(OptionValue::Bool(true)) => Some(ParTile::DEFAULT.to_vec()),
            Some(value) => {
                // reuse the list parser on the value we just took out
                raw.set("par-tile", value);
                raw.pop_ints("par-tile")?
            }
        };
        let par_tile = ParTile {
            tiles,
            sparse: raw.pop_ints("par-tile-sparse")?,
            reduce: raw.pop_ints("par-tile-reduce")?,
        };
        let par_chunk_nonaffine = raw.pop_usize("par-chunk-nonaffine", Self::PAR_CHUNK_NONAFFINE)?;
        let par_disabled = raw.pop_bool("par-disabled", true)?;

        let gpu_fit = match raw.remove("gpu-fit") {
            Some(OptionValue::Str(s)) if s == "all-fallback" => GpuFit::All,
            Some(OptionValue::Null) => GpuFit::Nothing,
            Some(value) => GpuFit::Names(names_of("gpu-fit", value)?.into_iter().collect()),
            None if mode.names().iter().any(|n| *n == "tasking" || *n == "streaming") => {
                GpuFit::Nothing
            }
            None => GpuFit::All,
        };
        let gpu_create = raw.pop_names("gpu-create")?;

        let dist_drop_unwritten = raw.pop_bool("dist-drop-unwritten", true)?;
        let expand = raw.pop_bool("expand", true)?;
        let deriv_schedule = match raw.remove("deriv-schedule") {
            None => DerivSchedule::Basic,
            Some(OptionValue::Str(s)) if s == "basic" => DerivSchedule::Basic,
            Some(OptionValue::Str(s)) if s == "smart" => DerivSchedule::Smart,
            Some(other) => return Err(invalid("deriv-schedule", &other, "\"basic\" or \"smart\"")),
        };
        let deriv_unroll = raw.pop_bool("deriv-unroll", false)?;

        let opt_comms = raw.pop_bool("opt-comms", true)?;
        let linearize = raw.pop_bool("linearize", false)?;
        let mapify_reduce = raw.pop_bool("mapify-reduce", false)?;
        let index_mode = match raw.remove("index-mode") {
            None => IndexMode::Int32,
            Some(OptionValue::Str(s)) if s == "int32" => IndexMode::Int32,
            Some(OptionValue::Str(s)) if s == "int64" => IndexMode::Int64,
            Some(other) => return Err(invalid("index-mode", &other, "\"int32\" or \"int64\"")),
        };
        let place_transfers = raw.pop_bool("place-transfers", true)?;
        let errctl = match raw.remove("errctl") {
            None | Some(OptionValue::Null) => None,
            Some(OptionValue::Str(s)) if s == "basic" => Some(ErrCtl::Basic),
            Some(OptionValue::Str(s)) if s == "max" => Some(ErrCtl::Max),
            Some(other) => return Err(invalid("errctl", &other, "null, \"basic\" or \"max\"")),
        };

        if !raw.is_empty() {
            return Err(Error::configuration("unsupported optimization options", raw.keys()));
        }

        let options = CompilerOptions {
            language: target.name(),
            mpi,
            fuse_tasks,
            cse_min_cost,
            blockinner,
            blocklevels,
            blockeager,
            blocklazy,
            blockrelax,
            par_tile,
            par_chunk_nonaffine,
            par_disabled,
            gpu_fit,
            gpu_create,
            dist_drop_unwritten,
            opt_comms,
            linearize,
            index_mode,
            place_transfers,
            errctl,
            inert: InertOptions {
                buf_async_degree,
                skewing,
                cire_maxpar,
                cire_ftemps,
                cire_mingain,
                cire_schedule,
                expand,
                deriv_schedule,
                deriv_unroll,
                mapify_reduce,
            },
        };
        target.check_options(&options)?;
        Ok(options)
    }
}
