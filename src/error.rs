//! Compilation errors

use thiserror::Error;

/// Compilation result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the compiler.
///
/// Every failure is raised before any partial result is produced; none of
/// them is retryable.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown or ill-typed option, backend-incompatible option, unknown or
    /// disabled pass name.
    #[error("{message}: [{}]", keys.join(", "))]
    Configuration { keys: Vec<String>, message: String },

    /// A cluster cannot be split along a single task/memcpy dimension.
    #[error(
        "cannot determine a unique {kind} dimension for cluster `{cluster}`: {{{}}}",
        candidates.join(", ")
    )]
    Ambiguity {
        kind: &'static str,
        cluster: String,
        candidates: Vec<String>,
    },

    /// The dimension relations of an equation are cyclic.
    #[error("cyclic dimension ordering in `{equation}` involving {{{}}}", dims.join(", "))]
    DimensionCycle { equation: String, dims: Vec<String> },

    /// Any other failure raised while running a pass.
    #[error(transparent)]
    Pass(anyhow::Error),
}

impl Error {
    pub fn configuration(
        message: impl Into<String>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Error::Configuration {
            keys: keys.into_iter().map(Into::into).collect(),
            message: message.into(),
        }
    }

    /// Offending keys or pass names of a configuration error.
    pub fn keys(&self) -> &[String] {
        match self {
            Error::Configuration { keys, .. } => keys,
            _ => &[],
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(other) => Error::Pass(other),
        }
    }
}
