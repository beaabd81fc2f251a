//! Device-memory fit decisions driving the tasking and streaming passes.
//!
//! All functions here are pure: they inspect a cluster and report which loop,
//! if any, an asynchronous region should be scoped to.

use crate::clusters::Cluster;
use crate::error::{Error, Result};
use crate::options::GpuFit;
use crate::symbolics::{Dimension, Function};
use indexmap::IndexSet;
use tracing::trace;

/// Whether `f` resides in device memory.
///
/// Compiler temporaries and functions without a time axis always fit; a
/// composite fits iff every component does.
pub fn fits(f: &Function, gpu_fit: &GpuFit) -> bool {
    f.components().iter().all(|c| !c.is_streamable() || gpu_fit.contains(c))
}

/// Result of [`stream_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKey {
    Single(Dimension),
    /// More than one time axis would need streaming.
    Many(IndexSet<Dimension>),
}

impl StreamKey {
    pub fn dims(&self) -> Vec<&Dimension> {
        match self {
            StreamKey::Single(d) => vec![d],
            StreamKey::Many(dims) => dims.iter().collect(),
        }
    }
}

/// The time dimension(s) along which the functions that do not fit would
/// have to be streamed.
pub fn stream_key(functions: &[Function], gpu_fit: &GpuFit) -> Option<StreamKey> {
    let mut dims: IndexSet<Dimension> = IndexSet::new();
    for f in functions {
        if fits(f, gpu_fit) {
            continue;
        }
        for c in f.components() {
            if let Some(d) = c.time_dim() {
                dims.insert(d.clone());
            }
        }
    }
    match dims.len() {
        0 => None,
        1 => dims.pop().map(StreamKey::Single),
        _ => Some(StreamKey::Many(dims)),
    }
}

fn concrete_key(
    cluster: &Cluster,
    functions: &[Function],
    gpu_fit: &GpuFit,
    kind: &'static str,
) -> Result<Option<Dimension>> {
    let Some(key) = stream_key(functions, gpu_fit) else {
        return Ok(None);
    };
    let dims: IndexSet<Dimension> = key
        .dims()
        .into_iter()
        .filter_map(|d| cluster.ispace.lookup(d).cloned())
        .collect();
    if dims.len() > 1 {
        return Err(Error::Ambiguity {
            kind,
            cluster: cluster.to_string(),
            candidates: dims.iter().map(|d| d.name().to_string()).collect(),
        });
    }
    let key = dims.into_iter().next();
    trace!(cluster = %cluster, kind, key = ?key, "async key");
    Ok(key)
}

/// Loop defining the scope of an asynchronous task: the cluster writes to a
/// function that cannot be kept on the device.
pub fn task_key(cluster: &Cluster, gpu_fit: &GpuFit) -> Result<Option<Dimension>> {
    concrete_key(cluster, &cluster.scope().writes, gpu_fit, "task")
}

/// Loop within which host data read by the cluster must be copied in.
/// Never set when the cluster is already a task: writes take precedence.
pub fn memcpy_key(cluster: &Cluster, gpu_fit: &GpuFit) -> Result<Option<Dimension>> {
    if task_key(cluster, gpu_fit)?.is_some() {
        return Ok(None);
    }
    concrete_key(cluster, &cluster.scope().reads, gpu_fit, "memcpy")
}
