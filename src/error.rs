//! Crate-wide error type.
//!
//! Every failure carries the name of the operation and the component that
//! raised it. Contract violations (mismatched shapes, wrong devices, bad
//! configuration) are reported through [`Result`] instead of aborting, so a
//! caller driving [`Network::fit`](crate::net::Network::fit) can decide what to
//! do with a broken setup.

use crate::backend::Device;

/// All errors produced by `briny_net`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two operands do not have identical shapes.
    #[error("{op}: shape mismatch {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// An operand has the wrong number of dimensions.
    #[error("{op}: expected rank {expected}, got {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Operands live on different devices.
    #[error("{op}: device mismatch {lhs} vs {rhs}")]
    DeviceMismatch {
        op: &'static str,
        lhs: Device,
        rhs: Device,
    },

    /// Padding mode string is not one of `same`, `none` or `valid`.
    #[error("{component}: invalid padding mode {mode:?}")]
    InvalidPadding {
        component: &'static str,
        mode: String,
    },

    /// Kernel, stride and padding cannot produce a positive output size.
    #[error("{component}: invalid output shape for input {input:?} ({reason})")]
    InvalidGeometry {
        component: &'static str,
        input: Vec<usize>,
        reason: String,
    },

    /// Generic configuration problem (counts, devices, arguments).
    #[error("{component}: {reason}")]
    Config {
        component: &'static str,
        reason: String,
    },

    /// The layer graph contains a cycle.
    #[error("{component}: recurrent net, no schedulable layer among {remaining} left")]
    RecurrentNet {
        component: &'static str,
        remaining: usize,
    },

    /// More replicas were requested than there are samples in a batch.
    #[error("split: {replicas} replicas cannot share a batch of {batch} samples")]
    TooManyReplicas { replicas: usize, batch: usize },

    /// A training or evaluation call was made before `build`.
    #[error("{op}: not built")]
    NotBuilt { op: &'static str },

    /// `get_layer` found no layer with that name.
    #[error("get_layer: layer {0:?} not found")]
    LayerNotFound(String),

    /// The backend has no implementation of the operation and emulation is off.
    #[error("{op}: not implemented for {backend}")]
    NotImplemented {
        op: &'static str,
        backend: &'static str,
    },

    /// The backend was requested but the crate was compiled without it.
    #[error("{backend} support not compiled in")]
    NotCompiled { backend: &'static str },

    /// Multi-node training.
    #[error("distributed computing service: not yet implemented")]
    Distributed,

    /// Replica parameter lists are not positionally aligned with the parent.
    #[error("sync_weights: replica {replica} layer {layer}: {reason}")]
    ReplicaMismatch {
        replica: usize,
        layer: usize,
        reason: String,
    },

    /// A replica worker thread panicked during a training step.
    #[error("replica {replica}: worker panicked: {reason}")]
    Worker { replica: usize, reason: String },

    /// A device backend failed while executing a kernel.
    #[error("backend failure: {0}")]
    Backend(String),

    /// User-supplied configuration failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl Error {
    pub(crate) fn config(component: &'static str, reason: impl Into<String>) -> Self {
        Error::Config {
            component,
            reason: reason.into(),
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

