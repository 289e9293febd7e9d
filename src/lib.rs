//! briny_net: layer-graph neural network training with device dispatch.
//!
//! Networks are built as graphs of layers over host-resident tensors. Every
//! tensor carries a device tag that selects which kernel set runs the
//! operations writing to it; kernels a device lacks fall back to CPU
//! emulation. Training splits each batch across replicas, one per device of
//! the compute service, and keeps their weights in agreement.
//!
//! # Modules
//!
//! - [`tensor`]: shared, lockable n-dimensional `f32` buffers
//! - [`ops`]: numeric primitives and per-device kernels
//! - [`descriptors`]: pooling and convolution geometry
//! - [`graph`] and [`layers`]: graph construction
//! - [`net`]: scheduling, replicas, and the training loop
//! - [`losses`], [`metrics`], [`optim`]: training components
//! - [`config`]: compute services and backend capabilities
//!
//! # Example
//!
//! ```rust
//! use briny_net::prelude::*;
//!
//! let mut g = Graph::with_seed(3);
//! let x = g.input("x", &[4]).unwrap();
//! let h = g.dense("fc", x, 2).unwrap();
//! let y = g.softmax("probs", h).unwrap();
//!
//! let mut net = Network::new(g, &[x], &[y]).unwrap();
//! net.build(
//!     Box::new(Sgd::new(0.1)),
//!     vec![Box::new(SoftCrossEntropy)],
//!     vec![Box::new(CategoricalAccuracy)],
//!     ComputeService::cpu(1),
//! )
//! .unwrap();
//!
//! let xs = Tensor::zeros(&[8, 4], Device::Cpu);
//! let ys = Tensor::from_vec(&[8, 2], [1.0, 0.0].repeat(8), Device::Cpu).unwrap();
//! let history = net.fit(&[&xs], &[&ys], 4, 2).unwrap();
//! assert_eq!(history.len(), 2);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod descriptors;
pub mod error;
pub mod graph;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod net;
pub mod ops;
pub mod optim;
pub mod tensor;

pub use error::{Error, Result};

/// Everything needed to define and train a network.
pub mod prelude {
    pub use crate::backend::{Device, DeviceKind};
    pub use crate::config::{BackendCaps, ComputeService};
    pub use crate::error::{Error, Result};
    pub use crate::graph::Graph;
    pub use crate::layers::{Activation, LayerId};
    pub use crate::losses::{CrossEntropy, Loss, MeanSquaredError, SoftCrossEntropy};
    pub use crate::metrics::{CategoricalAccuracy, Metric};
    pub use crate::net::{EpochStats, Network, Score};
    pub use crate::optim::{Optimizer, Sgd};
    pub use crate::tensor::{Tensor, TensorRef};
}
