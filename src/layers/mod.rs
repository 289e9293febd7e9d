//! Layer graph nodes.
//!
//! A [`Layer`] is one record in the network's arena. Graph edges are
//! [`LayerId`] lists into that arena; the only shared state between
//! neighbours is tensors: a layer's `inputs` are its parents' `output`
//! tensors, and its `parent_deltas` are its parents' `delta` tensors, so
//! `backward` can accumulate straight into them.
//!
//! The set of operations is closed ([`LayerKind`]); each variant's math lives
//! in its own submodule and is reached through [`Layer::forward`] and
//! [`Layer::backward`].

mod activation;
mod conv;
mod dense;
mod input;
mod merge;
mod pool;
mod reshape;

use std::fmt;

use rand::rngs::StdRng;

use crate::backend::Device;
use crate::descriptors::{ConvDescriptor, PoolDescriptor, Window2d};
use crate::error::{Error, Result};
use crate::ops::dispatch::Dispatcher;
use crate::tensor::{Tensor, TensorRef};

pub(crate) use conv::conv_params;
pub(crate) use dense::dense_params;

/// Index of a layer inside a [`Graph`](crate::graph::Graph) or
/// [`Network`](crate::net::Network) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pointwise non-linearities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
    /// Softmax over all non-batch dimensions.
    Softmax,
}

impl Activation {
    pub fn name(self) -> &'static str {
        match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        }
    }
}

/// The closed set of layer operations.
#[derive(Debug)]
pub enum LayerKind {
    /// Receives a batch of samples; has no parents.
    Input,
    /// `y = x W (+ b)` over `[batch, features]` input.
    Dense { units: usize, use_bias: bool },
    Activation(Activation),
    MaxPool2D(PoolDescriptor),
    Conv2D { desc: ConvDescriptor, use_bias: bool },
    /// Per-sample target shape (batch dimension excluded).
    Reshape(Vec<usize>),
    /// Elementwise sum of all parents.
    Add,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input => "Input",
            LayerKind::Dense { .. } => "Dense",
            LayerKind::Activation(_) => "Activation",
            LayerKind::MaxPool2D(_) => "MaxPool2D",
            LayerKind::Conv2D { .. } => "Conv2D",
            LayerKind::Reshape(_) => "Reshape",
            LayerKind::Add => "Add",
        }
    }

    /// Same operation, with descriptors rebuilt for `batch` on `device`.
    fn replicate(&self, batch: usize, device: Device) -> Result<Self> {
        Ok(match self {
            LayerKind::Input => LayerKind::Input,
            LayerKind::Dense { units, use_bias } => LayerKind::Dense {
                units: *units,
                use_bias: *use_bias,
            },
            LayerKind::Activation(a) => LayerKind::Activation(*a),
            LayerKind::MaxPool2D(pd) => LayerKind::MaxPool2D(pd.rebuild(batch, device)?),
            LayerKind::Conv2D { desc, use_bias } => LayerKind::Conv2D {
                desc: desc.rebuild(batch, device)?,
                use_bias: *use_bias,
            },
            LayerKind::Reshape(s) => LayerKind::Reshape(s.clone()),
            LayerKind::Add => LayerKind::Add,
        })
    }

    /// Output tensor owned by a descriptor, if this kind has one.
    fn descriptor_output(&self) -> Option<TensorRef> {
        match self {
            LayerKind::MaxPool2D(pd) => pd.output().cloned(),
            LayerKind::Conv2D { desc, .. } => desc.output().cloned(),
            _ => None,
        }
    }
}

/// How a replica layer relates to the layer it was made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replication {
    /// Same device: alias parameters and gradients.
    Share,
    /// Other device: independent parameter storage, zeroed gradients.
    Clone(Device),
}

/// One node of the layer graph.
pub struct Layer {
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) device: Device,
    pub(crate) parents: Vec<LayerId>,
    pub(crate) children: Vec<LayerId>,
    pub(crate) inputs: Vec<TensorRef>,
    pub(crate) parent_deltas: Vec<TensorRef>,
    pub(crate) output: TensorRef,
    pub(crate) delta: TensorRef,
    pub(crate) params: Vec<TensorRef>,
    pub(crate) grads: Vec<TensorRef>,
    pub(crate) orig: Option<LayerId>,
    /// Set when an output softmax is paired with soft cross-entropy: the
    /// seeded delta already is the gradient w.r.t. the softmax input.
    pub(crate) delta_bypass: bool,
}

impl Layer {
    pub(crate) fn new(
        name: &str,
        kind: LayerKind,
        device: Device,
        parents: &[(LayerId, &Layer)],
        output_shape: &[usize],
        params: Vec<TensorRef>,
    ) -> Self {
        let output = kind
            .descriptor_output()
            .unwrap_or_else(|| Tensor::shared(output_shape, device));
        let delta = Tensor::shared(&output.shape(), device);
        let grads = params
            .iter()
            .map(|p| Tensor::shared(&p.shape(), p.device()))
            .collect();
        Self {
            name: name.to_string(),
            kind,
            device,
            parents: parents.iter().map(|(id, _)| *id).collect(),
            children: Vec::new(),
            inputs: parents.iter().map(|(_, l)| l.output.clone()).collect(),
            parent_deltas: parents.iter().map(|(_, l)| l.delta.clone()).collect(),
            output,
            delta,
            params,
            grads,
            orig: None,
            delta_bypass: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn parents(&self) -> &[LayerId] {
        &self.parents
    }

    pub fn children(&self) -> &[LayerId] {
        &self.children
    }

    pub fn output(&self) -> &TensorRef {
        &self.output
    }

    pub fn delta(&self) -> &TensorRef {
        &self.delta
    }

    /// Trainable parameters, in a fixed per-kind order.
    pub fn params(&self) -> &[TensorRef] {
        &self.params
    }

    /// One gradient tensor per parameter, same order.
    pub fn grads(&self) -> &[TensorRef] {
        &self.grads
    }

    /// The layer this one was replicated from.
    pub fn orig(&self) -> Option<LayerId> {
        self.orig
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input)
    }

    fn input(&self) -> Result<&TensorRef> {
        self.inputs.first().ok_or_else(|| {
            Error::config("Layer", format!("{} has no input", self.name))
        })
    }

    fn parent_delta(&self) -> Result<&TensorRef> {
        self.parent_deltas.first().ok_or_else(|| {
            Error::config("Layer", format!("{} has no parent delta", self.name))
        })
    }

    /// Computes `output` from the inputs and current parameters.
    pub fn forward(&self, ops: &Dispatcher) -> Result<()> {
        match &self.kind {
            LayerKind::Input => input::forward(self),
            LayerKind::Dense { use_bias, .. } => dense::forward(self, ops, *use_bias),
            LayerKind::Activation(a) => activation::forward(self, ops, *a),
            LayerKind::MaxPool2D(pd) => pool::forward(self, ops, pd),
            LayerKind::Conv2D { desc, use_bias } => conv::forward(self, ops, desc, *use_bias),
            LayerKind::Reshape(_) => reshape::forward(self, ops),
            LayerKind::Add => merge::forward(self, ops),
        }
    }

    /// Accumulates into parent deltas and own gradients from `delta`.
    pub fn backward(&self, ops: &Dispatcher) -> Result<()> {
        match &self.kind {
            LayerKind::Input => Ok(()),
            LayerKind::Dense { use_bias, .. } => dense::backward(self, ops, *use_bias),
            LayerKind::Activation(a) => activation::backward(self, ops, *a),
            LayerKind::MaxPool2D(pd) => pool::backward(self, ops, pd),
            LayerKind::Conv2D { desc, use_bias } => conv::backward(self, ops, desc, *use_bias),
            LayerKind::Reshape(_) => reshape::backward(self, ops),
            LayerKind::Add => merge::backward(self, ops),
        }
    }

    /// Zeroes `delta` before a new backward pass.
    pub fn reset(&self, ops: &Dispatcher) -> Result<()> {
        ops.fill(&self.delta, 0.0)
    }

    /// Moves the batch dimension of every owned tensor.
    pub fn resize(&mut self, batch: usize) -> Result<()> {
        match &mut self.kind {
            LayerKind::MaxPool2D(pd) => pd.resize(batch)?,
            LayerKind::Conv2D { desc, .. } => desc.resize(batch)?,
            _ => self.output.resize_batch(batch),
        }
        self.delta.resize_batch(batch);
        Ok(())
    }

    /// Builds the counterpart of this layer inside a replica.
    ///
    /// `inputs` and `parent_deltas` are the replica parents' tensors, in the
    /// same order as `self.parents`.
    pub fn replicate(
        &self,
        mode: Replication,
        batch: usize,
        inputs: Vec<TensorRef>,
        parent_deltas: Vec<TensorRef>,
        orig: LayerId,
    ) -> Result<Layer> {
        let device = match mode {
            Replication::Share => self.device,
            Replication::Clone(d) => d,
        };
        let kind = self.kind.replicate(batch, device)?;
        let output = kind.descriptor_output().unwrap_or_else(|| {
            let mut shape = self.output.shape();
            shape[0] = batch;
            Tensor::shared(&shape, device)
        });
        let delta = Tensor::shared(&output.shape(), device);
        let (params, grads) = match mode {
            Replication::Share => (self.params.clone(), self.grads.clone()),
            Replication::Clone(d) => (
                self.params.iter().map(|p| std::sync::Arc::new(p.duplicate(d))).collect(),
                self.params.iter().map(|p| Tensor::shared(&p.shape(), d)).collect(),
            ),
        };

        Ok(Layer {
            name: self.name.clone(),
            kind,
            device,
            parents: self.parents.clone(),
            children: self.children.clone(),
            inputs,
            parent_deltas,
            output,
            delta,
            params,
            grads,
            orig: Some(orig),
            delta_bypass: self.delta_bypass,
        })
    }

    /// One-line description: name, kind, output shape, parameter count.
    pub fn describe(&self) -> String {
        let detail = match &self.kind {
            LayerKind::Dense { units, .. } => format!("Dense({units})"),
            LayerKind::Activation(a) => format!("Activation({})", a.name()),
            LayerKind::MaxPool2D(pd) => format!(
                "MaxPool2D(k={:?}, s={:?}, {} windows)",
                pd.kernel(),
                pd.stride(),
                pd.window().map_or(0, Window2d::positions)
            ),
            LayerKind::Conv2D { desc, .. } => format!("Conv2D({}, k={:?})", desc.filters(), desc.kernel()),
            other => other.name().to_string(),
        };
        let nparams: usize = self.params.iter().map(|p| p.size()).sum();
        format!(
            "{:<16} {:<28} {:?} params={} on {}",
            self.name,
            detail,
            self.output.shape(),
            nparams,
            self.device
        )
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("kind", &self.kind.name())
            .field("device", &self.device)
            .field("parents", &self.parents)
            .field("children", &self.children)
            .field("orig", &self.orig)
            .finish_non_exhaustive()
    }
}

/// Shape of a parent output with the batch dimension dropped.
pub(crate) fn sample_shape(shape: &[usize]) -> &[usize] {
    shape.get(1..).unwrap_or(&[])
}

/// Glorot-uniform initialization.
pub(crate) fn glorot(shape: &[usize], fan_in: usize, fan_out: usize, device: Device, rng: &mut StdRng) -> TensorRef {
    use rand::Rng;
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let size = shape.iter().product();
    let data = (0..size).map(|_| rng.random_range(-limit..=limit)).collect();
    // size matches shape by construction
    std::sync::Arc::new(
        Tensor::from_vec(shape, data, device).unwrap_or_else(|_| Tensor::zeros(shape, device)),
    )
}
