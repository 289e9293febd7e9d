//! Graph construction.
//!
//! [`Graph`] is an arena builder: every constructor takes parent handles,
//! computes the output shape (with a batch of 1), initializes parameters, and
//! returns the new layer's [`LayerId`]. Parent and child lists are kept
//! symmetric. The finished graph is handed to
//! [`Network::new`](crate::net::Network::new) together with the input and
//! output layers.
//!
//! ```rust
//! use briny_net::graph::Graph;
//!
//! let mut g = Graph::with_seed(7);
//! let x = g.input("x", &[4]).unwrap();
//! let h = g.dense("fc", x, 3).unwrap();
//! let y = g.softmax("probs", h).unwrap();
//! assert_eq!(g.layer(y).unwrap().output().shape(), vec![1, 3]);
//! ```

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::backend::Device;
use crate::descriptors::{ConvDescriptor, PoolDescriptor};
use crate::error::{Error, Result};
use crate::layers::{Activation, Layer, LayerId, LayerKind, conv_params, dense_params, sample_shape};

/// Layer arena under construction.
pub struct Graph {
    layers: Vec<Layer>,
    device: Device,
    rng: StdRng,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Empty graph on the CPU with an OS-seeded initializer.
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            device: Device::Cpu,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Empty graph with deterministic parameter initialization.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            layers: Vec::new(),
            device: Device::Cpu,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Device for layers created from now on.
    pub fn set_device(&mut self, device: Device) {
        self.device = device;
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.0)
    }

    /// First layer with the given name.
    pub fn find(&self, name: &str) -> Option<LayerId> {
        self.layers.iter().position(|l| l.name == name).map(LayerId)
    }

    pub(crate) fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::config("Graph", "layer name must not be empty"));
        }
        if self.find(name).is_some() {
            return Err(Error::config("Graph", format!("duplicate layer name {name:?}")));
        }
        Ok(())
    }

    fn parent(&self, id: LayerId) -> Result<&Layer> {
        self.layers
            .get(id.0)
            .ok_or_else(|| Error::config("Graph", format!("unknown parent layer {id}")))
    }

    fn push(&mut self, layer: Layer) -> LayerId {
        let id = LayerId(self.layers.len());
        for p in &layer.parents {
            self.layers[p.0].children.push(id);
        }
        self.layers.push(layer);
        id
    }

    /// Input layer for samples of `shape` (batch dimension excluded).
    pub fn input(&mut self, name: &str, shape: &[usize]) -> Result<LayerId> {
        self.check_name(name)?;
        if shape.is_empty() || shape.contains(&0) {
            return Err(Error::config("Input", format!("invalid sample shape {shape:?}")));
        }
        let mut full = vec![1];
        full.extend_from_slice(shape);
        let layer = Layer::new(name, LayerKind::Input, self.device, &[], &full, Vec::new());
        Ok(self.push(layer))
    }

    /// Fully connected layer with bias.
    pub fn dense(&mut self, name: &str, parent: LayerId, units: usize) -> Result<LayerId> {
        self.dense_with(name, parent, units, true)
    }

    pub fn dense_with(&mut self, name: &str, parent: LayerId, units: usize, use_bias: bool) -> Result<LayerId> {
        self.check_name(name)?;
        let p = self.layers.get(parent.0).ok_or_else(|| {
            Error::config("Graph", format!("unknown parent layer {parent}"))
        })?;
        let (shape, params) = dense_params(&p.output.shape(), units, use_bias, self.device, &mut self.rng)?;
        let layer = Layer::new(
            name,
            LayerKind::Dense { units, use_bias },
            self.device,
            &[(parent, p)],
            &shape,
            params,
        );
        Ok(self.push(layer))
    }

    pub fn activation(&mut self, name: &str, parent: LayerId, act: Activation) -> Result<LayerId> {
        self.check_name(name)?;
        let p = self.parent(parent)?;
        let layer = Layer::new(
            name,
            LayerKind::Activation(act),
            self.device,
            &[(parent, p)],
            &p.output.shape(),
            Vec::new(),
        );
        Ok(self.push(layer))
    }

    pub fn relu(&mut self, name: &str, parent: LayerId) -> Result<LayerId> {
        self.activation(name, parent, Activation::Relu)
    }

    pub fn sigmoid(&mut self, name: &str, parent: LayerId) -> Result<LayerId> {
        self.activation(name, parent, Activation::Sigmoid)
    }

    pub fn softmax(&mut self, name: &str, parent: LayerId) -> Result<LayerId> {
        self.activation(name, parent, Activation::Softmax)
    }

    /// 2D max pooling over `[N, C, H, W]` input.
    pub fn maxpool2d(
        &mut self,
        name: &str,
        parent: LayerId,
        kernel: &[usize],
        stride: &[usize],
        padding: &str,
    ) -> Result<LayerId> {
        self.pool(name, parent, PoolDescriptor::new(kernel, stride, padding)?)
    }

    /// 2D max pooling with fixed `[top, bottom, left, right]` padding.
    pub fn maxpool2d_padded(
        &mut self,
        name: &str,
        parent: LayerId,
        kernel: &[usize],
        stride: &[usize],
        padding: &[usize],
    ) -> Result<LayerId> {
        self.pool(name, parent, PoolDescriptor::with_padding(kernel, stride, padding)?)
    }

    fn pool(&mut self, name: &str, parent: LayerId, mut pd: PoolDescriptor) -> Result<LayerId> {
        self.check_name(name)?;
        let p = self.parent(parent)?;
        pd.build(&p.output.shape(), self.device)?;
        let layer = Layer::new(name, LayerKind::MaxPool2D(pd), self.device, &[(parent, p)], &[], Vec::new());
        Ok(self.push(layer))
    }

    /// 2D convolution with bias over `[N, C, H, W]` input.
    pub fn conv2d(
        &mut self,
        name: &str,
        parent: LayerId,
        filters: usize,
        kernel: &[usize],
        stride: &[usize],
        padding: &str,
    ) -> Result<LayerId> {
        self.check_name(name)?;
        let p = self.layers.get(parent.0).ok_or_else(|| {
            Error::config("Graph", format!("unknown parent layer {parent}"))
        })?;
        let mut desc = ConvDescriptor::new(filters, kernel, stride, padding)?;
        let params = conv_params(&mut desc, &p.output.shape(), true, self.device, &mut self.rng)?;
        let layer = Layer::new(
            name,
            LayerKind::Conv2D { desc, use_bias: true },
            self.device,
            &[(parent, p)],
            &[],
            params,
        );
        Ok(self.push(layer))
    }

    /// Reinterprets each sample as `shape`; element counts must agree.
    pub fn reshape(&mut self, name: &str, parent: LayerId, shape: &[usize]) -> Result<LayerId> {
        self.check_name(name)?;
        let p = self.parent(parent)?;
        let in_shape = p.output.shape();
        let sample = sample_shape(&in_shape);
        if sample.iter().product::<usize>() != shape.iter().product::<usize>() || shape.is_empty() {
            return Err(Error::ShapeMismatch {
                op: "Reshape",
                lhs: sample.to_vec(),
                rhs: shape.to_vec(),
            });
        }
        let mut full = vec![in_shape[0]];
        full.extend_from_slice(shape);
        let layer = Layer::new(
            name,
            LayerKind::Reshape(shape.to_vec()),
            self.device,
            &[(parent, p)],
            &full,
            Vec::new(),
        );
        Ok(self.push(layer))
    }

    /// Elementwise sum of equally shaped parents.
    pub fn add(&mut self, name: &str, parents: &[LayerId]) -> Result<LayerId> {
        self.check_name(name)?;
        let mut resolved = Vec::with_capacity(parents.len());
        for &id in parents {
            resolved.push((id, self.parent(id)?));
        }
        let Some((_, first)) = resolved.first() else {
            return Err(Error::config("Add", "needs at least one parent"));
        };
        let shape = first.output.shape();
        for (_, l) in &resolved[1..] {
            if l.output.shape() != shape {
                return Err(Error::ShapeMismatch {
                    op: "Add",
                    lhs: shape,
                    rhs: l.output.shape(),
                });
            }
        }
        let layer = Layer::new(name, LayerKind::Add, self.device, &resolved, &shape, Vec::new());
        Ok(self.push(layer))
    }

    /// Adds an extra edge `parent -> child` into an existing `Add` layer.
    ///
    /// This is the only way to close a loop in the graph; such a graph is
    /// rejected when the network is built.
    pub fn link(&mut self, parent: LayerId, child: LayerId) -> Result<()> {
        let (out, delta) = {
            let p = self.parent(parent)?;
            (p.output.clone(), p.delta.clone())
        };
        let c = self
            .layers
            .get_mut(child.0)
            .ok_or_else(|| Error::config("Graph", format!("unknown child layer {child}")))?;
        if !matches!(c.kind, LayerKind::Add) {
            return Err(Error::config(
                "Graph::link",
                format!("{} is a {} layer; only Add layers take extra parents", c.name, c.kind.name()),
            ));
        }
        if c.output.shape() != out.shape() {
            return Err(Error::ShapeMismatch {
                op: "Graph::link",
                lhs: c.output.shape(),
                rhs: out.shape(),
            });
        }
        c.parents.push(parent);
        c.inputs.push(out);
        c.parent_deltas.push(delta);
        self.layers[parent.0].children.push(child);
        Ok(())
    }
}
