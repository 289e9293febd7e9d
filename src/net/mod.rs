//! Networks: graph validation, scheduling, and training.
//!
//! A [`Network`] owns the layer arena produced by a
//! [`Graph`](crate::graph::Graph). Construction keeps only the layers
//! reachable from the inputs and renumbers them in discovery order; `build`
//! computes the forward and backward schedules, binds losses, metrics and the
//! optimizer, and configures the compute service.
//!
//! Training always runs through replicas. A replica is a structurally
//! identical network over a slice of the batch, on one device of the compute
//! service. Same-device replicas alias the parent's parameters and gradients;
//! replicas on other devices own copies that are averaged back into the parent
//! by [`Network::sync_weights`].

mod schedule;
mod split;
mod train;

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use briny::prelude::*;
use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::backend::{Device, DeviceKind};
use crate::config::{BackendCaps, ComputeService};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::layers::{Activation, Layer, LayerId, LayerKind};
use crate::losses::Loss;
use crate::metrics::Metric;
use crate::ops::dispatch::Dispatcher;
use crate::optim::Optimizer;
use crate::tensor::{Tensor, TensorRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unbuilt,
    Built,
    Split,
}

/// Loss and metric value for one network output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Score {
    pub loss: f32,
    pub metric: f32,
}

/// Per-epoch summary returned by [`Network::fit`].
#[derive(Debug, Clone)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean loss and metric per sample, one entry per output.
    pub scores: Vec<Score>,
    pub elapsed: Duration,
}

impl fmt::Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.epoch)?;
        for (j, s) in self.scores.iter().enumerate() {
            write!(f, " | out{j}: loss={:.4} metric={:.4}", s.loss, s.metric)?;
        }
        write!(f, " ({:.2?})", self.elapsed)
    }
}

/// A layer graph with its schedules, training state and replicas.
pub struct Network {
    layers: Vec<Layer>,
    inputs: Vec<LayerId>,
    outputs: Vec<LayerId>,
    fts: Vec<LayerId>,
    bts: Vec<LayerId>,
    device: Device,
    phase: Phase,
    batch: usize,

    optimizer: Option<Box<dyn Optimizer>>,
    losses: Vec<Arc<dyn Loss>>,
    metrics: Vec<Arc<dyn Metric>>,
    targets: Vec<TensorRef>,
    scores: Vec<Score>,

    ops: Arc<Dispatcher>,
    caps: BackendCaps,
    service: ComputeService,
    sync_interval: usize,
    pending_sync: usize,

    replicas: Vec<Network>,
    /// Host staging tensors, per replica and input/output.
    xs: Vec<Vec<TensorRef>>,
    ys: Vec<Vec<TensorRef>>,

    rng: StdRng,
}

impl Network {
    /// Takes every layer reachable from `inputs` as the network.
    ///
    /// Fails if an input is not an `Input` layer, if an output is not
    /// reachable, or if a reachable layer has a parent that is not.
    ///
    /// Layers are renumbered in discovery order, so ids handed out by the
    /// graph are not valid here; look layers up with
    /// [`Network::get_layer`], [`Network::inputs`] or [`Network::outputs`].
    pub fn new(graph: Graph, inputs: &[LayerId], outputs: &[LayerId]) -> Result<Self> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(Error::config("Network", "needs at least one input and one output"));
        }
        let layers = graph.into_layers();
        for &id in inputs.iter().chain(outputs) {
            if id.0 >= layers.len() {
                return Err(Error::config("Network", format!("unknown layer {id}")));
            }
        }
        for &id in inputs {
            if !layers[id.0].is_input() {
                return Err(Error::config(
                    "Network",
                    format!("{} is a {} layer, not an Input", layers[id.0].name, layers[id.0].kind.name()),
                ));
            }
        }

        let order = schedule::discover(&layers, inputs);
        let mut remap = vec![None; layers.len()];
        for (new, id) in order.iter().enumerate() {
            remap[id.0] = Some(LayerId(new));
        }
        let lookup = |id: LayerId, layers: &[Layer]| {
            remap[id.0].ok_or_else(|| {
                Error::config(
                    "Network",
                    format!("layer {} is not reachable from the inputs", layers[id.0].name),
                )
            })
        };

        for id in &order {
            for &p in &layers[id.0].parents {
                lookup(p, &layers)?;
            }
        }
        let inputs = inputs.iter().map(|&id| lookup(id, &layers)).collect::<Result<Vec<_>>>()?;
        let outputs = outputs.iter().map(|&id| lookup(id, &layers)).collect::<Result<Vec<_>>>()?;

        let mut slots: Vec<Option<Layer>> = layers.into_iter().map(Some).collect();
        let mut arena = Vec::with_capacity(order.len());
        for id in &order {
            let Some(mut l) = slots[id.0].take() else {
                continue;
            };
            l.parents = l.parents.iter().filter_map(|p| remap[p.0]).collect();
            l.children = l.children.iter().filter_map(|c| remap[c.0]).collect();
            arena.push(l);
        }

        let device = arena
            .iter()
            .find(|l| !l.is_input())
            .map_or(Device::Cpu, |l| l.device);
        let batch = arena[inputs[0].0].output.batch();

        debug!("network: {} layers reachable from {} inputs", arena.len(), inputs.len());
        Ok(Self {
            layers: arena,
            inputs,
            outputs,
            fts: Vec::new(),
            bts: Vec::new(),
            device,
            phase: Phase::Unbuilt,
            batch,
            optimizer: None,
            losses: Vec::new(),
            metrics: Vec::new(),
            targets: Vec::new(),
            scores: Vec::new(),
            ops: Arc::new(Dispatcher::default()),
            caps: BackendCaps::default(),
            service: ComputeService::default(),
            sync_interval: 1,
            pending_sync: 0,
            replicas: Vec::new(),
            xs: Vec::new(),
            ys: Vec::new(),
            rng: StdRng::from_os_rng(),
        })
    }

    /// Reseeds the sampler used by [`Network::fit`].
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Replaces the emulation rules. Only allowed before `build`.
    pub fn set_backend_caps(&mut self, caps: BackendCaps) -> Result<()> {
        if self.phase != Phase::Unbuilt {
            return Err(Error::config("set_backend_caps", "network is already built"));
        }
        self.caps = TrustedData::new(caps)
            .map_err(|_| Error::Validation("backend caps force ops onto a disabled host path".into()))?
            .into_inner();
        Ok(())
    }

    /// Binds training components, schedules the graph and sets up replicas.
    ///
    /// `losses` and `metrics` take one entry per output, in output order.
    pub fn build(
        &mut self,
        optimizer: Box<dyn Optimizer>,
        losses: Vec<Box<dyn Loss>>,
        metrics: Vec<Box<dyn Metric>>,
        service: ComputeService,
    ) -> Result<()> {
        if self.phase != Phase::Unbuilt {
            return Err(Error::config("build", "network is already built"));
        }
        if losses.len() != self.outputs.len() {
            return Err(Error::config(
                "build",
                format!("{} losses for {} outputs", losses.len(), self.outputs.len()),
            ));
        }
        if metrics.len() != self.outputs.len() {
            return Err(Error::config(
                "build",
                format!("{} metrics for {} outputs", metrics.len(), self.outputs.len()),
            ));
        }
        for l in &self.layers {
            if l.device != self.device {
                return Err(Error::DeviceMismatch {
                    op: "build",
                    lhs: self.device,
                    rhs: l.device,
                });
            }
        }

        self.fts = schedule::forward_order(&self.layers)?;
        self.bts = schedule::backward_order(&self.layers)?;

        self.losses = losses.into_iter().map(Arc::from).collect();
        self.metrics = metrics.into_iter().map(Arc::from).collect();
        self.targets = self
            .outputs
            .iter()
            .map(|o| Tensor::shared(&self.layers[o.0].output.shape(), self.device))
            .collect();
        self.scores = vec![Score::default(); self.outputs.len()];

        for (o, loss) in self.outputs.iter().zip(&self.losses) {
            let l = &mut self.layers[o.0];
            if loss.fuses_softmax() && matches!(l.kind, LayerKind::Activation(Activation::Softmax)) {
                debug!("{}: fusing softmax with {}", l.name, loss.name());
                l.delta_bypass = true;
            }
        }

        let mut optimizer = optimizer;
        optimizer.set_layers(&self.layers);
        self.optimizer = Some(optimizer);
        self.ops = Arc::new(Dispatcher::new(&self.caps));

        info!(
            "built network: {} layers, {} inputs, {} outputs, optimizer {}",
            self.layers.len(),
            self.inputs.len(),
            self.outputs.len(),
            self.optimizer.as_ref().map_or("none", |o| o.name())
        );
        self.set_compserv(service)
    }

    /// Validates and records the compute service, then splits the network
    /// when the current batch is large enough; otherwise the split happens on
    /// the first resize to a usable batch.
    fn set_compserv(&mut self, service: ComputeService) -> Result<()> {
        let service = TrustedData::new(service)
            .map_err(|_| Error::Validation("compute service selects no usable device".into()))?
            .into_inner();
        match service.kind() {
            None => return Err(Error::Distributed),
            Some(DeviceKind::Gpu) => check_gpus(&service.replica_devices())?,
            Some(_) => {}
        }
        self.sync_interval = service.sync_interval();
        self.service = service;
        self.phase = Phase::Built;

        let devices = self.service.replica_devices();
        let names: Vec<String> = devices.iter().map(ToString::to_string).collect();
        info!("net running on {} (parameters on {})", names.join(", "), self.device);
        if devices.len() <= self.batch {
            self.split(&devices)
        } else {
            debug!(
                "deferring split into {} replicas until batch >= {} (now {})",
                devices.len(),
                devices.len(),
                self.batch
            );
            Ok(())
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.0)
    }

    pub fn get_layer(&self, name: &str) -> Result<&Layer> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::LayerNotFound(name.to_string()))
    }

    pub fn inputs(&self) -> &[LayerId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[LayerId] {
        &self.outputs
    }

    /// Forward schedule; empty before `build`.
    pub fn fts(&self) -> &[LayerId] {
        &self.fts
    }

    /// Backward schedule; empty before `build`.
    pub fn bts(&self) -> &[LayerId] {
        &self.bts
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn is_built(&self) -> bool {
        self.phase != Phase::Unbuilt
    }

    pub fn replicas(&self) -> &[Network] {
        &self.replicas
    }

    pub fn compute_service(&self) -> &ComputeService {
        &self.service
    }

    /// Accumulated per-output scores since the last reset.
    pub fn scores(&self) -> &[Score] {
        &self.scores
    }

    /// Target tensors, one per output.
    pub fn targets(&self) -> &[TensorRef] {
        &self.targets
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.ops
    }

    /// Layer table in schedule order (discovery order before `build`).
    pub fn summary(&self) -> String {
        let order: Vec<LayerId> = if self.fts.is_empty() {
            (0..self.layers.len()).map(LayerId).collect()
        } else {
            self.fts.clone()
        };
        let mut out = String::new();
        let mut total = 0;
        for id in order {
            let l = &self.layers[id.0];
            total += l.params.iter().map(|p| p.size()).sum::<usize>();
            let _ = writeln!(out, "{}", l.describe());
        }
        let _ = writeln!(out, "total params: {total}");
        out
    }

    /// Graphviz rendering of the layer graph.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph network {\n");
        for l in &self.layers {
            let _ = writeln!(out, "  \"{}\" [label=\"{}\\n{}\"];", l.name, l.name, l.kind.name());
        }
        for l in &self.layers {
            for c in &l.children {
                let _ = writeln!(out, "  \"{}\" -> \"{}\";", l.name, self.layers[c.0].name);
            }
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("layers", &self.layers.len())
            .field("device", &self.device)
            .field("phase", &self.phase)
            .field("batch", &self.batch)
            .field("replicas", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "wgpu")]
fn check_gpus(devices: &[Device]) -> Result<()> {
    let available = crate::ops::wgpu::adapter_count();
    for d in devices {
        if let Device::Gpu(i) = d {
            if *i >= available {
                return Err(Error::config(
                    "set_compserv",
                    format!("GPU {i} selected but only {available} adapters found"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "wgpu"))]
fn check_gpus(_devices: &[Device]) -> Result<()> {
    Err(Error::NotCompiled { backend: "wgpu" })
}
