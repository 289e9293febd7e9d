//! Replica construction and weight synchronization.

use std::sync::Arc;

use log::{debug, info, trace};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use super::{Network, Phase, Score};
use crate::backend::Device;
use crate::error::{Error, Result};
use crate::layers::{Layer, LayerId, Replication};
use crate::tensor::{Tensor, TensorRef};

impl Network {
    /// Splits the current batch over one replica per entry of `devices`.
    ///
    /// Each replica gets `batch / devices.len()` samples; the last one also
    /// takes the remainder. Replicas on this network's device share its
    /// parameters, the others get their own copies. Calling `split` again
    /// first averages the old replicas back into this network.
    pub fn split(&mut self, devices: &[Device]) -> Result<()> {
        if self.phase == Phase::Unbuilt {
            return Err(Error::NotBuilt { op: "split" });
        }
        let c = devices.len();
        if c == 0 {
            return Err(Error::config("split", "no replica devices"));
        }
        if self.batch < c {
            return Err(Error::TooManyReplicas {
                replicas: c,
                batch: self.batch,
            });
        }
        if !self.replicas.is_empty() {
            self.sync_weights()?;
        }

        let bs = self.batch / c;
        let mut replicas = Vec::with_capacity(c);
        let mut xs = Vec::with_capacity(c);
        let mut ys = Vec::with_capacity(c);
        for (i, &device) in devices.iter().enumerate() {
            let n = if i == c - 1 { self.batch - bs * (c - 1) } else { bs };
            let mode = if device == self.device {
                Replication::Share
            } else {
                Replication::Clone(device)
            };
            xs.push(self.staging(&self.inputs, n));
            ys.push(self.staging(&self.outputs, n));
            let seed = self.rng.random();
            replicas.push(self.replica(mode, device, n, seed)?);
            debug!("replica {i}: {n} samples on {device} ({mode:?})");
        }

        self.replicas = replicas;
        self.xs = xs;
        self.ys = ys;
        self.pending_sync = 0;
        self.phase = Phase::Split;
        info!("split batch of {} into {} replicas", self.batch, c);
        Ok(())
    }

    fn staging(&self, ids: &[LayerId], n: usize) -> Vec<TensorRef> {
        ids.iter()
            .map(|id| {
                let mut shape = self.layers[id.0].output.shape();
                shape[0] = n;
                Tensor::shared(&shape, Device::Cpu)
            })
            .collect()
    }

    /// Replica layers, positionally aligned with `self.layers`.
    fn replica_layers(&self, mode: Replication, n: usize) -> Result<Vec<Layer>> {
        let mut slots: Vec<Option<Layer>> = (0..self.layers.len()).map(|_| None).collect();
        for &id in &self.fts {
            let orig = &self.layers[id.0];
            let mut inputs = Vec::with_capacity(orig.parents.len());
            let mut deltas = Vec::with_capacity(orig.parents.len());
            for p in &orig.parents {
                let parent = slots[p.0].as_ref().ok_or_else(|| Error::RecurrentNet {
                    component: "split",
                    remaining: self.layers.len() - id.0,
                })?;
                inputs.push(Arc::clone(&parent.output));
                deltas.push(Arc::clone(&parent.delta));
            }
            slots[id.0] = Some(orig.replicate(mode, n, inputs, deltas, id)?);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::config("split", "layer missing from the forward schedule"))
    }

    fn replica(&self, mode: Replication, device: Device, n: usize, seed: u64) -> Result<Network> {
        let layers = self.replica_layers(mode, n)?;
        let optimizer = match (mode, &self.optimizer) {
            (Replication::Clone(_), Some(o)) => {
                let mut o = o.box_clone();
                o.set_layers(&layers);
                Some(o)
            }
            _ => None,
        };
        let targets = self
            .outputs
            .iter()
            .map(|o| {
                let mut shape = self.layers[o.0].output.shape();
                shape[0] = n;
                Tensor::shared(&shape, device)
            })
            .collect();

        Ok(Network {
            layers,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            fts: self.fts.clone(),
            bts: self.bts.clone(),
            device,
            phase: Phase::Built,
            batch: n,
            optimizer,
            losses: self.losses.clone(),
            metrics: self.metrics.clone(),
            targets,
            scores: vec![Score::default(); self.outputs.len()],
            ops: Arc::clone(&self.ops),
            caps: self.caps.clone(),
            service: self.service.clone(),
            sync_interval: self.sync_interval,
            pending_sync: 0,
            replicas: Vec::new(),
            xs: Vec::new(),
            ys: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Whether replica `r` updates its own parameters.
    pub(super) fn owns_params(&self, r: &Network) -> bool {
        r.device != self.device
    }

    fn check_aligned(&self, j: usize) -> Result<()> {
        let layer = &self.layers[j];
        for (r, rep) in self.replicas.iter().enumerate() {
            let mismatch = |reason: String| Error::ReplicaMismatch {
                replica: r,
                layer: j,
                reason,
            };
            let rl = rep.layers.get(j).ok_or_else(|| mismatch("missing layer".into()))?;
            if rl.orig != Some(LayerId(j)) {
                return Err(mismatch(format!("made from {:?}", rl.orig)));
            }
            if rl.params.len() != layer.params.len() {
                return Err(mismatch(format!(
                    "{} params, expected {}",
                    rl.params.len(),
                    layer.params.len()
                )));
            }
            for (p, q) in layer.params.iter().zip(&rl.params) {
                if !Tensor::eqsize(p, q) {
                    return Err(mismatch(format!("param shape {:?} vs {:?}", q.shape(), p.shape())));
                }
            }
        }
        Ok(())
    }

    /// Replaces every parameter with the mean over all replicas and copies
    /// the result back to each replica.
    ///
    /// Parameters shared by every replica are left alone. No-op before a
    /// split.
    #[allow(clippy::cast_precision_loss)]
    pub fn sync_weights(&mut self) -> Result<()> {
        if self.replicas.is_empty() {
            return Ok(());
        }
        let n = self.replicas.len() as f32;
        for j in 0..self.layers.len() {
            if self.layers[j].params.is_empty() {
                continue;
            }
            self.check_aligned(j)?;
            for (k, p) in self.layers[j].params.iter().enumerate() {
                let theirs = |rep: &Network| Arc::clone(&rep.layers[j].params[k]);
                if self.replicas.iter().all(|r| Arc::ptr_eq(&theirs(r), p)) {
                    continue;
                }
                let acc = Tensor::zeros(&p.shape(), p.device());
                for rep in &self.replicas {
                    self.ops.inc(&theirs(rep), &acc)?;
                }
                self.ops.div(&acc, n)?;
                self.ops.copy(&acc, p)?;
                for rep in &self.replicas {
                    let q = theirs(rep);
                    if !Arc::ptr_eq(&q, p) {
                        self.ops.copy(p, &q)?;
                    }
                }
            }
        }
        self.pending_sync = 0;
        trace!("synchronized weights across {} replicas", self.replicas.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComputeService;
    use crate::graph::Graph;
    use crate::losses::MeanSquaredError;
    use crate::metrics;
    use crate::optim::Sgd;

    fn net() -> Network {
        let mut g = Graph::with_seed(4);
        let x = g.input("x", &[3]).unwrap();
        let y = g.dense("y", x, 2).unwrap();
        let mut net = Network::new(g, &[x], &[y]).unwrap();
        net.build(
            Box::new(Sgd::new(0.1)),
            vec![Box::new(MeanSquaredError)],
            vec![Box::new(metrics::MeanSquaredError)],
            ComputeService::fpga(vec![true, true]),
        )
        .unwrap();
        net.resize(4).unwrap();
        net.split(&[Device::Fpga(0), Device::Fpga(1)]).unwrap();
        net
    }

    #[test]
    fn misaligned_replica_is_reported() {
        let mut net = net();
        net.replicas[1].layers[1].orig = Some(LayerId(0));
        assert!(matches!(
            net.sync_weights(),
            Err(Error::ReplicaMismatch { replica: 1, layer: 1, .. })
        ));
    }

    #[test]
    fn sync_averages_diverged_replicas() {
        let net = {
            let mut n = net();
            n.ops.fill(&n.replicas[0].layers[1].params[1], 1.0).unwrap();
            n.ops.fill(&n.replicas[1].layers[1].params[1], 3.0).unwrap();
            n.sync_weights().unwrap();
            n
        };
        assert_eq!(net.layers[1].params[1].to_vec(), vec![2.0, 2.0]);
        for rep in &net.replicas {
            assert_eq!(rep.layers[1].params[1].to_vec(), vec![2.0, 2.0]);
        }
    }
}
