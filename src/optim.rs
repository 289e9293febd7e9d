//! Optimizers.
//!
//! An optimizer is bound to a layer list with [`Optimizer::set_layers`] and
//! then applies the gradients accumulated in those layers. Gradients are
//! summed over the batch by the backward pass, so `apply_gradients` takes the
//! batch size and averages before stepping. Gradients are zeroed afterwards.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layers::Layer;
use crate::ops::dispatch::Dispatcher;
use crate::tensor::{Tensor, TensorRef};

pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Binds the optimizer to the parameters and gradients of `layers`.
    fn set_layers(&mut self, layers: &[Layer]);

    fn apply_gradients(&mut self, batch: usize, ops: &Dispatcher) -> Result<()>;

    /// Same hyper-parameters, no bound layers and no state.
    fn box_clone(&self) -> Box<dyn Optimizer>;
}

struct Slot {
    param: TensorRef,
    grad: TensorRef,
    velocity: Option<Tensor>,
}

/// Stochastic gradient descent with optional momentum.
///
/// `v = momentum * v - lr * g; p += v`
pub struct Sgd {
    lr: f32,
    momentum: f32,
    slots: Vec<Slot>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            slots: Vec::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn set_layers(&mut self, layers: &[Layer]) {
        self.slots = layers
            .iter()
            .flat_map(|l| l.params().iter().zip(l.grads()))
            .map(|(p, g)| Slot {
                param: Arc::clone(p),
                grad: Arc::clone(g),
                velocity: (self.momentum != 0.0).then(|| Tensor::zeros(&p.shape(), p.device())),
            })
            .collect();
    }

    #[allow(clippy::cast_precision_loss)]
    fn apply_gradients(&mut self, batch: usize, ops: &Dispatcher) -> Result<()> {
        if batch == 0 {
            return Err(Error::config("Sgd", "batch size must be positive"));
        }
        let inv = 1.0 / batch as f32;
        for s in &self.slots {
            ops.scale(&s.grad, inv, &s.grad)?;
            match &s.velocity {
                Some(v) => {
                    ops.add(self.momentum, v, -self.lr, &s.grad, v, false)?;
                    ops.inc(v, &s.param)?;
                }
                None => ops.add(1.0, &s.param, -self.lr, &s.grad, &s.param, false)?,
            }
            ops.fill(&s.grad, 0.0)?;
        }
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Optimizer> {
        Box::new(Sgd::with_momentum(self.lr, self.momentum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn sgd_steps_against_mean_gradient() {
        let mut g = Graph::with_seed(1);
        let x = g.input("x", &[2]).unwrap();
        let d = g.dense("fc", x, 1).unwrap();
        let layers = g.into_layers();
        let fc = &layers[d.index()];
        let before = fc.params()[1].to_vec();

        let ops = Dispatcher::default();
        ops.fill(&fc.grads()[1], 4.0).unwrap();
        let mut opt = Sgd::new(0.5);
        opt.set_layers(&layers);
        opt.apply_gradients(2, &ops).unwrap();

        let after = fc.params()[1].to_vec();
        assert!((after[0] - (before[0] - 1.0)).abs() < 1e-6);
        assert_eq!(fc.grads()[1].to_vec(), vec![0.0]);
    }
}
