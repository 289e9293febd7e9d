//! Loss functions.
//!
//! A [`Loss`] scores one network output against its target and seeds that
//! output's delta for the backward pass. Values are summed over the batch;
//! the network divides by the number of samples when it reports them.

use crate::error::Result;
use crate::ops::dispatch::Dispatcher;
use crate::tensor::Tensor;

pub trait Loss: Send + Sync {
    fn name(&self) -> &'static str;

    /// Batch-summed loss of `pred` against `target`.
    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32>;

    /// Writes `dL/dpred` into `delta`.
    fn delta(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor, delta: &Tensor) -> Result<()>;

    /// Whether `delta` is the gradient w.r.t. the logits of a preceding
    /// softmax rather than w.r.t. its probabilities.
    fn fuses_softmax(&self) -> bool {
        false
    }
}

fn scratch(like: &Tensor) -> Tensor {
    Tensor::zeros(&like.shape(), like.device())
}

/// `sum((pred - target)^2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mean_squared_error"
    }

    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32> {
        let diff = scratch(pred);
        ops.add(1.0, pred, -1.0, target, &diff, false)?;
        ops.el_mult(&diff, &diff, &diff, false)?;
        ops.total_sum(&diff)
    }

    fn delta(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor, delta: &Tensor) -> Result<()> {
        ops.add(2.0, pred, -2.0, target, delta, false)
    }
}

/// Elementwise binary cross-entropy, for sigmoid outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl Loss for CrossEntropy {
    fn name(&self) -> &'static str {
        "cross_entropy"
    }

    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32> {
        let c = scratch(pred);
        ops.cent(target, pred, &c)?;
        ops.total_sum(&c)
    }

    fn delta(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor, delta: &Tensor) -> Result<()> {
        ops.d_cent(target, pred, delta)
    }
}

/// Cross-entropy for softmax outputs.
///
/// Its delta is `pred - target`, the gradient w.r.t. the softmax input, so a
/// softmax output layer passes it through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftCrossEntropy;

impl Loss for SoftCrossEntropy {
    fn name(&self) -> &'static str {
        "soft_cross_entropy"
    }

    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32> {
        let c = scratch(pred);
        ops.cent(target, pred, &c)?;
        ops.total_sum(&c)
    }

    fn delta(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor, delta: &Tensor) -> Result<()> {
        ops.add(1.0, pred, -1.0, target, delta, false)
    }

    fn fuses_softmax(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;

    fn t(data: &[f32]) -> Tensor {
        Tensor::from_vec(&[1, data.len()], data.to_vec(), Device::Cpu).unwrap()
    }

    #[test]
    fn mse_value_and_delta() {
        let ops = Dispatcher::default();
        let (y, p) = (t(&[1.0, 0.0]), t(&[0.5, 0.5]));
        let v = MeanSquaredError.value(&ops, &y, &p).unwrap();
        assert!((v - 0.5).abs() < 1e-6);
        let d = t(&[0.0, 0.0]);
        MeanSquaredError.delta(&ops, &y, &p, &d).unwrap();
        assert_eq!(d.to_vec(), vec![-1.0, 1.0]);
    }

    #[test]
    fn soft_cross_entropy_delta_is_difference() {
        let ops = Dispatcher::default();
        let (y, p) = (t(&[0.0, 1.0]), t(&[0.25, 0.75]));
        let d = t(&[9.0, 9.0]);
        SoftCrossEntropy.delta(&ops, &y, &p, &d).unwrap();
        assert_eq!(d.to_vec(), vec![0.25, -0.25]);
        assert!(SoftCrossEntropy.fuses_softmax());
        assert!(!CrossEntropy.fuses_softmax());
    }

    #[test]
    fn cross_entropy_delta_sign() {
        let ops = Dispatcher::default();
        let (y, p) = (t(&[1.0, 0.0]), t(&[0.5, 0.5]));
        let d = t(&[0.0, 0.0]);
        CrossEntropy.delta(&ops, &y, &p, &d).unwrap();
        let d = d.to_vec();
        assert!(d[0] < 0.0 && d[1] > 0.0);
        assert!((d[0] + 2.0).abs() < 1e-4);
    }
}
