//! Evaluation metrics. Like losses, values are summed over the batch.

use crate::error::Result;
use crate::losses::{self, Loss};
use crate::ops::dispatch::Dispatcher;
use crate::tensor::Tensor;

pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;

    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32>;
}

/// Number of samples whose predicted class (argmax) matches the target's.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoricalAccuracy;

impl Metric for CategoricalAccuracy {
    fn name(&self) -> &'static str {
        "categorical_accuracy"
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32> {
        Ok(ops.accuracy(target, pred)? as f32)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Metric for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mean_squared_error"
    }

    fn value(&self, ops: &Dispatcher, target: &Tensor, pred: &Tensor) -> Result<f32> {
        losses::MeanSquaredError.value(ops, target, pred)
    }
}
