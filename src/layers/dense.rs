//! Fully connected layer: `output = input x W + b`.
//!
//! Parameters are `[W, b]` with `W: [in, units]` and `b: [units]`.

use rand::rngs::StdRng;

use super::{Layer, glorot};
use crate::backend::Device;
use crate::error::{Error, Result};
use crate::ops::dispatch::Dispatcher;
use crate::tensor::{Tensor, TensorRef};

/// Output shape and freshly initialized parameters.
pub(crate) fn dense_params(
    input: &[usize],
    units: usize,
    use_bias: bool,
    device: Device,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<TensorRef>)> {
    if input.len() != 2 {
        return Err(Error::RankMismatch {
            op: "Dense",
            expected: 2,
            got: input.len(),
        });
    }
    if units == 0 {
        return Err(Error::config("Dense", "units must be positive"));
    }
    let features = input[1];
    let mut params = vec![glorot(&[features, units], features, units, device, rng)];
    if use_bias {
        params.push(Tensor::shared(&[units], device));
    }
    Ok((vec![input[0], units], params))
}

pub(super) fn forward(l: &Layer, ops: &Dispatcher, use_bias: bool) -> Result<()> {
    let input = l.input()?;
    ops.mult2d(input, false, &l.params[0], false, &l.output, false)?;
    if use_bias {
        ops.sum2d_rowwise(&l.output, &l.params[1], &l.output)?;
    }
    Ok(())
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher, use_bias: bool) -> Result<()> {
    let input = l.input()?;
    ops.mult2d(input, true, &l.delta, false, &l.grads[0], true)?;
    if use_bias {
        ops.reduce_sum2d(&l.delta, &l.grads[1], 0, true)?;
    }
    ops.mult2d(&l.delta, false, &l.params[0], true, l.parent_delta()?, true)
}
