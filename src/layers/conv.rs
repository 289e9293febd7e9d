//! 2D convolution.
//!
//! Parameters are `[K, b]` with `K: [filters, channels, kh, kw]` and
//! `b: [filters]`. Geometry and the output tensor live in the
//! [`ConvDescriptor`].

use rand::rngs::StdRng;

use super::{Layer, glorot};
use crate::backend::Device;
use crate::descriptors::ConvDescriptor;
use crate::error::Result;
use crate::ops::dispatch::Dispatcher;
use crate::tensor::{Tensor, TensorRef};

/// Builds the descriptor against `input` and initializes the parameters.
pub(crate) fn conv_params(
    desc: &mut ConvDescriptor,
    input: &[usize],
    use_bias: bool,
    device: Device,
    rng: &mut StdRng,
) -> Result<Vec<TensorRef>> {
    desc.build(input, device)?;
    let [kh, kw] = desc.kernel();
    let (filters, channels) = (desc.filters(), input[1]);
    let mut params = vec![glorot(
        &[filters, channels, kh, kw],
        channels * kh * kw,
        filters * kh * kw,
        device,
        rng,
    )];
    if use_bias {
        params.push(Tensor::shared(&[filters], device));
    }
    Ok(params)
}

pub(super) fn forward(l: &Layer, ops: &Dispatcher, desc: &ConvDescriptor, use_bias: bool) -> Result<()> {
    let bias = if use_bias { l.params.get(1).map(|p| &**p) } else { None };
    ops.conv2d(desc, l.input()?, &l.params[0], bias)
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher, desc: &ConvDescriptor, use_bias: bool) -> Result<()> {
    ops.conv2d_grad(desc, l.input()?, &l.delta, &l.grads[0])?;
    if use_bias {
        ops.conv2d_bias_grad(desc, &l.delta, &l.grads[1])?;
    }
    ops.conv2d_back(desc, &l.delta, &l.params[0], l.parent_delta()?)
}
