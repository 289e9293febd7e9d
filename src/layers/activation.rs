//! Pointwise activations.

use super::{Activation, Layer};
use crate::error::Result;
use crate::ops::dispatch::Dispatcher;

pub(super) fn forward(l: &Layer, ops: &Dispatcher, act: Activation) -> Result<()> {
    let input = l.input()?;
    match act {
        Activation::Relu => ops.relu(input, &l.output),
        Activation::Sigmoid => ops.sigmoid(input, &l.output),
        Activation::Softmax => ops.softmax(input, &l.output),
    }
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher, act: Activation) -> Result<()> {
    let pd = l.parent_delta()?;
    if l.delta_bypass {
        return ops.inc(&l.delta, pd);
    }
    match act {
        Activation::Relu => ops.d_relu(&l.delta, l.input()?, pd),
        Activation::Sigmoid => ops.d_sigmoid(&l.delta, &l.output, pd),
        Activation::Softmax => ops.d_softmax(&l.delta, &l.output, pd),
    }
}
