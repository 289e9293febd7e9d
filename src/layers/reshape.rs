//! Reshape: same data, new per-sample shape.

use super::Layer;
use crate::error::Result;
use crate::ops::dispatch::Dispatcher;

pub(super) fn forward(l: &Layer, ops: &Dispatcher) -> Result<()> {
    ops.copy_flat(l.input()?, &l.output)
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher) -> Result<()> {
    ops.inc_flat(&l.delta, l.parent_delta()?)
}
