//! 2D max pooling. Output and argmax tensors belong to the descriptor.

use super::Layer;
use crate::descriptors::PoolDescriptor;
use crate::error::Result;
use crate::ops::dispatch::Dispatcher;

pub(super) fn forward(l: &Layer, ops: &Dispatcher, pd: &PoolDescriptor) -> Result<()> {
    ops.mpool2d(pd, l.input()?)
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher, pd: &PoolDescriptor) -> Result<()> {
    ops.mpool2d_back(pd, &l.delta, l.parent_delta()?)
}
