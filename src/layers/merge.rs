//! Elementwise sum of all parents.

use super::Layer;
use crate::error::Result;
use crate::ops::dispatch::Dispatcher;

pub(super) fn forward(l: &Layer, ops: &Dispatcher) -> Result<()> {
    let (first, rest) = l.inputs.split_first().ok_or_else(|| {
        crate::Error::config("Add", format!("{} has no inputs", l.name))
    })?;
    ops.copy(first, &l.output)?;
    for t in rest {
        ops.inc(t, &l.output)?;
    }
    Ok(())
}

pub(super) fn backward(l: &Layer, ops: &Dispatcher) -> Result<()> {
    for pd in &l.parent_deltas {
        ops.inc(&l.delta, pd)?;
    }
    Ok(())
}
