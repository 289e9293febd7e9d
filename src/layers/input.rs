//! Input layers hold the batch copied in by the network; nothing to compute.

use super::Layer;
use crate::error::Result;

pub(super) fn forward(_layer: &Layer) -> Result<()> {
    Ok(())
}
