//! FPGA kernel set.
//!
//! No native bitstream kernels are wired in, so every operation reports as
//! unsupported and the dispatcher runs it through
//! [`Emulated`](super::emulation::Emulated). With emulation disabled for FPGA
//! in [`BackendCaps`](crate::config::BackendCaps), any FPGA operation fails
//! with `NotImplemented`.

use super::{Kernels, Op};

#[derive(Debug, Default, Clone, Copy)]
pub struct FpgaKernels;

impl Kernels for FpgaKernels {
    fn name(&self) -> &'static str {
        "FPGA"
    }

    fn supports(&self, _op: Op) -> bool {
        false
    }
}
