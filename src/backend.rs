//! Device tags.
//!
//! Every tensor and layer is bound to one [`Device`]. The device decides which
//! kernel set executes an operation; see [`crate::ops::dispatch`].
//!
//! # Supported Backends
//!
//! - `Cpu`: rayon-parallel kernels, always available.
//! - `Gpu`: `wgpu` compute shaders (feature `wgpu`), with CPU emulation for
//!   kernels that have no shader.
//! - `Fpga`: no native kernels yet; every operation runs through CPU emulation.

use core::fmt;

/// The execution target of a tensor or layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host CPU (default).
    #[default]
    Cpu,
    /// GPU with the given adapter index.
    Gpu(usize),
    /// FPGA card with the given index.
    Fpga(usize),
}

/// Device family, without the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Fpga,
}

impl Device {
    /// Returns the family of this device.
    pub fn kind(self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Gpu(_) => DeviceKind::Gpu,
            Device::Fpga(_) => DeviceKind::Fpga,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(i) => write!(f, "GPU:{i}"),
            Device::Fpga(i) => write!(f, "FPGA:{i}"),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Fpga => "FPGA",
        };
        f.write_str(s)
    }
}
