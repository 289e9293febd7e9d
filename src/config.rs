//! Compute-service and backend-capability configuration.
//!
//! A [`ComputeService`] tells [`Network::build`](crate::net::Network::build)
//! where to run and how many replicas to train:
//!
//! - `LocalCpu { threads }`: `threads` same-device replicas that share
//!   parameters
//! - `LocalGpu { devices, sync_interval }`: one cloned replica per selected GPU
//! - `LocalFpga { devices, sync_interval }`: one cloned replica per selected FPGA
//! - `Distributed`: accepted by validation, rejected by `build`
//!
//! [`BackendCaps`] decides, per device family, which operations are pushed onto
//! the CPU and whether a missing kernel may be emulated at all. It is resolved
//! into a [`Dispatcher`](crate::ops::dispatch::Dispatcher) once per network.
//!
//! Both types implement [`briny`]'s `Validate` and are passed through
//! `TrustedData` before use.

use std::collections::HashSet;

use briny::prelude::*;

use crate::backend::{Device, DeviceKind};
use crate::ops::Op;

/// Where and how wide a network trains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeService {
    LocalCpu {
        threads: usize,
    },
    LocalGpu {
        /// `devices[i]` selects GPU `i`.
        devices: Vec<bool>,
        /// Synchronize replica weights every this many training batches.
        sync_interval: usize,
    },
    LocalFpga {
        devices: Vec<bool>,
        sync_interval: usize,
    },
    Distributed,
}

impl Default for ComputeService {
    fn default() -> Self {
        Self::cpu(1)
    }
}

impl ComputeService {
    pub fn cpu(threads: usize) -> Self {
        Self::LocalCpu { threads }
    }

    pub fn gpu(devices: Vec<bool>) -> Self {
        Self::gpu_with_sync(devices, 1)
    }

    /// GPU service that averages replica weights only every `sync_interval`
    /// batches, trading consistency for fewer transfers.
    pub fn gpu_with_sync(devices: Vec<bool>, sync_interval: usize) -> Self {
        Self::LocalGpu {
            devices,
            sync_interval,
        }
    }

    pub fn fpga(devices: Vec<bool>) -> Self {
        Self::LocalFpga {
            devices,
            sync_interval: 1,
        }
    }

    pub fn distributed() -> Self {
        Self::Distributed
    }

    /// One device per replica, in replica order.
    pub fn replica_devices(&self) -> Vec<Device> {
        match self {
            Self::LocalCpu { threads } => vec![Device::Cpu; *threads],
            Self::LocalGpu { devices, .. } => selected(devices).map(Device::Gpu).collect(),
            Self::LocalFpga { devices, .. } => selected(devices).map(Device::Fpga).collect(),
            Self::Distributed => Vec::new(),
        }
    }

    pub fn sync_interval(&self) -> usize {
        match self {
            Self::LocalGpu { sync_interval, .. } | Self::LocalFpga { sync_interval, .. } => *sync_interval,
            _ => 1,
        }
    }

    /// Device family the service trains on, `None` for distributed.
    pub fn kind(&self) -> Option<DeviceKind> {
        match self {
            Self::LocalCpu { .. } => Some(DeviceKind::Cpu),
            Self::LocalGpu { .. } => Some(DeviceKind::Gpu),
            Self::LocalFpga { .. } => Some(DeviceKind::Fpga),
            Self::Distributed => None,
        }
    }
}

fn selected(devices: &[bool]) -> impl Iterator<Item = usize> + '_ {
    devices
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
}

impl Validate for ComputeService {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::LocalCpu { threads } if *threads == 0 => Err(ValidationError),
            Self::LocalGpu {
                devices,
                sync_interval,
            }
            | Self::LocalFpga {
                devices,
                sync_interval,
            } => {
                if *sync_interval == 0 || !devices.iter().any(|&d| d) {
                    return Err(ValidationError);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Emulation rules for one device family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationPolicy {
    /// Operations that always run on the host, even if the device has a kernel.
    pub forced_cpu: HashSet<Op>,
    /// Whether unsupported operations may fall back to the host at all.
    pub allow_emulation: bool,
}

impl Default for EmulationPolicy {
    fn default() -> Self {
        Self {
            forced_cpu: HashSet::new(),
            allow_emulation: true,
        }
    }
}

/// Per-network backend capability table.
///
/// ```rust
/// use briny_net::backend::DeviceKind;
/// use briny_net::config::BackendCaps;
/// use briny_net::ops::Op;
///
/// let caps = BackendCaps::default().force_cpu(DeviceKind::Gpu, Op::Conv2d);
/// assert!(caps.policy(DeviceKind::Gpu).forced_cpu.contains(&Op::Conv2d));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCaps {
    gpu: EmulationPolicy,
    fpga: EmulationPolicy,
}

impl BackendCaps {
    /// Routes `op` through CPU emulation on `kind` devices.
    #[must_use]
    pub fn force_cpu(mut self, kind: DeviceKind, op: Op) -> Self {
        if let Some(p) = self.policy_mut(kind) {
            p.forced_cpu.insert(op);
        }
        self
    }

    /// Makes missing kernels on `kind` a hard `NotImplemented` error.
    #[must_use]
    pub fn deny_emulation(mut self, kind: DeviceKind) -> Self {
        if let Some(p) = self.policy_mut(kind) {
            p.allow_emulation = false;
        }
        self
    }

    pub fn policy(&self, kind: DeviceKind) -> &EmulationPolicy {
        match kind {
            DeviceKind::Fpga => &self.fpga,
            _ => &self.gpu,
        }
    }

    fn policy_mut(&mut self, kind: DeviceKind) -> Option<&mut EmulationPolicy> {
        match kind {
            DeviceKind::Cpu => None,
            DeviceKind::Gpu => Some(&mut self.gpu),
            DeviceKind::Fpga => Some(&mut self.fpga),
        }
    }
}

impl Validate for BackendCaps {
    fn validate(&self) -> Result<(), ValidationError> {
        // forcing ops onto the host is contradictory when the host path is off
        for p in [&self.gpu, &self.fpga] {
            if !p.allow_emulation && !p.forced_cpu.is_empty() {
                return Err(ValidationError);
            }
        }
        Ok(())
    }
}
