//! Core tensor container.
//!
//! A [`Tensor`] is a device-tagged, row-major `f32` buffer behind a
//! reader/writer lock. Layers and the network hand tensors around as
//! [`TensorRef`] (`Arc<Tensor>`): a child layer's input is the very same
//! allocation as its parent's output, and same-device replicas alias their
//! parameter and gradient tensors.
//!
//! ## Locking
//!
//! Operations take shared locks on their operands and an exclusive lock on the
//! destination for the whole duration of the write, so concurrent graph
//! branches or replicas accumulating into one tensor are serialized. Storage
//! is host-resident on every device; the device tag only selects the kernel
//! set (see [`crate::ops::dispatch`]).
//!
//! ## Example
//!
//! ```rust
//! use briny_net::backend::Device;
//! use briny_net::tensor::Tensor;
//!
//! let t = Tensor::from_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Device::Cpu).unwrap();
//! assert_eq!(t.shape(), vec![2, 3]);
//! assert_eq!(t.size(), 6);
//! ```

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::Device;
use crate::error::{Error, Result};

/// Shared handle to a tensor.
pub type TensorRef = Arc<Tensor>;

pub(crate) struct Buffer {
    pub(crate) shape: Vec<usize>,
    pub(crate) data: Vec<f32>,
}

/// An N-dimensional `f32` tensor bound to a device.
pub struct Tensor {
    device: Device,
    buf: RwLock<Buffer>,
}

impl Tensor {
    /// Creates a zero-filled tensor.
    pub fn zeros(shape: &[usize], device: Device) -> Self {
        let size = shape.iter().product();
        Self {
            device,
            buf: RwLock::new(Buffer {
                shape: shape.to_vec(),
                data: vec![0.0; size],
            }),
        }
    }

    /// Creates a tensor from flat row-major data.
    ///
    /// # Errors
    /// Fails when `data.len()` is not the product of `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>, device: Device) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                op: "Tensor::from_vec",
                lhs: shape.to_vec(),
                rhs: vec![data.len()],
            });
        }
        Ok(Self {
            device,
            buf: RwLock::new(Buffer {
                shape: shape.to_vec(),
                data,
            }),
        })
    }

    /// Zero-filled tensor wrapped in an `Arc`.
    pub fn shared(shape: &[usize], device: Device) -> TensorRef {
        Arc::new(Self::zeros(shape, device))
    }

    /// Independent copy of this tensor's contents on `device`.
    pub fn duplicate(&self, device: Device) -> Tensor {
        let buf = self.read();
        Self {
            device,
            buf: RwLock::new(Buffer {
                shape: buf.shape.clone(),
                data: buf.data.clone(),
            }),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shape(&self) -> Vec<usize> {
        self.read().shape.clone()
    }

    /// Total element count.
    pub fn size(&self) -> usize {
        self.read().data.len()
    }

    pub fn ndim(&self) -> usize {
        self.read().shape.len()
    }

    /// Leading (batch) dimension, or 0 for a rank-0 tensor.
    pub fn batch(&self) -> usize {
        self.read().shape.first().copied().unwrap_or(0)
    }

    /// Snapshot of the flat data.
    pub fn to_vec(&self) -> Vec<f32> {
        self.read().data.clone()
    }

    /// `true` iff both tensors have the same rank and the same extent on
    /// every axis.
    pub fn eqsize(a: &Tensor, b: &Tensor) -> bool {
        if std::ptr::eq(a, b) {
            return true;
        }
        a.read().shape == b.read().shape
    }

    /// Replaces the leading dimension, reallocating zeroed storage when the
    /// size changes.
    pub fn resize_batch(&self, batch: usize) {
        let mut buf = self.write();
        if buf.shape.first() == Some(&batch) {
            return;
        }
        if buf.shape.is_empty() {
            buf.shape.push(batch);
        } else {
            buf.shape[0] = batch;
        }
        let size = buf.shape.iter().product();
        buf.data = vec![0.0; size];
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Buffer> {
        self.buf.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Buffer> {
        self.buf.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buf = self.read();
        f.debug_struct("Tensor")
            .field("device", &self.device)
            .field("shape", &buf.shape)
            .finish_non_exhaustive()
    }
}

enum Slot {
    Locked(usize),
    Snapshot(usize),
}

/// Read side of a kernel call: locked inputs plus snapshots of inputs that
/// alias a destination.
struct Reads<'a> {
    guards: Vec<(&'a Tensor, RwLockReadGuard<'a, Buffer>)>,
    snapshots: Vec<(&'a Tensor, Vec<f32>)>,
    slots: Vec<Slot>,
}

impl<'a> Reads<'a> {
    /// Must run before any of `outs` is write-locked.
    fn lock(inputs: &[&'a Tensor], outs: &[&Tensor]) -> Self {
        let mut reads = Self {
            guards: Vec::with_capacity(inputs.len()),
            snapshots: Vec::new(),
            slots: Vec::with_capacity(inputs.len()),
        };
        for &t in inputs {
            let slot = if outs.iter().any(|&o| std::ptr::eq(t, o)) {
                match reads.snapshots.iter().position(|(s, _)| std::ptr::eq(*s, t)) {
                    Some(i) => Slot::Snapshot(i),
                    None => {
                        reads.snapshots.push((t, t.to_vec()));
                        Slot::Snapshot(reads.snapshots.len() - 1)
                    }
                }
            } else if let Some(i) = reads.guards.iter().position(|(g, _)| std::ptr::eq(*g, t)) {
                Slot::Locked(i)
            } else {
                reads.guards.push((t, t.read()));
                Slot::Locked(reads.guards.len() - 1)
            };
            reads.slots.push(slot);
        }
        reads
    }

    fn views(&self) -> Vec<&[f32]> {
        self.slots
            .iter()
            .map(|s| match s {
                Slot::Locked(i) => self.guards[*i].1.data.as_slice(),
                Slot::Snapshot(i) => self.snapshots[*i].1.as_slice(),
            })
            .collect()
    }
}

/// Runs `f` with shared views of `inputs` and an exclusive view of `out`.
///
/// Inputs that alias `out` are read from a snapshot taken before the write
/// lock; repeated inputs are locked once.
pub(crate) fn with_locks<R>(
    inputs: &[&Tensor],
    out: &Tensor,
    f: impl FnOnce(&[&[f32]], &mut [f32]) -> R,
) -> R {
    let reads = Reads::lock(inputs, &[out]);
    let mut dst = out.write();
    f(&reads.views(), &mut dst.data)
}

/// Like [`with_locks`] for kernels that write two distinct destinations.
pub(crate) fn with_locks2<R>(
    inputs: &[&Tensor],
    out0: &Tensor,
    out1: &Tensor,
    f: impl FnOnce(&[&[f32]], &mut [f32], &mut [f32]) -> R,
) -> R {
    let reads = Reads::lock(inputs, &[out0, out1]);
    let mut d0 = out0.write();
    let mut d1 = out1.write();
    f(&reads.views(), &mut d0.data, &mut d1.data)
}

/// Shared views of several tensors, for reductions that return a value.
pub(crate) fn with_reads<R>(inputs: &[&Tensor], f: impl FnOnce(&[&[f32]]) -> R) -> R {
    let mut guards: Vec<(&Tensor, RwLockReadGuard<'_, Buffer>)> = Vec::with_capacity(inputs.len());
    let mut idx = Vec::with_capacity(inputs.len());
    for &t in inputs {
        if let Some(i) = guards.iter().position(|(g, _)| std::ptr::eq(*g, t)) {
            idx.push(i);
        } else {
            guards.push((t, t.read()));
            idx.push(guards.len() - 1);
        }
    }
    let views: Vec<&[f32]> = idx.iter().map(|&i| guards[i].1.data.as_slice()).collect();
    f(&views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliased_output_reads_snapshot() {
        let t = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0], Device::Cpu).unwrap();
        with_locks(&[&t, &t], &t, |ins, out| {
            for (o, (a, b)) in out.iter_mut().zip(ins[0].iter().zip(ins[1])) {
                *o = a + b;
            }
        });
        assert_eq!(t.to_vec(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn two_output_kernel_reads_aliased_inputs_from_snapshot() {
        let a = Tensor::from_vec(&[2], vec![1.0, 2.0], Device::Cpu).unwrap();
        let b = Tensor::from_vec(&[2], vec![10.0, 20.0], Device::Cpu).unwrap();
        with_locks2(&[&a, &b, &a], &a, &b, |ins, o0, o1| {
            for i in 0..2 {
                o0[i] = ins[0][i] + ins[1][i];
                o1[i] = ins[1][i] - ins[2][i];
            }
        });
        assert_eq!(a.to_vec(), vec![11.0, 22.0]);
        assert_eq!(b.to_vec(), vec![9.0, 18.0]);
    }

    #[test]
    fn resize_batch_keeps_trailing_dims() {
        let t = Tensor::zeros(&[1, 4, 2], Device::Cpu);
        t.resize_batch(3);
        assert_eq!(t.shape(), vec![3, 4, 2]);
        assert_eq!(t.size(), 24);
    }
}
