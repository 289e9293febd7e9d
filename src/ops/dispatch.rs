//! Operation Dispatch Layer
//!
//! Tensor-level numeric operations. Each function checks the operand
//! contract (same device, equal or reduction-compatible shapes), takes the
//! tensor locks, and hands raw slices to the kernel set of the destination's
//! device:
//!
//! 1. `Cpu` → [`CpuKernels`]
//! 2. `Gpu` → `wgpu` kernels wrapped in [`Emulated`] (feature `wgpu`)
//! 3. `Fpga` → [`FpgaKernels`] wrapped in [`Emulated`]
//!
//! Contract violations return an error before any data is touched.
//!
//! # Example
//! ```rust
//! use briny_net::backend::Device;
//! use briny_net::ops::dispatch::Dispatcher;
//! use briny_net::tensor::Tensor;
//!
//! let ops = Dispatcher::default();
//! let a = Tensor::from_vec(&[2], vec![1.0, 2.0], Device::Cpu).unwrap();
//! let b = Tensor::from_vec(&[2], vec![10.0, 20.0], Device::Cpu).unwrap();
//! let c = Tensor::zeros(&[2], Device::Cpu);
//! ops.add(1.0, &a, 1.0, &b, &c, false).unwrap();
//! assert_eq!(c.to_vec(), vec![11.0, 22.0]);
//! ```

use super::cpu::CpuKernels;
use super::emulation::Emulated;
use super::fpga::FpgaKernels;
#[cfg(feature = "wgpu")]
use super::wgpu::WgpuKernels;
use super::{Dims2, Kernels};
use crate::backend::Device;
use crate::config::BackendCaps;
use crate::descriptors::{ConvDescriptor, PoolDescriptor, Window2d};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, with_locks, with_locks2, with_reads};

/// Kernel sets for every device family, resolved from a [`BackendCaps`].
pub struct Dispatcher {
    cpu: CpuKernels,
    #[cfg(feature = "wgpu")]
    gpu: Emulated<WgpuKernels>,
    fpga: Emulated<FpgaKernels>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(&BackendCaps::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

fn same_device(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.device() != b.device() {
        return Err(Error::DeviceMismatch {
            op,
            lhs: a.device(),
            rhs: b.device(),
        });
    }
    Ok(())
}

fn same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if !Tensor::eqsize(a, b) {
        return Err(Error::ShapeMismatch {
            op,
            lhs: a.shape(),
            rhs: b.shape(),
        });
    }
    Ok(())
}

/// Windowed operands must cover the same number of samples.
fn same_batch(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.batch() != b.batch() {
        return Err(Error::ShapeMismatch {
            op,
            lhs: a.shape(),
            rhs: b.shape(),
        });
    }
    Ok(())
}

fn compatible(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    same_device(op, a, b)?;
    same_shape(op, a, b)
}

/// Views a tensor as `[batch, rest]`.
fn as_2d(t: &Tensor) -> Dims2 {
    let shape = t.shape();
    let rows = shape.first().copied().unwrap_or(1);
    let cols = shape.iter().skip(1).product();
    Dims2::new(rows, cols)
}

fn rank2(op: &'static str, t: &Tensor) -> Result<Dims2> {
    let shape = t.shape();
    if shape.len() != 2 {
        return Err(Error::RankMismatch {
            op,
            expected: 2,
            got: shape.len(),
        });
    }
    Ok(Dims2::new(shape[0], shape[1]))
}

impl Dispatcher {
    pub fn new(caps: &BackendCaps) -> Self {
        use crate::backend::DeviceKind;
        Self {
            cpu: CpuKernels,
            #[cfg(feature = "wgpu")]
            gpu: Emulated::new(WgpuKernels, caps.policy(DeviceKind::Gpu)),
            fpga: Emulated::new(FpgaKernels, caps.policy(DeviceKind::Fpga)),
        }
    }

    /// Kernel set executing operations for `device`.
    pub fn kernels(&self, device: Device) -> Result<&dyn Kernels> {
        match device {
            Device::Cpu => Ok(&self.cpu),
            #[cfg(feature = "wgpu")]
            Device::Gpu(_) => Ok(&self.gpu),
            #[cfg(not(feature = "wgpu"))]
            Device::Gpu(_) => Err(Error::NotCompiled { backend: "wgpu" }),
            Device::Fpga(_) => Ok(&self.fpga),
        }
    }

    /// Copies `a` into `b`. Shapes must match; devices may differ.
    pub fn copy(&self, a: &Tensor, b: &Tensor) -> Result<()> {
        same_shape("copy", a, b)?;
        with_locks(&[a], b, |i, o| o.copy_from_slice(i[0]));
        Ok(())
    }

    /// Copies `a` into `b` ignoring shape, requiring only equal sizes.
    pub fn copy_flat(&self, a: &Tensor, b: &Tensor) -> Result<()> {
        if a.size() != b.size() {
            return Err(Error::ShapeMismatch {
                op: "copy_flat",
                lhs: a.shape(),
                rhs: b.shape(),
            });
        }
        with_locks(&[a], b, |i, o| o.copy_from_slice(i[0]));
        Ok(())
    }

    /// Gathers rows `indices[start..end]` of `a` into consecutive rows of `b`.
    pub fn select(&self, a: &Tensor, b: &Tensor, indices: &[usize], start: usize, end: usize) -> Result<()> {
        let (ad, bd) = (as_2d(a), as_2d(b));
        if ad.cols != bd.cols || end < start || end > indices.len() || bd.rows != end - start {
            return Err(Error::ShapeMismatch {
                op: "select",
                lhs: a.shape(),
                rhs: b.shape(),
            });
        }
        let rows = &indices[start..end];
        if let Some(&bad) = rows.iter().find(|&&r| r >= ad.rows) {
            return Err(Error::config("select", format!("row {bad} out of range for {} rows", ad.rows)));
        }
        with_locks(&[a], b, |i, o| {
            for (dst, &r) in o.chunks_mut(bd.cols.max(1)).zip(rows) {
                dst.copy_from_slice(&i[0][r * ad.cols..(r + 1) * ad.cols]);
            }
        });
        Ok(())
    }

    pub fn fill(&self, a: &Tensor, v: f32) -> Result<()> {
        let k = self.kernels(a.device())?;
        with_locks(&[], a, |_, o| k.fill(o, v))
    }

    /// `c = s * a`; `c` may be `a`.
    pub fn scale(&self, a: &Tensor, s: f32, c: &Tensor) -> Result<()> {
        compatible("scale", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a], c, |i, o| k.scale(i[0], s, o))
    }

    /// In-place division by a scalar.
    pub fn div(&self, a: &Tensor, s: f32) -> Result<()> {
        self.scale(a, 1.0 / s, a)
    }

    /// `b += a`.
    ///
    /// Devices may differ: storage is host-resident, so the destination's
    /// kernels accumulate the source directly.
    pub fn inc(&self, a: &Tensor, b: &Tensor) -> Result<()> {
        same_shape("inc", a, b)?;
        let k = self.kernels(b.device())?;
        with_locks(&[a], b, |i, o| k.inc(i[0], o))
    }

    /// `b += a` where only the element counts must agree.
    pub fn inc_flat(&self, a: &Tensor, b: &Tensor) -> Result<()> {
        same_device("inc_flat", a, b)?;
        if a.size() != b.size() {
            return Err(Error::ShapeMismatch {
                op: "inc_flat",
                lhs: a.shape(),
                rhs: b.shape(),
            });
        }
        let k = self.kernels(b.device())?;
        with_locks(&[a], b, |i, o| k.inc(i[0], o))
    }

    /// `c = sa*a + sb*b`, or `c += sa*a + sb*b` when `inc`.
    pub fn add(&self, sa: f32, a: &Tensor, sb: f32, b: &Tensor, c: &Tensor, inc: bool) -> Result<()> {
        compatible("add", a, b)?;
        compatible("add", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.add(sa, i[0], sb, i[1], o, inc))
    }

    pub fn el_mult(&self, a: &Tensor, b: &Tensor, c: &Tensor, inc: bool) -> Result<()> {
        compatible("el_mult", a, b)?;
        compatible("el_mult", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.el_mult(i[0], i[1], o, inc))
    }

    /// Matrix product with optional transposes: `c (+)= op(a) x op(b)`.
    pub fn mult2d(&self, a: &Tensor, ta: bool, b: &Tensor, tb: bool, c: &Tensor, inc: bool) -> Result<()> {
        same_device("mult2d", a, b)?;
        same_device("mult2d", a, c)?;
        let (ad, bd, cd) = (rank2("mult2d", a)?, rank2("mult2d", b)?, rank2("mult2d", c)?);
        let (m, k1) = if ta { (ad.cols, ad.rows) } else { (ad.rows, ad.cols) };
        let (k2, n) = if tb { (bd.cols, bd.rows) } else { (bd.rows, bd.cols) };
        if k1 != k2 || cd != Dims2::new(m, n) {
            return Err(Error::ShapeMismatch {
                op: "mult2d",
                lhs: vec![m, k1],
                rhs: vec![k2, n],
            });
        }
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.mult2d(i[0], ad, ta, i[1], bd, tb, o, inc))
    }

    /// `c[r, :] = a[r, :] + b` for a row vector `b`.
    pub fn sum2d_rowwise(&self, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<()> {
        compatible("sum2d_rowwise", a, c)?;
        same_device("sum2d_rowwise", a, b)?;
        let ad = rank2("sum2d_rowwise", a)?;
        if b.shape() != [ad.cols] {
            return Err(Error::ShapeMismatch {
                op: "sum2d_rowwise",
                lhs: a.shape(),
                rhs: b.shape(),
            });
        }
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.sum2d_rowwise(i[0], ad, i[1], o))
    }

    /// Sums a 2D tensor along `axis` into the rank-1 tensor `c`.
    pub fn reduce_sum2d(&self, a: &Tensor, c: &Tensor, axis: usize, inc: bool) -> Result<()> {
        same_device("reduce_sum2d", a, c)?;
        let ad = rank2("reduce_sum2d", a)?;
        let expect = match axis {
            0 => ad.cols,
            1 => ad.rows,
            _ => {
                return Err(Error::config("reduce_sum2d", format!("axis {axis} out of range")));
            }
        };
        if c.shape() != [expect] {
            return Err(Error::ShapeMismatch {
                op: "reduce_sum2d",
                lhs: a.shape(),
                rhs: c.shape(),
            });
        }
        let k = self.kernels(c.device())?;
        with_locks(&[a], c, |i, o| k.reduce_sum2d(i[0], ad, axis, o, inc))
    }

    pub fn total_sum(&self, a: &Tensor) -> Result<f32> {
        let k = self.kernels(a.device())?;
        with_reads(&[a], |i| k.total_sum(i[0]))
    }

    pub fn relu(&self, a: &Tensor, c: &Tensor) -> Result<()> {
        compatible("relu", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a], c, |i, o| k.relu(i[0], o))
    }

    /// `pd += d` wherever the forward input `i` was non-negative.
    pub fn d_relu(&self, d: &Tensor, i: &Tensor, pd: &Tensor) -> Result<()> {
        compatible("d_relu", d, i)?;
        compatible("d_relu", d, pd)?;
        let k = self.kernels(pd.device())?;
        with_locks(&[d, i], pd, |s, o| k.d_relu(s[0], s[1], o))
    }

    pub fn sigmoid(&self, a: &Tensor, c: &Tensor) -> Result<()> {
        compatible("sigmoid", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a], c, |i, o| k.sigmoid(i[0], o))
    }

    pub fn d_sigmoid(&self, d: &Tensor, y: &Tensor, pd: &Tensor) -> Result<()> {
        compatible("d_sigmoid", d, y)?;
        compatible("d_sigmoid", d, pd)?;
        let k = self.kernels(pd.device())?;
        with_locks(&[d, y], pd, |s, o| k.d_sigmoid(s[0], s[1], o))
    }

    /// Softmax over everything but the leading dimension.
    pub fn softmax(&self, a: &Tensor, c: &Tensor) -> Result<()> {
        compatible("softmax", a, c)?;
        let ad = as_2d(a);
        let k = self.kernels(c.device())?;
        with_locks(&[a], c, |i, o| k.softmax(i[0], ad, o))
    }

    pub fn d_softmax(&self, d: &Tensor, y: &Tensor, pd: &Tensor) -> Result<()> {
        compatible("d_softmax", d, y)?;
        compatible("d_softmax", d, pd)?;
        let yd = as_2d(y);
        let k = self.kernels(pd.device())?;
        with_locks(&[d, y], pd, |s, o| k.d_softmax(s[0], s[1], yd, o))
    }

    /// Elementwise cross-entropy of prediction `b` against target `a`.
    pub fn cent(&self, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<()> {
        compatible("cent", a, b)?;
        compatible("cent", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.cent(i[0], i[1], o))
    }

    /// `c = d cent(a, b) / db`, clamped away from the poles.
    pub fn d_cent(&self, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<()> {
        compatible("d_cent", a, b)?;
        compatible("d_cent", a, c)?;
        let k = self.kernels(c.device())?;
        with_locks(&[a, b], c, |i, o| k.d_cent(i[0], i[1], o))
    }

    /// Count of samples whose argmax matches.
    pub fn accuracy(&self, a: &Tensor, b: &Tensor) -> Result<usize> {
        compatible("accuracy", a, b)?;
        let ad = as_2d(a);
        let k = self.kernels(a.device())?;
        with_reads(&[a, b], |i| k.accuracy(i[0], i[1], ad))
    }

    /// Max pooling into the descriptor's output and argmax tensors.
    pub fn mpool2d(&self, pd: &PoolDescriptor, input: &Tensor) -> Result<()> {
        let (w, out, idx) = bound_pool(pd)?;
        same_device("mpool2d", input, out)?;
        check_input("mpool2d", w, input)?;
        same_batch("mpool2d", input, out)?;
        let batch = input.batch();
        let k = self.kernels(out.device())?;
        with_locks2(&[input], out, idx, |i, o, x| k.mpool2d(w, batch, i[0], o, x))
    }

    /// Routes `delta` back to the argmax positions of `pdelta`.
    pub fn mpool2d_back(&self, pd: &PoolDescriptor, delta: &Tensor, pdelta: &Tensor) -> Result<()> {
        let (w, out, idx) = bound_pool(pd)?;
        compatible("mpool2d_back", out, delta)?;
        same_device("mpool2d_back", delta, pdelta)?;
        check_input("mpool2d_back", w, pdelta)?;
        same_batch("mpool2d_back", pdelta, delta)?;
        let batch = pdelta.batch();
        let k = self.kernels(pdelta.device())?;
        with_locks(&[delta, idx], pdelta, |i, o| k.mpool2d_back(w, batch, i[0], i[1], o))
    }

    /// Convolution into the descriptor's output; pass `None` for no bias.
    pub fn conv2d(&self, cd: &ConvDescriptor, input: &Tensor, kernel: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        let (w, out) = bound_conv(cd)?;
        same_device("conv2d", input, out)?;
        same_device("conv2d", kernel, out)?;
        check_input("conv2d", w, input)?;
        same_batch("conv2d", input, out)?;
        check_kernel("conv2d", cd, w, kernel)?;
        let batch = input.batch();
        let filters = cd.filters();
        let k = self.kernels(out.device())?;
        match bias {
            Some(b) => with_locks(&[input, kernel, b], out, |i, o| {
                k.conv2d(w, batch, filters, i[0], i[1], i[2], o)
            }),
            None => with_locks(&[input, kernel], out, |i, o| k.conv2d(w, batch, filters, i[0], i[1], &[], o)),
        }
    }

    /// Accumulates the kernel gradient into `gk`.
    pub fn conv2d_grad(&self, cd: &ConvDescriptor, input: &Tensor, delta: &Tensor, gk: &Tensor) -> Result<()> {
        let (w, out) = bound_conv(cd)?;
        compatible("conv2d_grad", out, delta)?;
        check_input("conv2d_grad", w, input)?;
        same_batch("conv2d_grad", input, delta)?;
        check_kernel("conv2d_grad", cd, w, gk)?;
        let batch = input.batch();
        let filters = cd.filters();
        let k = self.kernels(gk.device())?;
        with_locks(&[input, delta], gk, |i, o| k.conv2d_grad(w, batch, filters, i[0], i[1], o))
    }

    pub fn conv2d_bias_grad(&self, cd: &ConvDescriptor, delta: &Tensor, gb: &Tensor) -> Result<()> {
        let (w, out) = bound_conv(cd)?;
        compatible("conv2d_bias_grad", out, delta)?;
        if gb.shape() != [cd.filters()] {
            return Err(Error::ShapeMismatch {
                op: "conv2d_bias_grad",
                lhs: vec![cd.filters()],
                rhs: gb.shape(),
            });
        }
        let batch = delta.batch();
        let filters = cd.filters();
        let k = self.kernels(gb.device())?;
        with_locks(&[delta], gb, |i, o| k.conv2d_bias_grad(w, batch, filters, i[0], o))
    }

    /// Accumulates the input gradient into `pdelta`.
    pub fn conv2d_back(&self, cd: &ConvDescriptor, delta: &Tensor, kernel: &Tensor, pdelta: &Tensor) -> Result<()> {
        let (w, out) = bound_conv(cd)?;
        compatible("conv2d_back", out, delta)?;
        check_input("conv2d_back", w, pdelta)?;
        same_batch("conv2d_back", pdelta, delta)?;
        check_kernel("conv2d_back", cd, w, kernel)?;
        let batch = pdelta.batch();
        let filters = cd.filters();
        let k = self.kernels(pdelta.device())?;
        with_locks(&[delta, kernel], pdelta, |i, o| k.conv2d_back(w, batch, filters, i[0], i[1], o))
    }
}

fn bound_pool(pd: &PoolDescriptor) -> Result<(&Window2d, &Tensor, &Tensor)> {
    match (pd.window(), pd.output(), pd.indices()) {
        (Some(w), Some(o), Some(i)) => Ok((w, o.as_ref(), i.as_ref())),
        _ => Err(Error::NotBuilt { op: "mpool2d" }),
    }
}

fn bound_conv(cd: &ConvDescriptor) -> Result<(&Window2d, &Tensor)> {
    match (cd.window(), cd.output()) {
        (Some(w), Some(o)) => Ok((w, o.as_ref())),
        _ => Err(Error::NotBuilt { op: "conv2d" }),
    }
}

fn check_input(op: &'static str, w: &Window2d, t: &Tensor) -> Result<()> {
    let shape = t.shape();
    if shape.len() != 4 || shape[1..] != [w.channels, w.in_h, w.in_w] {
        return Err(Error::ShapeMismatch {
            op,
            lhs: vec![shape.first().copied().unwrap_or(0), w.channels, w.in_h, w.in_w],
            rhs: shape,
        });
    }
    Ok(())
}

fn check_kernel(op: &'static str, cd: &ConvDescriptor, w: &Window2d, t: &Tensor) -> Result<()> {
    let expect = [cd.filters(), w.channels, w.k_h, w.k_w];
    if t.shape() != expect {
        return Err(Error::ShapeMismatch {
            op,
            lhs: expect.to_vec(),
            rhs: t.shape(),
        });
    }
    Ok(())
}
