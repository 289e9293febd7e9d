//! CPU emulation adapter.
//!
//! [`Emulated`] wraps a device kernel set and routes every call either to the
//! device (when it supports the op and the op is not forced onto the host) or
//! through a stage-in / execute-on-CPU / stage-out sequence: operands are copied
//! into host shadow buffers, [`CpuKernels`] runs on the shadows, and the
//! destination shadow is copied back. When emulation is disabled for the
//! device, a missing kernel surfaces as [`Error::NotImplemented`].

use std::collections::HashSet;

use super::cpu::CpuKernels;
use super::{Dims2, Kernels, Op};
use crate::config::EmulationPolicy;
use crate::descriptors::Window2d;
use crate::error::{Error, Result};

enum Route {
    Native,
    Emulate,
}

/// Kernel-set decorator adding the CPU fallback path.
pub struct Emulated<K> {
    device: K,
    forced: HashSet<Op>,
    allow: bool,
}

impl<K: Kernels> Emulated<K> {
    pub fn new(device: K, policy: &EmulationPolicy) -> Self {
        Self {
            device,
            forced: policy.forced_cpu.clone(),
            allow: policy.allow_emulation,
        }
    }

    /// The wrapped device kernels.
    pub fn inner(&self) -> &K {
        &self.device
    }

    /// Whether `op` would run on the host for this device.
    pub fn is_emulated(&self, op: Op) -> bool {
        self.forced.contains(&op) || !self.device.supports(op)
    }

    fn route(&self, op: Op) -> Result<Route> {
        if !self.is_emulated(op) {
            Ok(Route::Native)
        } else if self.allow {
            log::trace!("{}: emulating {} on CPU", self.device.name(), op.name());
            Ok(Route::Emulate)
        } else {
            Err(Error::NotImplemented {
                op: op.name(),
                backend: self.device.name(),
            })
        }
    }

    /// Copies operands into host shadows, runs `run` on them, copies the
    /// destination back.
    fn staged<R>(
        &self,
        ins: &[&[f32]],
        out: &mut [f32],
        run: impl FnOnce(&CpuKernels, &[&[f32]], &mut [f32]) -> Result<R>,
    ) -> Result<R> {
        let shadows: Vec<Vec<f32>> = ins.iter().map(|s| s.to_vec()).collect();
        let views: Vec<&[f32]> = shadows.iter().map(Vec::as_slice).collect();
        let mut host = out.to_vec();
        let r = run(&CpuKernels, &views, &mut host)?;
        out.copy_from_slice(&host);
        Ok(r)
    }
}

impl<K: Kernels> Kernels for Emulated<K> {
    fn name(&self) -> &'static str {
        self.device.name()
    }

    fn supports(&self, op: Op) -> bool {
        !self.is_emulated(op) || self.allow
    }

    fn fill(&self, c: &mut [f32], v: f32) -> Result<()> {
        match self.route(Op::Fill)? {
            Route::Native => self.device.fill(c, v),
            Route::Emulate => self.staged(&[], c, |cpu, _, o| cpu.fill(o, v)),
        }
    }

    fn scale(&self, a: &[f32], s: f32, c: &mut [f32]) -> Result<()> {
        match self.route(Op::Scale)? {
            Route::Native => self.device.scale(a, s, c),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.scale(i[0], s, o)),
        }
    }

    fn inc(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::Inc)? {
            Route::Native => self.device.inc(a, c),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.inc(i[0], o)),
        }
    }

    fn add(&self, sa: f32, a: &[f32], sb: f32, b: &[f32], c: &mut [f32], inc: bool) -> Result<()> {
        match self.route(Op::Add)? {
            Route::Native => self.device.add(sa, a, sb, b, c, inc),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| cpu.add(sa, i[0], sb, i[1], o, inc)),
        }
    }

    fn el_mult(&self, a: &[f32], b: &[f32], c: &mut [f32], inc: bool) -> Result<()> {
        match self.route(Op::ElMult)? {
            Route::Native => self.device.el_mult(a, b, c, inc),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| cpu.el_mult(i[0], i[1], o, inc)),
        }
    }

    fn mult2d(
        &self,
        a: &[f32],
        ad: Dims2,
        ta: bool,
        b: &[f32],
        bd: Dims2,
        tb: bool,
        c: &mut [f32],
        inc: bool,
    ) -> Result<()> {
        match self.route(Op::Mult2d)? {
            Route::Native => self.device.mult2d(a, ad, ta, b, bd, tb, c, inc),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| {
                cpu.mult2d(i[0], ad, ta, i[1], bd, tb, o, inc)
            }),
        }
    }

    fn sum2d_rowwise(&self, a: &[f32], ad: Dims2, b: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::Sum2dRowwise)? {
            Route::Native => self.device.sum2d_rowwise(a, ad, b, c),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| cpu.sum2d_rowwise(i[0], ad, i[1], o)),
        }
    }

    fn reduce_sum2d(&self, a: &[f32], ad: Dims2, axis: usize, c: &mut [f32], inc: bool) -> Result<()> {
        match self.route(Op::ReduceSum2d)? {
            Route::Native => self.device.reduce_sum2d(a, ad, axis, c, inc),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.reduce_sum2d(i[0], ad, axis, o, inc)),
        }
    }

    fn total_sum(&self, a: &[f32]) -> Result<f32> {
        match self.route(Op::TotalSum)? {
            Route::Native => self.device.total_sum(a),
            Route::Emulate => self.staged(&[a], &mut [], |cpu, i, _| cpu.total_sum(i[0])),
        }
    }

    fn relu(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::Relu)? {
            Route::Native => self.device.relu(a, c),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.relu(i[0], o)),
        }
    }

    fn d_relu(&self, d: &[f32], i: &[f32], pd: &mut [f32]) -> Result<()> {
        match self.route(Op::DRelu)? {
            Route::Native => self.device.d_relu(d, i, pd),
            Route::Emulate => self.staged(&[d, i], pd, |cpu, s, o| cpu.d_relu(s[0], s[1], o)),
        }
    }

    fn sigmoid(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::Sigmoid)? {
            Route::Native => self.device.sigmoid(a, c),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.sigmoid(i[0], o)),
        }
    }

    fn d_sigmoid(&self, d: &[f32], y: &[f32], pd: &mut [f32]) -> Result<()> {
        match self.route(Op::DSigmoid)? {
            Route::Native => self.device.d_sigmoid(d, y, pd),
            Route::Emulate => self.staged(&[d, y], pd, |cpu, s, o| cpu.d_sigmoid(s[0], s[1], o)),
        }
    }

    fn softmax(&self, a: &[f32], ad: Dims2, c: &mut [f32]) -> Result<()> {
        match self.route(Op::Softmax)? {
            Route::Native => self.device.softmax(a, ad, c),
            Route::Emulate => self.staged(&[a], c, |cpu, i, o| cpu.softmax(i[0], ad, o)),
        }
    }

    fn d_softmax(&self, d: &[f32], y: &[f32], ad: Dims2, pd: &mut [f32]) -> Result<()> {
        match self.route(Op::DSoftmax)? {
            Route::Native => self.device.d_softmax(d, y, ad, pd),
            Route::Emulate => self.staged(&[d, y], pd, |cpu, s, o| cpu.d_softmax(s[0], s[1], ad, o)),
        }
    }

    fn cent(&self, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::Cent)? {
            Route::Native => self.device.cent(a, b, c),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| cpu.cent(i[0], i[1], o)),
        }
    }

    fn d_cent(&self, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
        match self.route(Op::DCent)? {
            Route::Native => self.device.d_cent(a, b, c),
            Route::Emulate => self.staged(&[a, b], c, |cpu, i, o| cpu.d_cent(i[0], i[1], o)),
        }
    }

    fn accuracy(&self, a: &[f32], b: &[f32], ad: Dims2) -> Result<usize> {
        match self.route(Op::Accuracy)? {
            Route::Native => self.device.accuracy(a, b, ad),
            Route::Emulate => self.staged(&[a, b], &mut [], |cpu, i, _| cpu.accuracy(i[0], i[1], ad)),
        }
    }

    fn mpool2d(
        &self,
        w: &Window2d,
        batch: usize,
        input: &[f32],
        out: &mut [f32],
        idx: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::MPool2d)? {
            Route::Native => self.device.mpool2d(w, batch, input, out, idx),
            Route::Emulate => {
                let mut host_idx = idx.to_vec();
                self.staged(&[input], out, |cpu, i, o| cpu.mpool2d(w, batch, i[0], o, &mut host_idx))?;
                idx.copy_from_slice(&host_idx);
                Ok(())
            }
        }
    }

    fn mpool2d_back(
        &self,
        w: &Window2d,
        batch: usize,
        d: &[f32],
        idx: &[f32],
        pd: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::MPool2dBack)? {
            Route::Native => self.device.mpool2d_back(w, batch, d, idx, pd),
            Route::Emulate => self.staged(&[d, idx], pd, |cpu, i, o| cpu.mpool2d_back(w, batch, i[0], i[1], o)),
        }
    }

    fn conv2d(
        &self,
        w: &Window2d,
        batch: usize,
        filters: usize,
        input: &[f32],
        k: &[f32],
        bias: &[f32],
        out: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::Conv2d)? {
            Route::Native => self.device.conv2d(w, batch, filters, input, k, bias, out),
            Route::Emulate => self.staged(&[input, k, bias], out, |cpu, i, o| {
                cpu.conv2d(w, batch, filters, i[0], i[1], i[2], o)
            }),
        }
    }

    fn conv2d_grad(
        &self,
        w: &Window2d,
        batch: usize,
        filters: usize,
        input: &[f32],
        d: &[f32],
        gk: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::Conv2dGrad)? {
            Route::Native => self.device.conv2d_grad(w, batch, filters, input, d, gk),
            Route::Emulate => self.staged(&[input, d], gk, |cpu, i, o| {
                cpu.conv2d_grad(w, batch, filters, i[0], i[1], o)
            }),
        }
    }

    fn conv2d_bias_grad(
        &self,
        w: &Window2d,
        batch: usize,
        filters: usize,
        d: &[f32],
        gb: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::Conv2dBiasGrad)? {
            Route::Native => self.device.conv2d_bias_grad(w, batch, filters, d, gb),
            Route::Emulate => self.staged(&[d], gb, |cpu, i, o| cpu.conv2d_bias_grad(w, batch, filters, i[0], o)),
        }
    }

    fn conv2d_back(
        &self,
        w: &Window2d,
        batch: usize,
        filters: usize,
        d: &[f32],
        k: &[f32],
        pd: &mut [f32],
    ) -> Result<()> {
        match self.route(Op::Conv2dBack)? {
            Route::Native => self.device.conv2d_back(w, batch, filters, d, k, pd),
            Route::Emulate => self.staged(&[d, k], pd, |cpu, i, o| {
                cpu.conv2d_back(w, batch, filters, i[0], i[1], o)
            }),
        }
    }
}
