//! # Operation Dispatch Layer
//!
//! Numeric primitives and the device kernels that implement them.
//!
//! ## Submodules
//!
//! - [`dispatch`]: tensor-level operations: shape/device checks, locking, and
//!   routing to the kernel set of the operand's device
//! - [`cpu`]: rayon-parallel CPU kernels (complete reference set)
//! - [`emulation`]: stage-in / execute-on-CPU / stage-out adapter for kernels a
//!   device lacks
//! - [`fpga`]: FPGA kernel set (no native kernels, fully emulated)
//! - [`wgpu`] *(opt-in)*: compute shader kernels using `wgpu`
//!
//! ## Extending a Backend
//!
//! 1. Override the method in the backend's [`Kernels`] impl
//! 2. Return `true` for the matching [`Op`] from `supports`
//! 3. Everything else keeps running through emulation

pub mod cpu;
pub mod dispatch;
pub mod emulation;
pub mod fpga;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::descriptors::Window2d;
use crate::error::{Error, Result};

/// Every primitive a device kernel set can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Fill,
    Scale,
    Inc,
    Add,
    ElMult,
    Mult2d,
    Sum2dRowwise,
    ReduceSum2d,
    TotalSum,
    Relu,
    DRelu,
    Sigmoid,
    DSigmoid,
    Softmax,
    DSoftmax,
    Cent,
    DCent,
    Accuracy,
    MPool2d,
    MPool2dBack,
    Conv2d,
    Conv2dGrad,
    Conv2dBiasGrad,
    Conv2dBack,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Fill => "fill",
            Op::Scale => "scale",
            Op::Inc => "inc",
            Op::Add => "add",
            Op::ElMult => "el_mult",
            Op::Mult2d => "mult2d",
            Op::Sum2dRowwise => "sum2d_rowwise",
            Op::ReduceSum2d => "reduce_sum2d",
            Op::TotalSum => "total_sum",
            Op::Relu => "relu",
            Op::DRelu => "d_relu",
            Op::Sigmoid => "sigmoid",
            Op::DSigmoid => "d_sigmoid",
            Op::Softmax => "softmax",
            Op::DSoftmax => "d_softmax",
            Op::Cent => "cent",
            Op::DCent => "d_cent",
            Op::Accuracy => "accuracy",
            Op::MPool2d => "mpool2d",
            Op::MPool2dBack => "mpool2d_back",
            Op::Conv2d => "conv2d",
            Op::Conv2dGrad => "conv2d_grad",
            Op::Conv2dBiasGrad => "conv2d_bias_grad",
            Op::Conv2dBack => "conv2d_back",
        }
    }
}

/// Rows and columns of a matrix view over a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims2 {
    pub rows: usize,
    pub cols: usize,
}

impl Dims2 {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }
}

/// Device kernel interface.
///
/// Kernels work on raw slices that the dispatcher has already checked and
/// locked. Every method defaults to "not implemented"; a backend overrides
/// what it can run natively and reports it through [`Kernels::supports`].
/// Methods with an `inc` flag (and every backward kernel) accumulate into the
/// destination instead of overwriting it.
#[allow(clippy::too_many_arguments)]
pub trait Kernels: Send + Sync {
    /// Backend name used in error messages and logs.
    fn name(&self) -> &'static str;

    /// Whether `op` has a native implementation.
    fn supports(&self, op: Op) -> bool;

    fn unsupported(&self, op: Op) -> Error {
        Error::NotImplemented {
            op: op.name(),
            backend: self.name(),
        }
    }

    /// `c[i] = v`
    fn fill(&self, _c: &mut [f32], _v: f32) -> Result<()> {
        Err(self.unsupported(Op::Fill))
    }

    /// `c[i] = s * a[i]`
    fn scale(&self, _a: &[f32], _s: f32, _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Scale))
    }

    /// `c[i] += a[i]`
    fn inc(&self, _a: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Inc))
    }

    /// `c = sa*a + sb*b`, or `c += ...` when `inc`.
    fn add(
        &self,
        _sa: f32,
        _a: &[f32],
        _sb: f32,
        _b: &[f32],
        _c: &mut [f32],
        _inc: bool,
    ) -> Result<()> {
        Err(self.unsupported(Op::Add))
    }

    /// Elementwise product.
    fn el_mult(&self, _a: &[f32], _b: &[f32], _c: &mut [f32], _inc: bool) -> Result<()> {
        Err(self.unsupported(Op::ElMult))
    }

    /// `c = op(a) x op(b)` where `op` optionally transposes.
    fn mult2d(
        &self,
        _a: &[f32],
        _ad: Dims2,
        _ta: bool,
        _b: &[f32],
        _bd: Dims2,
        _tb: bool,
        _c: &mut [f32],
        _inc: bool,
    ) -> Result<()> {
        Err(self.unsupported(Op::Mult2d))
    }

    /// Adds row vector `b` to every row of `a`.
    fn sum2d_rowwise(&self, _a: &[f32], _ad: Dims2, _b: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Sum2dRowwise))
    }

    /// Sums along `axis` (0 collapses rows, 1 collapses columns).
    fn reduce_sum2d(
        &self,
        _a: &[f32],
        _ad: Dims2,
        _axis: usize,
        _c: &mut [f32],
        _inc: bool,
    ) -> Result<()> {
        Err(self.unsupported(Op::ReduceSum2d))
    }

    fn total_sum(&self, _a: &[f32]) -> Result<f32> {
        Err(self.unsupported(Op::TotalSum))
    }

    fn relu(&self, _a: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Relu))
    }

    /// `pd += d` where the forward input was non-negative.
    fn d_relu(&self, _d: &[f32], _i: &[f32], _pd: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::DRelu))
    }

    fn sigmoid(&self, _a: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Sigmoid))
    }

    /// `pd += d * y * (1 - y)` with `y` the forward output.
    fn d_sigmoid(&self, _d: &[f32], _y: &[f32], _pd: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::DSigmoid))
    }

    /// Row-wise softmax, max-shifted.
    fn softmax(&self, _a: &[f32], _ad: Dims2, _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Softmax))
    }

    /// `pd += y * (d - <d, y>)` per row.
    fn d_softmax(&self, _d: &[f32], _y: &[f32], _ad: Dims2, _pd: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::DSoftmax))
    }

    /// Elementwise binary cross-entropy of prediction `b` against target `a`.
    fn cent(&self, _a: &[f32], _b: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::Cent))
    }

    /// Gradient of [`Kernels::cent`] with respect to the prediction `b`.
    fn d_cent(&self, _a: &[f32], _b: &[f32], _c: &mut [f32]) -> Result<()> {
        Err(self.unsupported(Op::DCent))
    }

    /// Number of rows whose argmax agrees.
    fn accuracy(&self, _a: &[f32], _b: &[f32], _ad: Dims2) -> Result<usize> {
        Err(self.unsupported(Op::Accuracy))
    }

    /// Max pooling; `idx` receives the in-plane input offset of each maximum.
    fn mpool2d(
        &self,
        _w: &Window2d,
        _batch: usize,
        _input: &[f32],
        _out: &mut [f32],
        _idx: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::MPool2d))
    }

    fn mpool2d_back(
        &self,
        _w: &Window2d,
        _batch: usize,
        _d: &[f32],
        _idx: &[f32],
        _pd: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::MPool2dBack))
    }

    /// Direct 2D convolution, `k` laid out as `[filters, channels, kh, kw]`.
    /// An empty `bias` means no bias.
    fn conv2d(
        &self,
        _w: &Window2d,
        _batch: usize,
        _filters: usize,
        _input: &[f32],
        _k: &[f32],
        _bias: &[f32],
        _out: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::Conv2d))
    }

    /// Accumulates the kernel gradient.
    fn conv2d_grad(
        &self,
        _w: &Window2d,
        _batch: usize,
        _filters: usize,
        _input: &[f32],
        _d: &[f32],
        _gk: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::Conv2dGrad))
    }

    /// Accumulates the per-filter bias gradient.
    fn conv2d_bias_grad(
        &self,
        _w: &Window2d,
        _batch: usize,
        _filters: usize,
        _d: &[f32],
        _gb: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::Conv2dBiasGrad))
    }

    /// Accumulates the gradient w.r.t. the convolution input.
    fn conv2d_back(
        &self,
        _w: &Window2d,
        _batch: usize,
        _filters: usize,
        _d: &[f32],
        _k: &[f32],
        _pd: &mut [f32],
    ) -> Result<()> {
        Err(self.unsupported(Op::Conv2dBack))
    }
}
