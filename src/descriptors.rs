//! Sliding-window geometry for pooling and convolution.
//!
//! A descriptor is created from user parameters (kernel, stride, padding
//! mode), then bound to an input shape with `build`. Building computes the
//! output extent, the per-side padding, and allocates the output tensor (plus
//! the argmax tensor for max pooling). Spatial geometry is fixed from then on;
//! [`PoolDescriptor::resize`] and [`ConvDescriptor::resize`] only move the
//! batch dimension.
//!
//! # Output extent
//!
//! | mode | output | padding |
//! |---|---|---|
//! | `valid` / `none` | `ceil((in - (k - 1)) / s)` | 0 |
//! | `same` | `ceil(in / s)` | `(out - 1) * s + k - in`, split low / high |
//! | explicit `[t, b, l, r]` | `(in + lo + hi - k) / s + 1` | as given |
//!
//! ```rust
//! use briny_net::backend::Device;
//! use briny_net::descriptors::PoolDescriptor;
//!
//! let mut pd = PoolDescriptor::new(&[3, 3], &[2, 2], "valid").unwrap();
//! pd.build(&[1, 1, 5, 5], Device::Cpu).unwrap();
//! assert_eq!(pd.output_shape().unwrap(), vec![1, 1, 2, 2]);
//! ```

use std::str::FromStr;

use crate::backend::Device;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorRef};

/// Padding policy of a windowed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Pad so that `out = ceil(in / stride)`.
    Same,
    /// No padding (`"valid"` or `"none"`).
    Valid,
    /// Fixed `[top, bottom, left, right]` padding.
    Explicit([usize; 4]),
}

impl FromStr for Padding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "same" => Ok(Padding::Same),
            "valid" | "none" => Ok(Padding::Valid),
            other => Err(Error::InvalidPadding {
                component: "descriptor",
                mode: other.to_string(),
            }),
        }
    }
}

/// Precomputed geometry of a 2D window sweep over `[N, C, H, W]` data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window2d {
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub k_h: usize,
    pub k_w: usize,
    pub s_h: usize,
    pub s_w: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl Window2d {
    /// Computes the window geometry for a `[N, C, H, W]` input.
    pub fn compute(
        component: &'static str,
        input: &[usize],
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: Padding,
    ) -> Result<Self> {
        if input.len() != 4 {
            return Err(Error::RankMismatch {
                op: component,
                expected: 4,
                got: input.len(),
            });
        }
        let (in_h, in_w) = (input[2], input[3]);
        let (rows, cols) = match padding {
            Padding::Same => (Extent::Same, Extent::Same),
            Padding::Valid => (Extent::Valid, Extent::Valid),
            Padding::Explicit([t, b, l, r]) => (Extent::Fixed(t, b), Extent::Fixed(l, r)),
        };
        let (out_h, pad_top, pad_bottom) = axis_extent(component, input, in_h, kernel[0], stride[0], rows)?;
        let (out_w, pad_left, pad_right) = axis_extent(component, input, in_w, kernel[1], stride[1], cols)?;

        Ok(Self {
            channels: input[1],
            in_h,
            in_w,
            k_h: kernel[0],
            k_w: kernel[1],
            s_h: stride[0],
            s_w: stride[1],
            pad_top,
            pad_bottom,
            pad_left,
            pad_right,
            out_h,
            out_w,
        })
    }

    /// Total number of window positions over all channels of one sample.
    pub fn positions(&self) -> usize {
        self.channels * self.out_h * self.out_w
    }

    pub fn in_plane(&self) -> usize {
        self.in_h * self.in_w
    }

    pub fn out_plane(&self) -> usize {
        self.out_h * self.out_w
    }
}

#[derive(Clone, Copy)]
enum Extent {
    Same,
    Valid,
    Fixed(usize, usize),
}

/// Output length and low/high padding along one axis.
fn axis_extent(
    component: &'static str,
    input: &[usize],
    size: usize,
    k: usize,
    s: usize,
    extent: Extent,
) -> Result<(usize, usize, usize)> {
    if k == 0 || s == 0 {
        return Err(Error::InvalidGeometry {
            component,
            input: input.to_vec(),
            reason: format!("kernel {k} and stride {s} must be positive"),
        });
    }
    let (size, k, s) = (size as i64, k as i64, s as i64);
    let (out, lo, hi) = match extent {
        Extent::Valid => {
            let span = size - (k - 1);
            if span <= 0 { (0, 0, 0) } else { ((span + s - 1) / s, 0, 0) }
        }
        Extent::Same => {
            let out = (size + s - 1) / s;
            let pad = ((out - 1) * s + k - size).max(0);
            (out, pad / 2, pad - pad / 2)
        }
        Extent::Fixed(lo, hi) => {
            let (lo, hi) = (lo as i64, hi as i64);
            let span = size + lo + hi - k;
            if span < 0 { (0, lo, hi) } else { (span / s + 1, lo, hi) }
        }
    };
    if out <= 0 {
        return Err(Error::InvalidGeometry {
            component,
            input: input.to_vec(),
            reason: format!("kernel {k} with stride {s} leaves no output positions"),
        });
    }
    Ok((out as usize, lo as usize, hi as usize))
}

fn pair(component: &'static str, v: &[usize]) -> Result<[usize; 2]> {
    match v {
        [a, b] => Ok([*a, *b]),
        _ => Err(Error::RankMismatch {
            op: component,
            expected: 2,
            got: v.len(),
        }),
    }
}

#[derive(Debug)]
struct PoolBound {
    input: Vec<usize>,
    window: Window2d,
    output: TensorRef,
    indices: TensorRef,
}

/// Max-pooling geometry plus its output and argmax tensors.
#[derive(Debug)]
pub struct PoolDescriptor {
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: Padding,
    bound: Option<PoolBound>,
}

impl PoolDescriptor {
    /// # Errors
    /// Kernel and stride must both have exactly two entries, and `padding`
    /// must be `same`, `valid` or `none`.
    pub fn new(kernel: &[usize], stride: &[usize], padding: &str) -> Result<Self> {
        Ok(Self {
            kernel: pair("PoolDescriptor", kernel)?,
            stride: pair("PoolDescriptor", stride)?,
            padding: padding.parse()?,
            bound: None,
        })
    }

    /// Pooling with fixed `[top, bottom, left, right]` padding.
    ///
    /// # Errors
    /// Kernel and stride need two entries, `padding` four.
    pub fn with_padding(kernel: &[usize], stride: &[usize], padding: &[usize]) -> Result<Self> {
        let padding = match padding {
            [t, b, l, r] => Padding::Explicit([*t, *b, *l, *r]),
            _ => {
                return Err(Error::RankMismatch {
                    op: "PoolDescriptor",
                    expected: 4,
                    got: padding.len(),
                });
            }
        };
        Ok(Self {
            kernel: pair("PoolDescriptor", kernel)?,
            stride: pair("PoolDescriptor", stride)?,
            padding,
            bound: None,
        })
    }

    /// Binds the descriptor to a `[N, C, H, W]` input shape.
    pub fn build(&mut self, input: &[usize], device: Device) -> Result<()> {
        let window = Window2d::compute("PoolDescriptor", input, self.kernel, self.stride, self.padding)?;
        let out_shape = [input[0], window.channels, window.out_h, window.out_w];
        self.bound = Some(PoolBound {
            input: input.to_vec(),
            window,
            output: Tensor::shared(&out_shape, device),
            indices: Tensor::shared(&out_shape, device),
        });
        Ok(())
    }

    /// Moves the batch dimension of the bound input and owned tensors.
    pub fn resize(&mut self, batch: usize) -> Result<()> {
        let bound = self.bound.as_mut().ok_or(Error::NotBuilt { op: "PoolDescriptor::resize" })?;
        bound.input[0] = batch;
        bound.output.resize_batch(batch);
        bound.indices.resize_batch(batch);
        Ok(())
    }

    /// A fresh descriptor with the same parameters, built for `batch` samples
    /// on `device`.
    pub fn rebuild(&self, batch: usize, device: Device) -> Result<Self> {
        let bound = self.bound.as_ref().ok_or(Error::NotBuilt { op: "PoolDescriptor::rebuild" })?;
        let mut input = bound.input.clone();
        input[0] = batch;
        let mut pd = Self {
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
            bound: None,
        };
        pd.build(&input, device)?;
        Ok(pd)
    }

    pub fn kernel(&self) -> [usize; 2] {
        self.kernel
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn window(&self) -> Option<&Window2d> {
        self.bound.as_ref().map(|b| &b.window)
    }

    pub fn output(&self) -> Option<&TensorRef> {
        self.bound.as_ref().map(|b| &b.output)
    }

    pub fn indices(&self) -> Option<&TensorRef> {
        self.bound.as_ref().map(|b| &b.indices)
    }

    pub fn output_shape(&self) -> Option<Vec<usize>> {
        self.output().map(|t| t.shape())
    }
}

#[derive(Debug)]
struct ConvBound {
    input: Vec<usize>,
    window: Window2d,
    output: TensorRef,
}

/// Convolution geometry plus its output tensor.
#[derive(Debug)]
pub struct ConvDescriptor {
    filters: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: Padding,
    bound: Option<ConvBound>,
}

impl ConvDescriptor {
    pub fn new(filters: usize, kernel: &[usize], stride: &[usize], padding: &str) -> Result<Self> {
        if filters == 0 {
            return Err(Error::config("ConvDescriptor", "filter count must be positive"));
        }
        Ok(Self {
            filters,
            kernel: pair("ConvDescriptor", kernel)?,
            stride: pair("ConvDescriptor", stride)?,
            padding: padding.parse()?,
            bound: None,
        })
    }

    pub fn build(&mut self, input: &[usize], device: Device) -> Result<()> {
        let window = Window2d::compute("ConvDescriptor", input, self.kernel, self.stride, self.padding)?;
        let out_shape = [input[0], self.filters, window.out_h, window.out_w];
        self.bound = Some(ConvBound {
            input: input.to_vec(),
            window,
            output: Tensor::shared(&out_shape, device),
        });
        Ok(())
    }

    pub fn resize(&mut self, batch: usize) -> Result<()> {
        let bound = self.bound.as_mut().ok_or(Error::NotBuilt { op: "ConvDescriptor::resize" })?;
        bound.input[0] = batch;
        bound.output.resize_batch(batch);
        Ok(())
    }

    pub fn rebuild(&self, batch: usize, device: Device) -> Result<Self> {
        let bound = self.bound.as_ref().ok_or(Error::NotBuilt { op: "ConvDescriptor::rebuild" })?;
        let mut input = bound.input.clone();
        input[0] = batch;
        let mut cd = Self {
            filters: self.filters,
            kernel: self.kernel,
            stride: self.stride,
            padding: self.padding,
            bound: None,
        };
        cd.build(&input, device)?;
        Ok(cd)
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn kernel(&self) -> [usize; 2] {
        self.kernel
    }

    pub fn window(&self) -> Option<&Window2d> {
        self.bound.as_ref().map(|b| &b.window)
    }

    pub fn output(&self) -> Option<&TensorRef> {
        self.bound.as_ref().map(|b| &b.output)
    }

    pub fn output_shape(&self) -> Option<Vec<usize>> {
        self.output().map(|t| t.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_splits_low_then_high() {
        // in 4, k 3, s 2 -> out 2, pad (1*2 + 3 - 4) = 1
        let w = Window2d::compute("test", &[1, 1, 4, 4], [3, 3], [2, 2], Padding::Same).unwrap();
        assert_eq!((w.out_h, w.pad_top, w.pad_bottom), (2, 0, 1));
    }

    #[test]
    fn valid_rounds_up() {
        let w = Window2d::compute("test", &[1, 1, 6, 6], [2, 2], [3, 3], Padding::Valid).unwrap();
        // ceil(5 / 3)
        assert_eq!(w.out_h, 2);
    }

    #[test]
    fn explicit_padding_is_kept_per_side() {
        let w = Window2d::compute("test", &[1, 2, 5, 4], [3, 2], [2, 2], Padding::Explicit([1, 0, 0, 2])).unwrap();
        // rows (5 + 1 - 3) / 2 + 1, cols (4 + 2 - 2) / 2 + 1
        assert_eq!((w.out_h, w.out_w), (2, 3));
        assert_eq!((w.pad_top, w.pad_bottom, w.pad_left, w.pad_right), (1, 0, 0, 2));
        assert_eq!(w.positions(), 12);
    }
}
