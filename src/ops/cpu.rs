//! Parallel CPU backend kernels
//!
//! # CPU Backend
//!
//! The reference implementation of every [`Kernels`] method. Other backends
//! fall back to these through [`crate::ops::emulation`].
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon): elementwise
//!   kernels run as parallel iterators, matrix and window kernels split their
//!   destination into independent rows or planes
//! - Deterministic results for a given input (no parallel reductions into a
//!   shared accumulator)
//!
//! Shapes are validated by the dispatcher before any kernel runs; kernels
//! index the slices they are handed without further checks.

use rayon::prelude::*;

use super::{Dims2, Kernels, Op};
use crate::descriptors::Window2d;
use crate::error::Result;

/// Rayon-backed kernel set for [`Device::Cpu`](crate::backend::Device::Cpu).
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuKernels;

#[inline]
fn store(c: &mut f32, v: f32, inc: bool) {
    if inc {
        *c += v;
    } else {
        *c = v;
    }
}

/// Signed input coordinate of tap `k` at window position `o`.
#[inline]
fn tap(o: usize, stride: usize, k: usize, pad: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad)
}

impl Kernels for CpuKernels {
    fn name(&self) -> &'static str {
        "CPU"
    }

    fn supports(&self, _op: Op) -> bool {
        true
    }

    fn fill(&self, c: &mut [f32], v: f32) -> Result<()> {
        c.par_iter_mut().for_each(|x| *x = v);
        Ok(())
    }

    fn scale(&self, a: &[f32], s: f32, c: &mut [f32]) -> Result<()> {
        c.par_iter_mut().zip(a.par_iter()).for_each(|(c, &a)| *c = s * a);
        Ok(())
    }

    fn inc(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        c.par_iter_mut().zip(a.par_iter()).for_each(|(c, &a)| *c += a);
        Ok(())
    }

    fn add(&self, sa: f32, a: &[f32], sb: f32, b: &[f32], c: &mut [f32], inc: bool) -> Result<()> {
        c.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(c, (&a, &b))| store(c, sa * a + sb * b, inc));
        Ok(())
    }

    fn el_mult(&self, a: &[f32], b: &[f32], c: &mut [f32], inc: bool) -> Result<()> {
        c.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(c, (&a, &b))| store(c, a * b, inc));
        Ok(())
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
        let k = if ta { ad.rows } else { ad.cols };
        let n = if tb { bd.rows } else { bd.cols };
        if n == 0 {
            return Ok(());
        }

        c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for (j, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for l in 0..k {
                    let av = if ta { a[l * ad.cols + i] } else { a[i * ad.cols + l] };
                    let bv = if tb { b[j * bd.cols + l] } else { b[l * bd.cols + j] };
                    sum += av * bv;
                }
                store(out, sum, inc);
            }
        });
        Ok(())
    }

    fn sum2d_rowwise(&self, a: &[f32], ad: Dims2, b: &[f32], c: &mut [f32]) -> Result<()> {
        let cols = ad.cols.max(1);
        c.par_chunks_mut(cols)
            .zip(a.par_chunks(cols))
            .for_each(|(row, src)| {
                for ((o, &x), &bias) in row.iter_mut().zip(src).zip(b) {
                    *o = x + bias;
                }
            });
        Ok(())
    }

    fn reduce_sum2d(&self, a: &[f32], ad: Dims2, axis: usize, c: &mut [f32], inc: bool) -> Result<()> {
        if axis == 0 {
            c.par_iter_mut().enumerate().for_each(|(j, out)| {
                let sum: f32 = (0..ad.rows).map(|r| a[r * ad.cols + j]).sum();
                store(out, sum, inc);
            });
        } else {
            c.par_iter_mut().enumerate().for_each(|(r, out)| {
                let sum: f32 = a[r * ad.cols..(r + 1) * ad.cols].iter().sum();
                store(out, sum, inc);
            });
        }
        Ok(())
    }

    fn total_sum(&self, a: &[f32]) -> Result<f32> {
        Ok(a.par_iter().map(|&x| f64::from(x)).sum::<f64>() as f32)
    }

    fn relu(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        c.par_iter_mut().zip(a.par_iter()).for_each(|(c, &a)| *c = a.max(0.0));
        Ok(())
    }

    fn d_relu(&self, d: &[f32], i: &[f32], pd: &mut [f32]) -> Result<()> {
        pd.par_iter_mut()
            .zip(d.par_iter().zip(i.par_iter()))
            .for_each(|(pd, (&d, &i))| {
                if i >= 0.0 {
                    *pd += d;
                }
            });
        Ok(())
    }

    fn sigmoid(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        c.par_iter_mut()
            .zip(a.par_iter())
            .for_each(|(c, &a)| *c = 1.0 / (1.0 + (-a).exp()));
        Ok(())
    }

    fn d_sigmoid(&self, d: &[f32], y: &[f32], pd: &mut [f32]) -> Result<()> {
        pd.par_iter_mut()
            .zip(d.par_iter().zip(y.par_iter()))
            .for_each(|(pd, (&d, &y))| *pd += d * y * (1.0 - y));
        Ok(())
    }

    fn softmax(&self, a: &[f32], ad: Dims2, c: &mut [f32]) -> Result<()> {
        let cols = ad.cols.max(1);
        c.par_chunks_mut(cols)
            .zip(a.par_chunks(cols))
            .for_each(|(row, src)| {
                let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for (o, &x) in row.iter_mut().zip(src) {
                    *o = (x - max).exp();
                    sum += *o;
                }
                for o in row.iter_mut() {
                    *o /= sum;
                }
            });
        Ok(())
    }

    fn d_softmax(&self, d: &[f32], y: &[f32], ad: Dims2, pd: &mut [f32]) -> Result<()> {
        let cols = ad.cols.max(1);
        pd.par_chunks_mut(cols)
            .zip(d.par_chunks(cols).zip(y.par_chunks(cols)))
            .for_each(|(row, (d, y))| {
                let dot: f32 = d.iter().zip(y).map(|(d, y)| d * y).sum();
                for ((o, &d), &y) in row.iter_mut().zip(d).zip(y) {
                    *o += y * (d - dot);
                }
            });
        Ok(())
    }

    fn cent(&self, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
        c.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(c, (&a, &b))| {
                let mut v = 0.0;
                if a != 0.0 {
                    v -= a * b.ln();
                }
                if a != 1.0 {
                    v -= (1.0 - a) * (1.0 - b).ln();
                }
                *c = v;
            });
        Ok(())
    }

    fn d_cent(&self, a: &[f32], b: &[f32], c: &mut [f32]) -> Result<()> {
        const EPS: f32 = 1e-7;
        c.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(c, (&a, &b))| {
                *c = -a / (b + EPS) + (1.0 - a) / (1.0 - b + EPS);
            });
        Ok(())
    }

    fn accuracy(&self, a: &[f32], b: &[f32], ad: Dims2) -> Result<usize> {
        let cols = ad.cols.max(1);
        Ok(a.par_chunks(cols)
            .zip(b.par_chunks(cols))
            .filter(|(t, p)| argmax(t) == argmax(p))
            .count())
    }

    fn mpool2d(
        &self,
        w: &Window2d,
        _batch: usize,
        input: &[f32],
        out: &mut [f32],
        idx: &mut [f32],
    ) -> Result<()> {
        let (ip, op) = (w.in_plane(), w.out_plane().max(1));
        out.par_chunks_mut(op)
            .zip(idx.par_chunks_mut(op))
            .enumerate()
            .for_each(|(p, (out, idx))| {
                let plane = &input[p * ip..(p + 1) * ip];
                for oy in 0..w.out_h {
                    for ox in 0..w.out_w {
                        let mut best = f32::NEG_INFINITY;
                        let mut at = -1.0;
                        for ky in 0..w.k_h {
                            let Some(y) = tap(oy, w.s_h, ky, w.pad_top).filter(|&y| y < w.in_h) else {
                                continue;
                            };
                            for kx in 0..w.k_w {
                                let Some(x) = tap(ox, w.s_w, kx, w.pad_left).filter(|&x| x < w.in_w) else {
                                    continue;
                                };
                                let v = plane[y * w.in_w + x];
                                if v > best {
                                    best = v;
                                    at = (y * w.in_w + x) as f32;
                                }
                            }
                        }
                        let o = oy * w.out_w + ox;
                        out[o] = if at < 0.0 { 0.0 } else { best };
                        idx[o] = at;
                    }
                }
            });
        Ok(())
    }

    fn mpool2d_back(
        &self,
        w: &Window2d,
        _batch: usize,
        d: &[f32],
        idx: &[f32],
        pd: &mut [f32],
    ) -> Result<()> {
        let (ip, op) = (w.in_plane().max(1), w.out_plane());
        pd.par_chunks_mut(ip).enumerate().for_each(|(p, plane)| {
            let d = &d[p * op..(p + 1) * op];
            let idx = &idx[p * op..(p + 1) * op];
            for (&g, &at) in d.iter().zip(idx) {
                if at >= 0.0 {
                    plane[at as usize] += g;
                }
            }
        });
        Ok(())
    }

    fn conv2d(
        &self,
        w: &Window2d,
        _batch: usize,
        filters: usize,
        input: &[f32],
        k: &[f32],
        bias: &[f32],
        out: &mut [f32],
    ) -> Result<()> {
        let (ip, op) = (w.in_plane(), w.out_plane().max(1));
        let ksize = w.channels * w.k_h * w.k_w;
        out.par_chunks_mut(op).enumerate().for_each(|(p, plane)| {
            let (b, f) = (p / filters, p % filters);
            let sample = &input[b * w.channels * ip..(b + 1) * w.channels * ip];
            let kern = &k[f * ksize..(f + 1) * ksize];
            let b0 = bias.get(f).copied().unwrap_or(0.0);
            for oy in 0..w.out_h {
                for ox in 0..w.out_w {
                    let mut sum = b0;
                    for c in 0..w.channels {
                        for ky in 0..w.k_h {
                            let Some(y) = tap(oy, w.s_h, ky, w.pad_top).filter(|&y| y < w.in_h) else {
                                continue;
                            };
                            for kx in 0..w.k_w {
                                let Some(x) = tap(ox, w.s_w, kx, w.pad_left).filter(|&x| x < w.in_w) else {
                                    continue;
                                };
                                sum += sample[c * ip + y * w.in_w + x]
                                    * kern[(c * w.k_h + ky) * w.k_w + kx];
                            }
                        }
                    }
                    plane[oy * w.out_w + ox] = sum;
                }
            }
        });
        Ok(())
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
        let (ip, op) = (w.in_plane(), w.out_plane());
        let ksize = (w.channels * w.k_h * w.k_w).max(1);
        gk.par_chunks_mut(ksize).enumerate().for_each(|(f, g)| {
            for b in 0..batch {
                let sample = &input[b * w.channels * ip..(b + 1) * w.channels * ip];
                let dplane = &d[(b * filters + f) * op..(b * filters + f + 1) * op];
                for oy in 0..w.out_h {
                    for ox in 0..w.out_w {
                        let dv = dplane[oy * w.out_w + ox];
                        for c in 0..w.channels {
                            for ky in 0..w.k_h {
                                let Some(y) = tap(oy, w.s_h, ky, w.pad_top).filter(|&y| y < w.in_h) else {
                                    continue;
                                };
                                for kx in 0..w.k_w {
                                    let Some(x) = tap(ox, w.s_w, kx, w.pad_left).filter(|&x| x < w.in_w) else {
                                        continue;
                                    };
                                    g[(c * w.k_h + ky) * w.k_w + kx] += dv * sample[c * ip + y * w.in_w + x];
                                }
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn conv2d_bias_grad(
        &self,
        w: &Window2d,
        batch: usize,
        filters: usize,
        d: &[f32],
        gb: &mut [f32],
    ) -> Result<()> {
        let op = w.out_plane();
        gb.par_iter_mut().enumerate().for_each(|(f, g)| {
            for b in 0..batch {
                let start = (b * filters + f) * op;
                *g += d[start..start + op].iter().sum::<f32>();
            }
        });
        Ok(())
    }

    fn conv2d_back(
        &self,
        w: &Window2d,
        _batch: usize,
        filters: usize,
        d: &[f32],
        k: &[f32],
        pd: &mut [f32],
    ) -> Result<()> {
        let (ip, op) = (w.in_plane(), w.out_plane());
        let ksize = w.channels * w.k_h * w.k_w;
        pd.par_chunks_mut((w.channels * ip).max(1)).enumerate().for_each(|(b, sample)| {
            for f in 0..filters {
                let dplane = &d[(b * filters + f) * op..(b * filters + f + 1) * op];
                let kern = &k[f * ksize..(f + 1) * ksize];
                for oy in 0..w.out_h {
                    for ox in 0..w.out_w {
                        let dv = dplane[oy * w.out_w + ox];
                        for c in 0..w.channels {
                            for ky in 0..w.k_h {
                                let Some(y) = tap(oy, w.s_h, ky, w.pad_top).filter(|&y| y < w.in_h) else {
                                    continue;
                                };
                                for kx in 0..w.k_w {
                                    let Some(x) = tap(ox, w.s_w, kx, w.pad_left).filter(|&x| x < w.in_w) else {
                                        continue;
                                    };
                                    sample[c * ip + y * w.in_w + x] += dv * kern[(c * w.k_h + ky) * w.k_w + kx];
                                }
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mult2d_transposed_operands() {
        // a = [[1, 2], [3, 4]], a^T x a = [[10, 14], [14, 20]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let mut c = [0.0; 4];
        CpuKernels
            .mult2d(&a, Dims2::new(2, 2), true, &a, Dims2::new(2, 2), false, &mut c, false)
            .unwrap();
        assert_eq!(c, [10.0, 14.0, 14.0, 20.0]);
    }

    #[test]
    fn pool_backward_routes_to_argmax() {
        let w = Window2d::compute(
            "test",
            &[1, 1, 2, 2],
            [2, 2],
            [2, 2],
            crate::descriptors::Padding::Valid,
        )
        .unwrap();
        let input = [1.0, 5.0, 2.0, 3.0];
        let (mut out, mut idx) = ([0.0], [0.0]);
        CpuKernels.mpool2d(&w, 1, &input, &mut out, &mut idx).unwrap();
        assert_eq!((out[0], idx[0]), (5.0, 1.0));

        let mut pd = [0.0; 4];
        CpuKernels.mpool2d_back(&w, 1, &[2.0], &idx, &mut pd).unwrap();
        assert_eq!(pd, [0.0, 2.0, 0.0, 0.0]);
    }
}
