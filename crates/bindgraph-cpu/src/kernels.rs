// Kernels — Host compute routines on f64 buffers
//
// Every operator in a plan is evaluated in f64 regardless of the slot dtype;
// narrowing happens only when a result is written into a tensor. Element-wise
// loops switch to rayon once a buffer reaches the configured threshold, and
// matrix products parallelize over output rows.
//
// Batch normalization treats axis 1 as the channel axis:
//
//   x: [N, C, d2, d3, ...]  →  per-channel statistics over N·d2·d3·...

use rayon::prelude::*;

/// Element-wise and matrix kernels with a serial/parallel cut-over.
#[derive(Debug, Clone, Copy)]
pub struct Kernels {
    threshold: usize,
}

impl Kernels {
    pub fn new(threshold: usize) -> Self {
        Kernels { threshold }
    }

    fn parallel(&self, len: usize) -> bool {
        len >= self.threshold
    }

    /// `out[i] = f(a[i])`
    pub fn unary<F>(&self, out: &mut [f64], a: &[f64], f: F)
    where
        F: Fn(f64) -> f64 + Sync + Send,
    {
        if self.parallel(out.len()) {
            out.par_iter_mut()
                .zip(a.par_iter())
                .for_each(|(o, &x)| *o = f(x));
        } else {
            out.iter_mut().zip(a).for_each(|(o, &x)| *o = f(x));
        }
    }

    /// `out[i] = f(a[i], b[i])`
    pub fn binary<F>(&self, out: &mut [f64], a: &[f64], b: &[f64], f: F)
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        if self.parallel(out.len()) {
            out.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(o, (&x, &y))| *o = f(x, y));
        } else {
            out.iter_mut()
                .zip(a.iter().zip(b))
                .for_each(|(o, (&x, &y))| *o = f(x, y));
        }
    }

    /// `out[i] = f(a[i], b[i], c[i])`
    pub fn ternary<F>(&self, out: &mut [f64], a: &[f64], b: &[f64], c: &[f64], f: F)
    where
        F: Fn(f64, f64, f64) -> f64 + Sync + Send,
    {
        if self.parallel(out.len()) {
            out.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter().zip(c.par_iter())))
                .for_each(|(o, (&x, (&y, &z)))| *o = f(x, y, z));
        } else {
            out.iter_mut()
                .zip(a.iter().zip(b.iter().zip(c)))
                .for_each(|(o, (&x, (&y, &z)))| *o = f(x, y, z));
        }
    }

    /// `acc[i] += delta[i]`
    pub fn add_assign(&self, acc: &mut [f64], delta: &[f64]) {
        if self.parallel(acc.len()) {
            acc.par_iter_mut()
                .zip(delta.par_iter())
                .for_each(|(a, &d)| *a += d);
        } else {
            acc.iter_mut().zip(delta).for_each(|(a, &d)| *a += d);
        }
    }

    pub fn sum(&self, a: &[f64]) -> f64 {
        if self.parallel(a.len()) {
            a.par_iter().sum()
        } else {
            a.iter().sum()
        }
    }

    //  Matrix products (row-major)

    /// `out[m,n] = a[m,k] · b[k,n]`
    pub fn matmul(&self, out: &mut [f64], a: &[f64], b: &[f64], m: usize, k: usize, n: usize) {
        if n == 0 {
            return;
        }
        let row = |(i, o): (usize, &mut [f64])| {
            for (j, cell) in o.iter_mut().enumerate() {
                *cell = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        };
        if self.parallel(m * n) {
            out.par_chunks_mut(n).enumerate().for_each(row);
        } else {
            out.chunks_mut(n).enumerate().for_each(row);
        }
    }

    /// Gradient of `a` in `a · b`: `out[m,k] = g[m,n] · b[k,n]ᵀ`
    pub fn matmul_grad_lhs(
        &self,
        out: &mut [f64],
        g: &[f64],
        b: &[f64],
        m: usize,
        k: usize,
        n: usize,
    ) {
        if k == 0 {
            return;
        }
        let row = |(i, o): (usize, &mut [f64])| {
            for (p, cell) in o.iter_mut().enumerate() {
                *cell = (0..n).map(|j| g[i * n + j] * b[p * n + j]).sum();
            }
        };
        if self.parallel(m * k) {
            out.par_chunks_mut(k).enumerate().for_each(row);
        } else {
            out.chunks_mut(k).enumerate().for_each(row);
        }
    }

    /// Gradient of `b` in `a · b`: `out[k,n] = a[m,k]ᵀ · g[m,n]`
    pub fn matmul_grad_rhs(
        &self,
        out: &mut [f64],
        a: &[f64],
        g: &[f64],
        m: usize,
        k: usize,
        n: usize,
    ) {
        if n == 0 {
            return;
        }
        let row = |(p, o): (usize, &mut [f64])| {
            for (j, cell) in o.iter_mut().enumerate() {
                *cell = (0..m).map(|i| a[i * k + p] * g[i * n + j]).sum();
            }
        };
        if self.parallel(k * n) {
            out.par_chunks_mut(n).enumerate().for_each(row);
        } else {
            out.chunks_mut(n).enumerate().for_each(row);
        }
    }
}

// Batch normalization

/// `(outer, channels, inner)` for a `[N, C, ...]` layout.
fn channel_layout(dims: &[usize]) -> (usize, usize, usize) {
    let outer = dims.first().copied().unwrap_or(1);
    let channels = dims.get(1).copied().unwrap_or(1);
    let inner = dims.iter().skip(2).product();
    (outer, channels, inner)
}

fn channel_of(i: usize, channels: usize, inner: usize) -> usize {
    (i / inner.max(1)) % channels.max(1)
}

/// Biased per-channel mean and variance.
pub fn channel_stats(x: &[f64], dims: &[usize]) -> (Vec<f64>, Vec<f64>) {
    let (outer, channels, inner) = channel_layout(dims);
    let count = (outer * inner).max(1) as f64;
    let mut mean = vec![0.0; channels];
    let mut var = vec![0.0; channels];
    for (i, &v) in x.iter().enumerate() {
        mean[channel_of(i, channels, inner)] += v;
    }
    mean.iter_mut().for_each(|m| *m /= count);
    for (i, &v) in x.iter().enumerate() {
        let c = channel_of(i, channels, inner);
        let d = v - mean[c];
        var[c] += d * d;
    }
    var.iter_mut().for_each(|v| *v /= count);
    (mean, var)
}

pub fn inv_std(var: &[f64], eps: f64) -> Vec<f64> {
    var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect()
}

/// `out = gamma · (x - mean) · inv_std + beta`, per channel.
pub fn batch_norm_forward(
    out: &mut [f64],
    x: &[f64],
    dims: &[usize],
    mean: &[f64],
    inv_std: &[f64],
    gamma: &[f64],
    beta: &[f64],
) {
    let (_, channels, inner) = channel_layout(dims);
    for (i, (o, &v)) in out.iter_mut().zip(x).enumerate() {
        let c = channel_of(i, channels, inner);
        *o = gamma[c] * (v - mean[c]) * inv_std[c] + beta[c];
    }
}

/// Gradients of a training-mode batch norm.
pub struct BatchNormGrads {
    pub data: Vec<f64>,
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
}

pub fn batch_norm_backward(
    g: &[f64],
    x: &[f64],
    dims: &[usize],
    mean: &[f64],
    inv_std: &[f64],
    gamma: &[f64],
) -> BatchNormGrads {
    let (outer, channels, inner) = channel_layout(dims);
    let count = (outer * inner).max(1) as f64;
    let x_hat = |i: usize, c: usize| (x[i] - mean[c]) * inv_std[c];

    let mut sum_g = vec![0.0; channels];
    let mut sum_gx = vec![0.0; channels];
    for (i, &gi) in g.iter().enumerate() {
        let c = channel_of(i, channels, inner);
        sum_g[c] += gi;
        sum_gx[c] += gi * x_hat(i, c);
    }

    let data = g
        .iter()
        .enumerate()
        .map(|(i, &gi)| {
            let c = channel_of(i, channels, inner);
            gamma[c] * inv_std[c] / count * (count * gi - sum_g[c] - x_hat(i, c) * sum_gx[c])
        })
        .collect();

    BatchNormGrads {
        data,
        gamma: sum_gx,
        beta: sum_g,
    }
}
