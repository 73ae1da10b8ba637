//! Eager tensor primitives used by the layers: SAME-padded convolution,
//! kernel reshapes and per-channel norms.
//!
//! Activations are NHWC, kernels are `[filter, filter, in, out]`.

use ndarray::{s, Array2, Array4, ArrayD, ArrayView2, ArrayView4, Axis, IxDyn};

use crate::config::SensitivityNorm;
use crate::error::{PixelDpError, Result};

/// Lower clamp applied to squared / absolute sums before dividing.
pub const NORM_EPSILON: f32 = 1e-12;

/// 2-D convolution with SAME padding. Output spatial size is
/// `ceil(in / stride)`; odd padding puts the extra row/column at the end.
pub fn conv2d_same(input: ArrayView4<f32>, kernel: ArrayView4<f32>, stride: usize) -> Result<Array4<f32>> {
    if stride == 0 { return Err(PixelDpError::config("convolution stride must be positive")); }
    let (n, h, w, c_in) = input.dim();
    let (kh, kw, k_in, c_out) = kernel.dim();
    if k_in != c_in {
        return Err(PixelDpError::shape(format!("kernel expects {k_in} input channels, activation has {c_in}")));
    }
    let out_h = (h + stride - 1) / stride;
    let out_w = (w + stride - 1) / stride;
    let pad_top = (((out_h - 1) * stride + kh).saturating_sub(h) / 2) as isize;
    let pad_left = (((out_w - 1) * stride + kw).saturating_sub(w) / 2) as isize;

    let mut out = Array4::<f32>::zeros((n, out_h, out_w, c_out));
    for b in 0..n {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = out.slice_mut(s![b, oy, ox, ..]);
                for ky in 0..kh {
                    let iy = (oy * stride + ky) as isize - pad_top;
                    if iy < 0 || iy >= h as isize { continue; }
                    for kx in 0..kw {
                        let ix = (ox * stride + kx) as isize - pad_left;
                        if ix < 0 || ix >= w as isize { continue; }
                        let pixel = input.slice(s![b, iy as usize, ix as usize, ..]);
                        let taps = kernel.slice(s![ky, kx, .., ..]);
                        acc += &pixel.dot(&taps);
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Reshapes a `[f, f, in, out]` kernel to the `[out, f·f·in]` matrix whose
/// rows are the output channels.
pub fn kernel_matrix(kernel: &ArrayD<f32>) -> Result<Array2<f32>> {
    let shape = kernel.shape();
    let out = *shape.last().ok_or_else(|| PixelDpError::shape("kernel has no dimensions"))?;
    if out == 0 { return Err(PixelDpError::shape("kernel has zero output channels")); }
    let rows = kernel.len() / out;
    let flat = Array2::from_shape_vec((rows, out), kernel.iter().copied().collect())?;
    Ok(flat.reversed_axes().as_standard_layout().into_owned())
}

/// Inverse of [`kernel_matrix`].
pub fn from_kernel_matrix(matrix: ArrayView2<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    let values: Vec<f32> = matrix.t().iter().copied().collect();
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
}

/// Norm of every row of `m`.
pub fn row_norms(m: ArrayView2<f32>, norm: SensitivityNorm) -> Vec<f32> {
    m.axis_iter(Axis(0))
        .map(|row| match norm {
            SensitivityNorm::L1 => row.iter().map(|v| v.abs()).sum(),
            SensitivityNorm::L2 => row.iter().map(|v| v * v).sum::<f32>().sqrt(),
        })
        .collect()
}

/// Per-output-channel norms of a `[f, f, in, out]` kernel.
pub fn channel_norms(kernel: &ArrayD<f32>, norm: SensitivityNorm) -> Result<Vec<f32>> {
    Ok(row_norms(kernel_matrix(kernel)?.view(), norm))
}

/// Largest per-output-channel norm; NaN if any channel norm is NaN.
pub fn max_channel_norm(kernel: &ArrayD<f32>, norm: SensitivityNorm) -> Result<f32> {
    Ok(channel_norms(kernel, norm)?.into_iter().fold(0.0, |acc, n| if acc.is_nan() || n.is_nan() { f32::NAN } else { acc.max(n) }))
}

/// Scales every output channel to unit norm.
pub fn normalize_channels(kernel: &ArrayD<f32>, norm: SensitivityNorm) -> Result<ArrayD<f32>> {
    let mut m = kernel_matrix(kernel)?;
    for mut row in m.axis_iter_mut(Axis(0)) {
        let denom = match norm {
            SensitivityNorm::L1 => row.iter().map(|v| v.abs()).sum::<f32>().max(NORM_EPSILON),
            SensitivityNorm::L2 => row.iter().map(|v| v * v).sum::<f32>().max(NORM_EPSILON).sqrt(),
        };
        row.mapv_inplace(|v| v / denom);
    }
    from_kernel_matrix(m.view(), kernel.shape())
}

pub fn leaky_relu(x: ArrayD<f32>, leakiness: f32) -> ArrayD<f32> {
    x.mapv_into(|v| if v < 0.0 { leakiness * v } else { v })
}

/// Collapses every axis after the first.
pub fn flatten(x: ArrayD<f32>) -> Result<Array2<f32>> {
    let rows = *x.shape().first().ok_or_else(|| PixelDpError::shape("cannot flatten a scalar"))?;
    let cols = if rows == 0 { 0 } else { x.len() / rows };
    let values: Vec<f32> = x.iter().copied().collect();
    Ok(Array2::from_shape_vec((rows, cols), values)?)
}
