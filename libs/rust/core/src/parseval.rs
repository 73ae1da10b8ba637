//! Parseval retraction: after each optimizer step every tracked tensor is
//! pulled toward the nearest matrix with orthonormal rows,
//! `w' = (1 + β)·w − β·w·(wᵀ·w)`.
//!
//! This is a contraction, not a projection. The spectral-norm sensitivity of
//! an orthonormal-bound layer is only close to 1 if the pass runs every step.

use ndarray::{Array2, ArrayView2};

use crate::error::{PixelDpError, Result};
use crate::metrics::PRIVACY_METRICS;
use crate::ops::{from_kernel_matrix, kernel_matrix};
use crate::params::{ParamKind, ParameterStore};

pub const PARSEVAL_BETA: f32 = 0.001;

/// One retraction step on an `[out, in]` matrix.
pub fn retract(w: ArrayView2<f32>, beta: f32) -> Array2<f32> {
    // w·(wᵀ·w) == (w·wᵀ)·w; the left form keeps the Gram matrix at [out, out]
    let gram = w.dot(&w.t());
    &w * (1.0 + beta) - &(gram.dot(&w) * beta)
}

#[derive(Debug, Clone, Copy)]
pub struct ParsevalTightener {
    beta: f32,
}

impl Default for ParsevalTightener {
    fn default() -> Self { Self { beta: PARSEVAL_BETA } }
}

impl ParsevalTightener {
    pub fn new() -> Self { Self::default() }

    /// Retracts every tensor tagged for tightening; returns how many were
    /// updated.
    pub fn tighten(&self, params: &mut ParameterStore) -> Result<usize> {
        let tracked = params.tracked_for_tightening();
        for &id in &tracked {
            let p = params.get(id)?;
            let updated = match p.kind {
                ParamKind::ConvKernel => {
                    let w = kernel_matrix(&p.value)?;
                    from_kernel_matrix(retract(w.view(), self.beta).view(), p.value.shape())?
                }
                ParamKind::DenseWeights => {
                    let w_t = p.value.view().into_dimensionality::<ndarray::Ix2>()?;
                    retract(w_t.t(), self.beta).reversed_axes().into_dyn()
                }
                ParamKind::Bias => return Err(PixelDpError::config(format!("bias '{}' is tagged for tightening", p.name))),
            };
            params.assign(id, updated)?;
        }
        if !tracked.is_empty() {
            PRIVACY_METRICS.tightening_passes_total.add(1, &[]);
            PRIVACY_METRICS.tightened_tensors_total.add(tracked.len() as u64, &[]);
        }
        Ok(tracked.len())
    }
}

/// Frobenius distance of `wᵀ·w` from the identity.
pub fn orthonormality_gap(w: ArrayView2<f32>) -> f64 {
    let w64 = w.mapv(f64::from);
    let gram = w64.t().dot(&w64);
    gram.indexed_iter().map(|((i, j), v)| { let d = if i == j { v - 1.0 } else { *v }; d * d }).sum::<f64>().sqrt()
}
