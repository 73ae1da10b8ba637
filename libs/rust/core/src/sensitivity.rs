//! Running product of per-layer Lipschitz bounds for the layers that sit
//! before the noise point.
//!
//! Factors are recorded once, while the model is built, as descriptions of
//! how to measure them. They are evaluated against the current parameter
//! values, so the product always reflects the weights as they are now.

use ndarray::ArrayD;

use crate::config::SensitivityNorm;
use crate::error::{PixelDpError, Result};
use crate::linalg::largest_singular_value;
use crate::ops::{kernel_matrix, max_channel_norm};
use crate::params::{ParamId, ParameterStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensitivityFactor {
    /// Structurally enforced bound of exactly 1.
    Unit,
    /// Largest singular value of a kernel's `[out, f·f·in]` reshape.
    SpectralNorm(ParamId),
    /// Largest per-output-channel norm of a kernel, measured at runtime.
    MaxChannelNorm { param: ParamId, norm: SensitivityNorm },
}

impl SensitivityFactor {
    /// Fails on non-finite weights or a non-finite measurement.
    pub fn evaluate(&self, params: &ParameterStore) -> Result<f64> {
        let value = match *self {
            Self::Unit => return Ok(1.0),
            Self::SpectralNorm(id) => largest_singular_value(kernel_matrix(finite_value(params, id)?)?.view()) as f64,
            Self::MaxChannelNorm { param, norm } => max_channel_norm(finite_value(params, param)?, norm)? as f64,
        };
        if !value.is_finite() {
            return Err(PixelDpError::InvalidParameter { name: "sensitivity", value });
        }
        Ok(value)
    }
}

fn finite_value(params: &ParameterStore, id: ParamId) -> Result<&ArrayD<f32>> {
    let p = params.get(id)?;
    match p.value.iter().find(|v| !v.is_finite()) {
        Some(&bad) => Err(PixelDpError::NonFinite { name: p.name.clone(), value: f64::from(bad) }),
        None => Ok(&p.value),
    }
}

/// Ordered factor sequence, seeded with the identity.
#[derive(Debug, Clone)]
pub struct SensitivityTracker {
    factors: Vec<SensitivityFactor>,
}

impl Default for SensitivityTracker {
    fn default() -> Self { Self { factors: vec![SensitivityFactor::Unit] } }
}

impl SensitivityTracker {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, factor: SensitivityFactor) {
        tracing::debug!(?factor, position = self.factors.len(), "sensitivity factor registered");
        self.factors.push(factor);
    }

    pub fn factors(&self) -> &[SensitivityFactor] { &self.factors }

    pub fn values(&self, params: &ParameterStore) -> Result<Vec<f64>> {
        self.factors.iter().map(|f| f.evaluate(params)).collect()
    }

    /// Accumulated bound of every tracked layer; composition is multiplicative.
    pub fn product(&self, params: &ParameterStore) -> Result<f64> {
        self.factors.iter().try_fold(1.0, |acc, f| Ok(acc * f.evaluate(params)?))
    }
}
