//! Calibrated noise injection at a single, build-time-fixed position.
//!
//! The noise scale is `ramp × multiplier × sensitivity`, where the multiplier
//! comes from the (ε, δ) budget and the attack norm bound, and the
//! sensitivity is the tracker product (`optimize`) or 1 (`bound`, where every
//! tracked layer is normalised to contribute exactly 1).

use ndarray::ArrayD;
use rand::Rng;
use rand_distr::{Exp1, StandardNormal};

use crate::config::{ControlScheme, Hyperparameters, SensitivityNorm};
use crate::error::{PixelDpError, Result};
use crate::metrics::PRIVACY_METRICS;
use crate::params::ParameterStore;
use crate::sensitivity::SensitivityTracker;

/// Multiplier turning a unit sensitivity into the noise standard deviation
/// (Gaussian, l2) or scale (Laplace, l1) that achieves (ε, δ)-DP against
/// perturbations of norm up to `attack_norm_bound`.
pub fn privacy_multiplier(norm: SensitivityNorm, epsilon: f64, delta: f64, attack_norm_bound: f64) -> Result<f64> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(PixelDpError::InvalidParameter { name: "dp_epsilon", value: epsilon });
    }
    if !(delta.is_finite() && delta > 0.0 && delta < 1.0) {
        return Err(PixelDpError::InvalidParameter { name: "dp_delta", value: delta });
    }
    if !(attack_norm_bound.is_finite() && attack_norm_bound >= 0.0) {
        return Err(PixelDpError::InvalidParameter { name: "attack_norm_bound", value: attack_norm_bound });
    }
    Ok(match norm {
        SensitivityNorm::L2 => attack_norm_bound * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon,
        SensitivityNorm::L1 => attack_norm_bound / epsilon,
    })
}

/// Activation after noise, together with what was added.
#[derive(Debug, Clone)]
pub struct NoisyActivation {
    pub activation: ArrayD<f32>,
    pub noise: ArrayD<f32>,
    pub scale: f64,
}

#[derive(Debug, Clone)]
pub enum NoiseOutcome {
    Passthrough(ArrayD<f32>),
    Injected(NoisyActivation),
}

impl NoiseOutcome {
    pub fn activation(&self) -> &ArrayD<f32> {
        match self { Self::Passthrough(a) => a, Self::Injected(n) => &n.activation }
    }
}

#[derive(Debug, Clone)]
pub struct NoiseInjector {
    norm: SensitivityNorm,
    control: ControlScheme,
    multiplier: f64,
    position: usize,
}

impl NoiseInjector {
    pub fn new(hps: &Hyperparameters) -> Result<Self> {
        let multiplier = privacy_multiplier(hps.sensitivity_norm, hps.dp_epsilon, hps.dp_delta, hps.attack_norm_bound)?;
        if multiplier == 0.0 {
            tracing::warn!(norm=%hps.sensitivity_norm, "attack_norm_bound is 0: noise layer adds no noise");
        }
        Ok(Self { norm: hps.sensitivity_norm, control: hps.sensitivity_control_scheme, multiplier, position: hps.noise_after_n_layers })
    }

    pub fn norm(&self) -> SensitivityNorm { self.norm }
    pub fn control(&self) -> ControlScheme { self.control }
    pub fn multiplier(&self) -> f64 { self.multiplier }
    pub fn position(&self) -> usize { self.position }

    pub fn effective_sensitivity(&self, tracker: &SensitivityTracker, params: &ParameterStore) -> Result<f64> {
        match self.control {
            ControlScheme::Optimize => tracker.product(params),
            ControlScheme::Bound => Ok(1.0),
        }
    }

    /// Adds per-element Laplace (l1) or Gaussian (l2) noise scaled by
    /// `noise_ramp × multiplier × effective sensitivity`.
    pub fn inject_noise<R: Rng + ?Sized>(
        &self,
        activation: ArrayD<f32>,
        noise_ramp: f32,
        tracker: &SensitivityTracker,
        params: &ParameterStore,
        rng: &mut R,
    ) -> Result<NoisyActivation> {
        if !(noise_ramp.is_finite() && noise_ramp >= 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "noise_ramp", value: noise_ramp as f64 });
        }
        let sensitivity = self.effective_sensitivity(tracker, params)?;
        let scale = noise_ramp as f64 * self.multiplier * sensitivity;
        let s = scale as f32;
        let noise = match self.norm {
            SensitivityNorm::L1 => ArrayD::from_shape_simple_fn(activation.raw_dim(), || {
                let laplace: f32 = rng.sample::<f32, _>(Exp1) - rng.sample::<f32, _>(Exp1);
                s * laplace
            }),
            SensitivityNorm::L2 => ArrayD::from_shape_simple_fn(activation.raw_dim(), || s * rng.sample::<f32, _>(StandardNormal)),
        };
        PRIVACY_METRICS.noise_injections_total.add(1, &[]);
        PRIVACY_METRICS.noise_scale.record(scale, &[]);
        PRIVACY_METRICS.pre_noise_sensitivity.record(sensitivity, &[]);
        Ok(NoisyActivation { activation: &activation + &noise, noise, scale })
    }

    /// Identity unless `position` is the configured injection ordinal.
    pub fn maybe_inject_noise<R: Rng + ?Sized>(
        &self,
        activation: ArrayD<f32>,
        position: usize,
        noise_ramp: f32,
        tracker: &SensitivityTracker,
        params: &ParameterStore,
        rng: &mut R,
    ) -> Result<NoiseOutcome> {
        if position != self.position { return Ok(NoiseOutcome::Passthrough(activation)); }
        Ok(NoiseOutcome::Injected(self.inject_noise(activation, noise_ramp, tracker, params, rng)?))
    }
}
