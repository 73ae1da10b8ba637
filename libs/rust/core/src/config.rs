//! Run configuration: privacy budget, per-layer sensitivity settings and
//! optimizer choice.
//!
//! Layering follows the usual order: built-in defaults, then an optional YAML
//! file, then `PIXELDP__*` environment variables. Everything is validated
//! before a single layer is built.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PixelDpError, Result};

/// Norm in which sensitivity is measured; selects the noise mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityNorm {
    /// Laplace mechanism.
    L1,
    /// Gaussian mechanism.
    L2,
}

impl FromStr for SensitivityNorm {
    type Err = PixelDpError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => Err(PixelDpError::config(format!("unrecognized sensitivity norm '{other}' (expected l1 or l2)"))),
        }
    }
}

impl Display for SensitivityNorm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self { Self::L1 => write!(f, "l1"), Self::L2 => write!(f, "l2") }
    }
}

/// Whether a layer's sensitivity is structurally enforced or only measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlScheme {
    Bound,
    Optimize,
}

impl FromStr for ControlScheme {
    type Err = PixelDpError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bound" => Ok(Self::Bound),
            "optimize" => Ok(Self::Optimize),
            other => Err(PixelDpError::config(format!("unrecognized sensitivity control scheme '{other}'"))),
        }
    }
}

/// Sensitivity bound applied by a pre-noise convolution, named
/// `<input norm>_<output norm>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerBound {
    /// Parseval (orthonormal) kernel, l2 -> l2.
    #[serde(rename = "l2_l2")]
    Orthonormal,
    /// Unit L2 norm per output channel, l1 -> l2.
    #[serde(rename = "l1_l2")]
    L2Channel,
    /// Unit L1 norm per output channel, l1 -> l1.
    #[serde(rename = "l1_l1")]
    L1Channel,
}

impl LayerBound {
    pub fn input_norm(self) -> SensitivityNorm {
        match self { Self::Orthonormal => SensitivityNorm::L2, Self::L2Channel | Self::L1Channel => SensitivityNorm::L1 }
    }

    pub fn output_norm(self) -> SensitivityNorm {
        match self { Self::Orthonormal | Self::L2Channel => SensitivityNorm::L2, Self::L1Channel => SensitivityNorm::L1 }
    }
}

impl FromStr for LayerBound {
    type Err = PixelDpError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2_l2" => Ok(Self::Orthonormal),
            "l1_l2" => Ok(Self::L2Channel),
            "l1_l1" => Ok(Self::L1Channel),
            other => Err(PixelDpError::config(format!("unrecognized layer sensitivity bound '{other}'"))),
        }
    }
}

impl Display for LayerBound {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self { Self::Orthonormal => write!(f, "l2_l2"), Self::L2Channel => write!(f, "l1_l2"), Self::L1Channel => write!(f, "l1_l1") }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "sgd", alias = "gradient_descent")]
    GradientDescent,
    #[serde(rename = "mom", alias = "momentum")]
    Momentum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub batch_size: usize,
    pub n_draws: usize,
    pub image_size: usize,
    #[serde(default = "default_image_channels")]
    pub image_channels: usize,
    pub num_classes: usize,
    pub lrn_rate: f32,
    pub optimizer: OptimizerKind,
    pub weight_decay_rate: f32,
    pub dp_epsilon: f64,
    pub dp_delta: f64,
    pub attack_norm_bound: f64,
    pub noise_after_n_layers: usize,
    pub sensitivity_norm: SensitivityNorm,
    pub sensitivity_control_scheme: ControlScheme,
    /// One entry per convolution placed before the noise point, in order.
    #[serde(default)]
    pub layer_sensitivity_bounds: Vec<LayerBound>,
    /// Optional per-layer control overrides; missing entries fall back to
    /// `sensitivity_control_scheme`.
    #[serde(default)]
    pub layer_control_schemes: Vec<ControlScheme>,
}

fn default_image_channels() -> usize { 3 }

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            batch_size: 128,
            n_draws: 1,
            image_size: 32,
            image_channels: 3,
            num_classes: 10,
            lrn_rate: 0.1,
            optimizer: OptimizerKind::Momentum,
            weight_decay_rate: 0.0002,
            dp_epsilon: 1.0,
            dp_delta: 0.05,
            attack_norm_bound: 0.1,
            noise_after_n_layers: 1,
            sensitivity_norm: SensitivityNorm::L2,
            sensitivity_control_scheme: ControlScheme::Bound,
            layer_sensitivity_bounds: vec![LayerBound::Orthonormal],
            layer_control_schemes: Vec::new(),
        }
    }
}

impl Hyperparameters {
    /// Loads defaults, then `file` (or `PIXELDP_CONFIG_FILE`), then
    /// `PIXELDP__*` environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults_builder()?;
        let file = file.map(|p| p.to_path_buf()).or_else(|| std::env::var("PIXELDP_CONFIG_FILE").ok().map(Into::into));
        if let Some(path) = file {
            tracing::info!(path=%path.display(), "loading hyperparameters file");
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("PIXELDP").separator("__").try_parsing(true));
        let hps: Hyperparameters = builder.build()?.try_deserialize()?;
        hps.validate()?;
        Ok(hps)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg = Self::defaults_builder()?
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()?;
        let hps: Hyperparameters = cfg.try_deserialize()?;
        hps.validate()?;
        Ok(hps)
    }

    fn defaults_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let d = Self::default();
        let bounds: Vec<String> = d.layer_sensitivity_bounds.iter().map(|b| b.to_string()).collect();
        Ok(config::Config::builder()
            .set_default("batch_size", d.batch_size as i64)?
            .set_default("n_draws", d.n_draws as i64)?
            .set_default("image_size", d.image_size as i64)?
            .set_default("image_channels", d.image_channels as i64)?
            .set_default("num_classes", d.num_classes as i64)?
            .set_default("lrn_rate", d.lrn_rate as f64)?
            .set_default("optimizer", "mom")?
            .set_default("weight_decay_rate", d.weight_decay_rate as f64)?
            .set_default("dp_epsilon", d.dp_epsilon)?
            .set_default("dp_delta", d.dp_delta)?
            .set_default("attack_norm_bound", d.attack_norm_bound)?
            .set_default("noise_after_n_layers", d.noise_after_n_layers as i64)?
            .set_default("sensitivity_norm", d.sensitivity_norm.to_string())?
            .set_default("sensitivity_control_scheme", "bound")?
            .set_default("layer_sensitivity_bounds", bounds)?)
    }

    /// Rejects values that would make the privacy multiplier infinite,
    /// undefined or meaningless. The noise ordinal is checked against the
    /// architecture at build time.
    pub fn validate(&self) -> Result<()> {
        if !(self.dp_epsilon.is_finite() && self.dp_epsilon > 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "dp_epsilon", value: self.dp_epsilon });
        }
        if !(self.dp_delta.is_finite() && self.dp_delta > 0.0 && self.dp_delta < 1.0) {
            return Err(PixelDpError::InvalidParameter { name: "dp_delta", value: self.dp_delta });
        }
        if !(self.attack_norm_bound.is_finite() && self.attack_norm_bound >= 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "attack_norm_bound", value: self.attack_norm_bound });
        }
        if !(self.lrn_rate.is_finite() && self.lrn_rate > 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "lrn_rate", value: self.lrn_rate as f64 });
        }
        if !(self.weight_decay_rate.is_finite() && self.weight_decay_rate >= 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "weight_decay_rate", value: self.weight_decay_rate as f64 });
        }
        if self.batch_size == 0 || self.n_draws == 0 || self.image_size == 0 || self.image_channels == 0 || self.num_classes == 0 {
            return Err(PixelDpError::config("batch_size, n_draws, image_size, image_channels and num_classes must be positive"));
        }
        if self.noise_after_n_layers == 0 {
            return Err(PixelDpError::config("noise_after_n_layers must name a layer (ordinals start at 1)"));
        }
        Ok(())
    }

    /// Control scheme of the `index`-th tracked convolution.
    pub fn layer_control(&self, index: usize) -> ControlScheme {
        self.layer_control_schemes.get(index).copied().unwrap_or(self.sensitivity_control_scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_norm_is_rejected() {
        assert!("l3".parse::<SensitivityNorm>().is_err());
        assert_eq!("L2".parse::<SensitivityNorm>().unwrap(), SensitivityNorm::L2);
        assert!("l2_l1".parse::<LayerBound>().is_err());
    }

    #[test]
    fn bound_names_round_trip_through_display() {
        for b in [LayerBound::Orthonormal, LayerBound::L2Channel, LayerBound::L1Channel] {
            assert_eq!(b.to_string().parse::<LayerBound>().unwrap(), b);
        }
        assert_eq!(LayerBound::L2Channel.input_norm(), SensitivityNorm::L1);
        assert_eq!(LayerBound::L2Channel.output_norm(), SensitivityNorm::L2);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let hps = Hyperparameters::from_yaml_str(
            "dp_epsilon: 2.0\noptimizer: sgd\nsensitivity_norm: l1\nlayer_sensitivity_bounds: [l1_l1, l1_l1]\n",
        ).unwrap();
        assert_eq!(hps.dp_epsilon, 2.0);
        assert_eq!(hps.optimizer, OptimizerKind::GradientDescent);
        assert_eq!(hps.sensitivity_norm, SensitivityNorm::L1);
        assert_eq!(hps.layer_sensitivity_bounds, vec![LayerBound::L1Channel, LayerBound::L1Channel]);
        assert_eq!(hps.batch_size, 128);
    }

    #[test]
    fn yaml_with_unknown_norm_fails() {
        assert!(Hyperparameters::from_yaml_str("sensitivity_norm: linf\n").is_err());
    }

    #[test]
    fn non_positive_budget_fails_fast() {
        let mut hps = Hyperparameters::default();
        hps.dp_epsilon = 0.0;
        assert!(matches!(hps.validate(), Err(PixelDpError::InvalidParameter { name: "dp_epsilon", .. })));
        let mut hps = Hyperparameters::default();
        hps.dp_delta = -0.1;
        assert!(matches!(hps.validate(), Err(PixelDpError::InvalidParameter { name: "dp_delta", .. })));
    }

    #[test]
    fn layer_control_falls_back_to_global() {
        let mut hps = Hyperparameters::default();
        hps.sensitivity_control_scheme = ControlScheme::Optimize;
        hps.layer_control_schemes = vec![ControlScheme::Bound];
        assert_eq!(hps.layer_control(0), ControlScheme::Bound);
        assert_eq!(hps.layer_control(1), ControlScheme::Optimize);
    }
}
