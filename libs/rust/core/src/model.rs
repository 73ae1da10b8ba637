//! Model construction and the forward pass.
//!
//! `ModelBuilder::build` is the single construction pass: it validates the
//! configuration, assigns every layer its role from the noise ordinal,
//! initialises parameters and fills the sensitivity tracker. Afterwards the
//! structure is fixed; only parameter values change.

use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ControlScheme, Hyperparameters, SensitivityNorm};
use crate::error::{PixelDpError, Result};
use crate::layers::{BoundedConv, BoundedDense, Layer, LayerRole, LayerSensitivity, LeakyRelu};
use crate::noise::{NoiseInjector, NoiseOutcome};
use crate::params::{ParamId, ParameterStore};
use crate::sensitivity::SensitivityTracker;

fn default_stride() -> usize { 1 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv {
        name: String,
        filter_size: usize,
        in_filters: usize,
        out_filters: usize,
        #[serde(default = "default_stride")]
        stride: usize,
    },
    Relu {
        #[serde(default)]
        leakiness: f32,
    },
    FullyConnected {
        name: String,
        out_dim: usize,
        #[serde(default)]
        parseval: bool,
    },
}

/// Ordered layer list; position `i` (1-based) is the ordinal that
/// `noise_after_n_layers` refers to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Architecture {
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    pub fn new(layers: Vec<LayerSpec>) -> Self { Self { layers } }

    pub fn from_yaml(text: &str) -> Result<Self> { Ok(serde_yaml::from_str(text)?) }

    pub fn len(&self) -> usize { self.layers.len() }
    pub fn is_empty(&self) -> bool { self.layers.is_empty() }
}

/// Shape of the activation flowing between layers, tracked at build time.
#[derive(Debug, Clone, Copy)]
enum FlowShape {
    Spatial { size: usize, channels: usize },
    Flat(usize),
}

impl FlowShape {
    fn features(self) -> usize {
        match self { Self::Spatial { size, channels } => size * size * channels, Self::Flat(n) => n }
    }
}

pub struct ModelBuilder {
    hps: Hyperparameters,
}

impl ModelBuilder {
    pub fn new(hps: Hyperparameters) -> Self { Self { hps } }

    pub fn build<R: Rng + ?Sized>(self, arch: &Architecture, rng: &mut R) -> Result<Model> {
        let hps = self.hps;
        hps.validate()?;
        let ordinal = hps.noise_after_n_layers;
        if ordinal == 0 || ordinal > arch.len() {
            return Err(PixelDpError::config(format!("no layer occupies noise injection ordinal {ordinal} (architecture has {} layers)", arch.len())));
        }
        let noise = NoiseInjector::new(&hps)?;

        let mut params = ParameterStore::new();
        let mut tracker = SensitivityTracker::new();
        let mut layers = Vec::with_capacity(arch.len());
        let mut flow = FlowShape::Spatial { size: hps.image_size, channels: hps.image_channels };
        // norm expected at the next tracked layer's input; `None` until the first one
        let mut chain_norm: Option<SensitivityNorm> = None;
        let mut attack_norm: Option<SensitivityNorm> = None;
        let mut tracked_convs = 0usize;

        for (i, spec) in arch.layers.iter().enumerate() {
            let position = i + 1;
            let pre_noise = position <= ordinal;
            let layer = match spec {
                LayerSpec::Conv { name, filter_size, in_filters, out_filters, stride } => {
                    let (size, channels) = match flow {
                        FlowShape::Spatial { size, channels } => (size, channels),
                        FlowShape::Flat(_) => return Err(PixelDpError::config(format!("{name}: convolution after a fully-connected layer"))),
                    };
                    if channels != *in_filters {
                        return Err(PixelDpError::config(format!("{name}: expects {in_filters} input channels, previous layer yields {channels}")));
                    }
                    let role = if pre_noise {
                        let bound = *hps.layer_sensitivity_bounds.get(tracked_convs).ok_or_else(|| {
                            PixelDpError::config(format!("{name}: no entry in layer_sensitivity_bounds for tracked convolution #{}", tracked_convs + 1))
                        })?;
                        let control = hps.layer_control(tracked_convs);
                        tracked_convs += 1;
                        check_chain(name, bound.input_norm(), &mut chain_norm)?;
                        chain_norm = Some(bound.output_norm());
                        attack_norm.get_or_insert(bound.input_norm());
                        LayerRole::Tracked(Some(LayerSensitivity { bound, control }))
                    } else {
                        LayerRole::NoiseExempt
                    };
                    let conv = BoundedConv::build(name, *filter_size, *in_filters, *out_filters, *stride, role, &mut params, &mut tracker, rng)?;
                    if let LayerRole::Tracked(Some(LayerSensitivity { control: ControlScheme::Optimize, .. })) = role {
                        if hps.sensitivity_control_scheme == ControlScheme::Bound {
                            return Err(PixelDpError::config(format!(
                                "{name}: unsupported sensitivity configuration for a tracked layer (optimize layer before a bound noise point)"
                            )));
                        }
                    }
                    flow = FlowShape::Spatial { size: (size + stride - 1) / stride, channels: *out_filters };
                    Layer::Conv(conv)
                }
                LayerSpec::Relu { leakiness } => {
                    if pre_noise && !(0.0..=1.0).contains(leakiness) {
                        return Err(PixelDpError::config(format!("relu at position {position}: leakiness {leakiness} is not 1-Lipschitz")));
                    }
                    let role = if pre_noise { LayerRole::Tracked(None) } else { LayerRole::NoiseExempt };
                    Layer::Relu(LeakyRelu { leakiness: *leakiness, role })
                }
                LayerSpec::FullyConnected { name, out_dim, parseval } => {
                    if pre_noise {
                        return Err(PixelDpError::config(format!(
                            "{name}: unsupported sensitivity configuration for a tracked layer (fully-connected layers cannot precede the noise point)"
                        )));
                    }
                    let dense = BoundedDense::build(name, flow.features(), *out_dim, *parseval, &mut params, rng)?;
                    flow = FlowShape::Flat(*out_dim);
                    Layer::Dense(dense)
                }
            };
            layers.push(layer);
        }

        if let Some(out) = chain_norm {
            if out != hps.sensitivity_norm {
                return Err(PixelDpError::config(format!(
                    "unsupported sensitivity configuration for a tracked layer: last tracked layer bounds {out} sensitivity but the noise layer uses {}",
                    hps.sensitivity_norm
                )));
            }
        }
        if hps.layer_sensitivity_bounds.len() > tracked_convs {
            warn!(configured = hps.layer_sensitivity_bounds.len(), used = tracked_convs, "extra layer_sensitivity_bounds entries ignored");
        }
        let attack_norm = attack_norm.unwrap_or(hps.sensitivity_norm);
        if hps.sensitivity_control_scheme == ControlScheme::Optimize {
            warn!("noise calibrated on measured sensitivity; the guarantee is not structurally enforced");
        }
        info!(
            layers = layers.len(),
            noise_after = ordinal,
            mechanism = %hps.sensitivity_norm,
            %attack_norm,
            multiplier = noise.multiplier(),
            tracked_tensors = params.tracked_for_tightening().len(),
            "model built"
        );
        Ok(Model { hps, layers, params, tracker, noise, attack_norm })
    }
}

fn check_chain(name: &str, input: SensitivityNorm, chain: &mut Option<SensitivityNorm>) -> Result<()> {
    match *chain {
        Some(expected) if expected != input => Err(PixelDpError::config(format!(
            "{name}: unsupported sensitivity configuration for a tracked layer (takes {input} input, previous tracked layer bounds {expected})"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: ArrayD<f32>,
    /// Noise added at the injection point.
    pub noise: ArrayD<f32>,
    pub noise_scale: f64,
}

#[derive(Debug, Clone)]
pub struct Model {
    hps: Hyperparameters,
    layers: Vec<Layer>,
    params: ParameterStore,
    tracker: SensitivityTracker,
    noise: NoiseInjector,
    attack_norm: SensitivityNorm,
}

impl Model {
    pub fn hyperparameters(&self) -> &Hyperparameters { &self.hps }
    pub fn layers(&self) -> &[Layer] { &self.layers }
    pub fn params(&self) -> &ParameterStore { &self.params }
    pub fn params_mut(&mut self) -> &mut ParameterStore { &mut self.params }
    pub fn tracker(&self) -> &SensitivityTracker { &self.tracker }
    pub fn noise_injector(&self) -> &NoiseInjector { &self.noise }
    /// Norm in which `attack_norm_bound` is measured (input norm of the
    /// first tracked layer).
    pub fn attack_norm(&self) -> SensitivityNorm { self.attack_norm }
    pub fn tracked_tensors(&self) -> Vec<ParamId> { self.params.tracked_for_tightening() }

    /// Accumulated Lipschitz bound of the sub-network before the noise.
    pub fn pre_noise_sensitivity(&self) -> Result<f64> { self.tracker.product(&self.params) }

    /// Runs every layer in order; noise is added right after layer
    /// `noise_after_n_layers`, scaled by `noise_ramp`.
    pub fn forward<R: Rng + ?Sized>(&self, images: &ArrayD<f32>, noise_ramp: f32, rng: &mut R) -> Result<ForwardOutput> {
        if images.ndim() != 4 {
            return Err(PixelDpError::shape(format!("images must be [batch, h, w, c], got {:?}", images.shape())));
        }
        let mut x = images.clone();
        let mut injected = None;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x, &self.params)?;
            x = match self.noise.maybe_inject_noise(x, i + 1, noise_ramp, &self.tracker, &self.params, rng)? {
                NoiseOutcome::Passthrough(a) => a,
                NoiseOutcome::Injected(n) => {
                    injected = Some((n.noise, n.scale));
                    n.activation
                }
            };
        }
        let (noise, noise_scale) = injected.ok_or_else(|| PixelDpError::config("noise point was never reached"))?;
        Ok(ForwardOutput { logits: x, noise, noise_scale })
    }
}
