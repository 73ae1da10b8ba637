//! Layers of the supported topology family: convolution, fully-connected
//! and leaky ReLU.
//!
//! Every layer gets its `LayerRole` once, from its position relative to the
//! noise point: layers up to and including the injection ordinal are
//! `Tracked`, everything after it is `NoiseExempt` (post-processing a
//! private quantity needs no further accounting).

pub mod conv;
pub mod dense;

pub use conv::{AppliedKernel, BoundedConv};
pub use dense::BoundedDense;

use ndarray::ArrayD;

use crate::config::{ControlScheme, LayerBound};
use crate::error::Result;
use crate::ops::leaky_relu;
use crate::params::ParameterStore;

/// Sensitivity settings of a tracked convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSensitivity {
    pub bound: LayerBound,
    pub control: ControlScheme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// Before the noise point; contributes to the sensitivity product.
    Tracked(Option<LayerSensitivity>),
    /// After the noise point.
    NoiseExempt,
}

impl LayerRole {
    pub fn is_tracked(&self) -> bool { matches!(self, Self::Tracked(_)) }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyRelu {
    pub leakiness: f32,
    pub role: LayerRole,
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv(BoundedConv),
    Dense(BoundedDense),
    Relu(LeakyRelu),
}

impl Layer {
    pub fn name(&self) -> &str {
        match self { Self::Conv(c) => c.name(), Self::Dense(d) => d.name(), Self::Relu(_) => "relu" }
    }

    pub fn role(&self) -> LayerRole {
        match self { Self::Conv(c) => c.role(), Self::Dense(_) => LayerRole::NoiseExempt, Self::Relu(r) => r.role }
    }

    pub fn forward(&self, x: ArrayD<f32>, params: &ParameterStore) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv(c) => c.forward(x, params),
            Self::Dense(d) => d.forward(x, params),
            Self::Relu(r) => Ok(leaky_relu(x, r.leakiness)),
        }
    }
}
