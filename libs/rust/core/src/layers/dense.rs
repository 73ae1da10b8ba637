//! Fully-connected layer. Always noise-exempt; its weight matrix can be
//! tagged for Parseval tightening.

use ndarray::{Array1, ArrayD, Ix1, Ix2, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::error::{PixelDpError, Result};
use crate::ops::flatten;
use crate::params::{ParamId, ParamKind, ParameterStore};

#[derive(Debug, Clone)]
pub struct BoundedDense {
    name: String,
    weights: ParamId,
    biases: ParamId,
    in_dim: usize,
}

impl BoundedDense {
    /// Weights are uniform-unit-scaling initialised (`±√(3 / in_dim)`),
    /// biases start at zero.
    pub fn build<R: Rng + ?Sized>(name: &str, in_dim: usize, out_dim: usize, parseval: bool, params: &mut ParameterStore, rng: &mut R) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(PixelDpError::config(format!("{name}: fully-connected dimensions must be positive")));
        }
        let limit = (3.0 / in_dim as f32).sqrt();
        let init = Uniform::new_inclusive(-limit, limit);
        let w = ArrayD::from_shape_simple_fn(IxDyn(&[in_dim, out_dim]), || init.sample(&mut *rng));
        let weights = params.insert(format!("{name}/DW"), ParamKind::DenseWeights, w);
        let biases = params.insert(format!("{name}/biases"), ParamKind::Bias, ArrayD::zeros(IxDyn(&[out_dim])));
        if parseval {
            params.track_for_tightening(weights)?;
            tracing::info!(layer=%name, "fully-connected weights tracked for tightening");
        }
        Ok(Self { name: name.to_string(), weights, biases, in_dim })
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn weights(&self) -> ParamId { self.weights }
    pub fn biases(&self) -> ParamId { self.biases }

    /// `x·W + b` on the input flattened to `[rows, in_dim]`.
    pub fn forward(&self, x: ArrayD<f32>, params: &ParameterStore) -> Result<ArrayD<f32>> {
        let x = flatten(x)?;
        if x.ncols() != self.in_dim {
            return Err(PixelDpError::shape(format!("{}: expected {} features, got {}", self.name, self.in_dim, x.ncols())));
        }
        let w = params.value(self.weights)?.view().into_dimensionality::<Ix2>()?;
        let b: Array1<f32> = params.value(self.biases)?.view().into_dimensionality::<Ix1>()?.to_owned();
        Ok((x.dot(&w) + &b).into_dyn())
    }
}
