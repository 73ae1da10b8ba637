//! One ordered train step: gradients, optimizer apply, then tightening.
//!
//! The step holds the only `&mut` borrow of the parameter store for its whole
//! duration, so the tightening pass always sees the freshly updated weights.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use tracing::{debug, warn};

use crate::config::{Hyperparameters, OptimizerKind};
use crate::error::{PixelDpError, Result};
use crate::metrics::PRIVACY_METRICS;
use crate::model::Model;
use crate::params::{Gradients, ParamId, ParamKind, ParameterStore};
use crate::parseval::ParsevalTightener;

pub const MOMENTUM: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct CostEvaluation {
    pub cost: f64,
    pub gradients: Gradients,
}

/// Differentiation collaborator: the cost of the current model and its
/// gradient w.r.t. every trainable parameter. Regularisation terms such as
/// [`weight_decay`] are expected to be folded in by the implementor.
pub trait CostGradient {
    fn evaluate(&mut self, model: &Model) -> Result<CostEvaluation>;
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    lrn_rate: f32,
    accumulators: BTreeMap<ParamId, ArrayD<f32>>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, lrn_rate: f32) -> Self {
        Self { kind, lrn_rate, accumulators: BTreeMap::new() }
    }

    pub fn accumulator(&self, id: ParamId) -> Option<&ArrayD<f32>> { self.accumulators.get(&id) }

    /// Momentum follows the accumulator form `a ← 0.9·a + g; w ← w − lr·a`.
    /// Every gradient is shape-checked before any parameter is touched.
    pub fn apply(&mut self, params: &mut ParameterStore, gradients: &Gradients) -> Result<()> {
        for (id, g) in gradients {
            let p = params.get(*id)?;
            if p.value.shape() != g.shape() {
                return Err(PixelDpError::shape(format!("gradient for '{}' has shape {:?}, parameter is {:?}", p.name, g.shape(), p.value.shape())));
            }
        }
        for (id, g) in gradients {
            match self.kind {
                OptimizerKind::GradientDescent => params.value_mut(*id)?.scaled_add(-self.lrn_rate, g),
                OptimizerKind::Momentum => {
                    let acc = self.accumulators.entry(*id).or_insert_with(|| ArrayD::zeros(g.raw_dim()));
                    acc.mapv_inplace(|a| MOMENTUM * a);
                    *acc += g;
                    params.value_mut(*id)?.scaled_add(-self.lrn_rate, &*acc);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub cost: f64,
    /// Tensors retracted by the tightening pass (0 when none are tracked).
    pub tightened: usize,
    /// Tracker product evaluated on the post-step weights.
    pub pre_noise_sensitivity: f64,
}

#[derive(Debug, Clone)]
pub struct TrainingOrchestrator {
    optimizer: Optimizer,
    tightener: ParsevalTightener,
    global_step: u64,
}

impl TrainingOrchestrator {
    pub fn new(hps: &Hyperparameters) -> Self {
        Self {
            optimizer: Optimizer::new(hps.optimizer, hps.lrn_rate),
            tightener: ParsevalTightener::default(),
            global_step: 0,
        }
    }

    pub fn global_step(&self) -> u64 { self.global_step }

    pub fn train_step(&mut self, model: &mut Model, source: &mut dyn CostGradient) -> Result<StepReport> {
        let CostEvaluation { cost, gradients } = source.evaluate(model)?;
        if !cost.is_finite() {
            warn!(step = self.global_step + 1, cost, "non-finite cost");
        }
        self.optimizer.apply(model.params_mut(), &gradients)?;
        let tightened = if model.tracked_tensors().is_empty() { 0 } else { self.tightener.tighten(model.params_mut())? };
        self.global_step += 1;

        let pre_noise_sensitivity = model.pre_noise_sensitivity()?;
        PRIVACY_METRICS.train_steps_total.add(1, &[]);
        debug!(step = self.global_step, cost, tightened, pre_noise_sensitivity, "train step");
        Ok(StepReport { step: self.global_step, cost, tightened, pre_noise_sensitivity })
    }
}

/// `rate × Σ‖k‖²` over every convolution kernel.
pub fn weight_decay(params: &ParameterStore, rate: f32) -> f64 {
    let sum: f64 = params
        .iter()
        .filter(|(_, p)| p.kind == ParamKind::ConvKernel)
        .map(|(_, p)| p.value.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>())
        .sum();
    f64::from(rate) * sum
}

/// Central-difference gradients of a cost closure over every parameter.
/// Costs `2·n + 1` closure calls for `n` scalars; only meant for small
/// networks and for checking other gradient sources.
pub struct FiniteDifference<F> {
    cost: F,
    step: f32,
}

impl<F> FiniteDifference<F>
where
    F: FnMut(&Model) -> Result<f64>,
{
    pub fn new(cost: F, step: f32) -> Result<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(PixelDpError::InvalidParameter { name: "finite_difference_step", value: f64::from(step) });
        }
        Ok(Self { cost, step })
    }
}

impl<F> CostGradient for FiniteDifference<F>
where
    F: FnMut(&Model) -> Result<f64>,
{
    fn evaluate(&mut self, model: &Model) -> Result<CostEvaluation> {
        let cost = (self.cost)(model)?;
        let mut perturbed = model.clone();
        let mut gradients = Gradients::new();
        let ids: Vec<ParamId> = model.params().ids().collect();
        for id in ids {
            let len = model.params().value(id)?.len();
            let mut grad = Vec::with_capacity(len);
            for k in 0..len {
                let original = element(&mut perturbed, id, k)?;
                *element_mut(&mut perturbed, id, k)? = original + self.step;
                let up = (self.cost)(&perturbed)?;
                *element_mut(&mut perturbed, id, k)? = original - self.step;
                let down = (self.cost)(&perturbed)?;
                *element_mut(&mut perturbed, id, k)? = original;
                grad.push(((up - down) / (2.0 * f64::from(self.step))) as f32);
            }
            gradients.insert(id, ArrayD::from_shape_vec(model.params().value(id)?.raw_dim(), grad)?);
        }
        Ok(CostEvaluation { cost, gradients })
    }
}

fn element(model: &mut Model, id: ParamId, k: usize) -> Result<f32> { element_mut(model, id, k).map(|v| *v) }

fn element_mut(model: &mut Model, id: ParamId, k: usize) -> Result<&mut f32> {
    model
        .params_mut()
        .value_mut(id)?
        .as_slice_mut()
        .and_then(|s| s.get_mut(k))
        .ok_or_else(|| PixelDpError::shape(format!("parameter {} has no contiguous element {k}", id.index())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerBound, SensitivityNorm};
    use crate::model::{Architecture, LayerSpec, ModelBuilder};
    use crate::ops::{from_kernel_matrix, kernel_matrix};
    use crate::parseval::{retract, PARSEVAL_BETA};
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixed(Gradients);

    impl CostGradient for Fixed {
        fn evaluate(&mut self, _model: &Model) -> Result<CostEvaluation> { Ok(CostEvaluation { cost: 1.5, gradients: self.0.clone() }) }
    }

    fn scalar_store(v: f32) -> (ParameterStore, ParamId) {
        let mut params = ParameterStore::new();
        let id = params.insert("w", ParamKind::DenseWeights, ArrayD::from_elem(IxDyn(&[1]), v));
        (params, id)
    }

    fn tiny_model(bound: LayerBound, optimizer: OptimizerKind) -> Model {
        let hps = Hyperparameters {
            batch_size: 1,
            image_size: 2,
            image_channels: 1,
            num_classes: 2,
            optimizer,
            lrn_rate: 0.1,
            attack_norm_bound: 1.0,
            layer_sensitivity_bounds: vec![bound],
            ..Hyperparameters::default()
        };
        let arch = Architecture::new(vec![
            LayerSpec::Conv { name: "conv".into(), filter_size: 1, in_filters: 1, out_filters: 2, stride: 1 },
            LayerSpec::FullyConnected { name: "logit".into(), out_dim: 2, parseval: false },
        ]);
        ModelBuilder::new(hps).build(&arch, &mut StdRng::seed_from_u64(17)).unwrap()
    }

    #[test]
    fn momentum_accumulates() {
        let (mut params, id) = scalar_store(1.0);
        let grads: Gradients = [(id, ArrayD::from_elem(IxDyn(&[1]), 1.0f32))].into_iter().collect();
        let mut opt = Optimizer::new(OptimizerKind::Momentum, 0.1);
        opt.apply(&mut params, &grads).unwrap();
        assert!((params.value(id).unwrap()[[0]] - 0.9).abs() < 1e-6);
        opt.apply(&mut params, &grads).unwrap();
        // a = 0.9·1 + 1 = 1.9
        assert!((opt.accumulator(id).unwrap()[[0]] - 1.9).abs() < 1e-6);
        assert!((params.value(id).unwrap()[[0]] - 0.71).abs() < 1e-6);
    }

    #[test]
    fn gradient_descent_steps_against_gradient() {
        let (mut params, id) = scalar_store(1.0);
        let grads: Gradients = [(id, ArrayD::from_elem(IxDyn(&[1]), 2.0f32))].into_iter().collect();
        let mut opt = Optimizer::new(OptimizerKind::GradientDescent, 0.25);
        opt.apply(&mut params, &grads).unwrap();
        assert!((params.value(id).unwrap()[[0]] - 0.5).abs() < 1e-6);
        assert!(opt.accumulator(id).is_none());
    }

    #[test]
    fn mismatched_gradient_leaves_parameters_untouched() {
        let mut params = ParameterStore::new();
        let a = params.insert("a", ParamKind::Bias, ArrayD::ones(IxDyn(&[2])));
        let b = params.insert("b", ParamKind::Bias, ArrayD::ones(IxDyn(&[2])));
        let grads: Gradients = [(a, ArrayD::ones(IxDyn(&[2]))), (b, ArrayD::ones(IxDyn(&[3])))].into_iter().collect();
        let mut opt = Optimizer::new(OptimizerKind::GradientDescent, 0.1);
        assert!(opt.apply(&mut params, &grads).is_err());
        assert_eq!(params.value(a).unwrap(), &ArrayD::<f32>::ones(IxDyn(&[2])));
    }

    #[test]
    fn step_applies_update_then_tightens() {
        let mut model = tiny_model(LayerBound::Orthonormal, OptimizerKind::GradientDescent);
        let kernel = model.tracked_tensors()[0];
        let before = model.params().value(kernel).unwrap().clone();
        let grad = ArrayD::from_elem(before.raw_dim(), 0.5f32);
        let mut source = Fixed([(kernel, grad.clone())].into_iter().collect());

        let mut orchestrator = TrainingOrchestrator::new(model.hyperparameters());
        let report = orchestrator.train_step(&mut model, &mut source).unwrap();

        let mut stepped = before.clone();
        stepped.scaled_add(-0.1, &grad);
        let expected = from_kernel_matrix(retract(kernel_matrix(&stepped).unwrap().view(), PARSEVAL_BETA).view(), before.shape()).unwrap();
        let after = model.params().value(kernel).unwrap();
        for (a, e) in after.iter().zip(expected.iter()) { assert!((a - e).abs() < 1e-6); }
        assert_eq!(report.step, 1);
        assert_eq!(report.tightened, 1);
        assert_eq!(report.cost, 1.5);
        assert_eq!(orchestrator.global_step(), 1);
        assert!((report.pre_noise_sensitivity - model.pre_noise_sensitivity().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn diverged_update_fails_the_step() {
        let mut model = tiny_model(LayerBound::Orthonormal, OptimizerKind::GradientDescent);
        let kernel = model.tracked_tensors()[0];
        let grad = ArrayD::from_elem(model.params().value(kernel).unwrap().raw_dim(), f32::INFINITY);
        let mut orchestrator = TrainingOrchestrator::new(model.hyperparameters());
        let err = orchestrator.train_step(&mut model, &mut Fixed([(kernel, grad)].into_iter().collect())).unwrap_err();
        assert!(matches!(err, PixelDpError::NonFinite { .. }), "{err}");
    }

    #[test]
    fn no_tracked_tensors_skips_tightening() {
        let mut model = tiny_model(LayerBound::L2Channel, OptimizerKind::Momentum);
        assert_eq!(model.noise_injector().norm(), SensitivityNorm::L2);
        assert!(model.tracked_tensors().is_empty());
        let mut orchestrator = TrainingOrchestrator::new(model.hyperparameters());
        let report = orchestrator.train_step(&mut model, &mut Fixed(Gradients::new())).unwrap();
        assert_eq!(report.tightened, 0);
        assert_eq!(report.pre_noise_sensitivity, 1.0);
    }

    #[test]
    fn weight_decay_sums_kernel_squares_only() {
        let mut params = ParameterStore::new();
        params.insert("conv/DW", ParamKind::ConvKernel, ArrayD::from_shape_vec(IxDyn(&[1, 1, 1, 2]), vec![1.0, 2.0]).unwrap());
        params.insert("fc/DW", ParamKind::DenseWeights, ArrayD::from_elem(IxDyn(&[1, 1]), 3.0));
        assert!((weight_decay(&params, 0.5) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn finite_difference_matches_analytic_gradient() {
        let model = tiny_model(LayerBound::Orthonormal, OptimizerKind::GradientDescent);
        let sum_squares = |m: &Model| -> Result<f64> {
            Ok(m.params().iter().flat_map(|(_, p)| p.value.iter().map(|&v| f64::from(v) * f64::from(v))).sum())
        };
        let mut fd = FiniteDifference::new(sum_squares, 1e-2).unwrap();
        let eval = fd.evaluate(&model).unwrap();
        for (id, p) in model.params().iter() {
            for (g, w) in eval.gradients[&id].iter().zip(p.value.iter()) {
                assert!((g - 2.0 * w).abs() < 1e-3, "{g} vs {}", 2.0 * w);
            }
        }
        assert!(FiniteDifference::new(sum_squares, 0.0).is_err());
    }
}
