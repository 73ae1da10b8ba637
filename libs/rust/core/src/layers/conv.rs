//! Convolution with a per-layer sensitivity bound.
//!
//! Tracked layers register one factor with the sensitivity tracker:
//!
//! | bound   | control    | applied kernel             | factor                      |
//! |---------|------------|----------------------------|-----------------------------|
//! | `l2_l2` | `bound`    | raw / ceil(filter/stride)  | spectral norm of raw kernel |
//! | `l2_l2` | `optimize` | rejected                   |                             |
//! | `l1_l2` | `bound`    | unit L2 norm per channel   | 1                           |
//! | `l1_l2` | `optimize` | raw                        | max channel L2 norm         |
//! | `l1_l1` | `bound`    | unit L1 norm per channel   | 1                           |
//! | `l1_l1` | `optimize` | raw                        | max channel L1 norm         |

use ndarray::{ArrayD, Ix4, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::{info, warn};

use super::{LayerRole, LayerSensitivity};
use crate::config::{ControlScheme, LayerBound, SensitivityNorm};
use crate::error::{PixelDpError, Result};
use crate::ops::{conv2d_same, normalize_channels};
use crate::params::{ParamId, ParamKind, ParameterStore};
use crate::sensitivity::{SensitivityFactor, SensitivityTracker};

/// How the stored kernel is turned into the kernel that is convolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppliedKernel {
    Raw,
    /// Divided by `ceil(filter / stride)`, the number of output positions a
    /// single input pixel can reach along one axis.
    Rescaled(f32),
    /// Unit norm per output channel.
    Normalized(SensitivityNorm),
}

#[derive(Debug, Clone)]
pub struct BoundedConv {
    name: String,
    kernel: ParamId,
    stride: usize,
    role: LayerRole,
    applied: AppliedKernel,
}

impl BoundedConv {
    #[allow(clippy::too_many_arguments)]
    pub fn build<R: Rng + ?Sized>(
        name: &str,
        filter_size: usize,
        in_filters: usize,
        out_filters: usize,
        stride: usize,
        role: LayerRole,
        params: &mut ParameterStore,
        tracker: &mut SensitivityTracker,
        rng: &mut R,
    ) -> Result<Self> {
        if filter_size == 0 || in_filters == 0 || out_filters == 0 || stride == 0 {
            return Err(PixelDpError::config(format!("{name}: filter size, channel counts and stride must be positive")));
        }
        if let LayerRole::Tracked(Some(LayerSensitivity { bound: LayerBound::Orthonormal, control: ControlScheme::Optimize })) = role {
            return Err(PixelDpError::config(format!("{name}: cannot optimize sensitivity under the orthonormal-bound scheme")));
        }
        if let LayerRole::Tracked(None) = role {
            return Err(PixelDpError::config(format!("{name}: unsupported sensitivity configuration for a tracked layer")));
        }

        let n = (filter_size * filter_size * out_filters) as f32;
        let init = Normal::new(0.0f32, (2.0 / n).sqrt()).map_err(|e| PixelDpError::config(format!("{name}: kernel init: {e}")))?;
        let shape = [filter_size, filter_size, in_filters, out_filters];
        let value = ArrayD::from_shape_simple_fn(IxDyn(&shape), || init.sample(&mut *rng));
        let kernel = params.insert(format!("{name}/DW"), ParamKind::ConvKernel, value);

        let applied = match role {
            LayerRole::NoiseExempt | LayerRole::Tracked(None) => AppliedKernel::Raw,
            LayerRole::Tracked(Some(LayerSensitivity { bound: LayerBound::Orthonormal, .. })) => {
                tracker.register(SensitivityFactor::SpectralNorm(kernel));
                params.track_for_tightening(kernel)?;
                let rescale = ((filter_size + stride - 1) / stride) as f32;
                info!(layer=%name, rescale, "orthonormal-bound convolution; kernel tracked for tightening");
                AppliedKernel::Rescaled(rescale)
            }
            LayerRole::Tracked(Some(LayerSensitivity { bound, control: ControlScheme::Bound })) => {
                tracker.register(SensitivityFactor::Unit);
                info!(layer=%name, %bound, "channel-normalized convolution; sensitivity fixed at 1");
                AppliedKernel::Normalized(bound.output_norm())
            }
            LayerRole::Tracked(Some(LayerSensitivity { bound, control: ControlScheme::Optimize })) => {
                tracker.register(SensitivityFactor::MaxChannelNorm { param: kernel, norm: bound.output_norm() });
                warn!(layer=%name, %bound, "sensitivity is measured, not enforced, and may grow during training");
                AppliedKernel::Raw
            }
        };
        Ok(Self { name: name.to_string(), kernel, stride, role, applied })
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn kernel(&self) -> ParamId { self.kernel }
    pub fn role(&self) -> LayerRole { self.role }
    pub fn applied(&self) -> AppliedKernel { self.applied }

    /// The kernel actually convolved, derived from the current stored value.
    pub fn effective_kernel(&self, params: &ParameterStore) -> Result<ArrayD<f32>> {
        let raw = params.value(self.kernel)?;
        match self.applied {
            AppliedKernel::Raw => Ok(raw.clone()),
            AppliedKernel::Rescaled(r) => Ok(raw / r),
            AppliedKernel::Normalized(norm) => normalize_channels(raw, norm),
        }
    }

    pub fn forward(&self, x: ArrayD<f32>, params: &ParameterStore) -> Result<ArrayD<f32>> {
        let x = x.into_dimensionality::<Ix4>()?;
        let k = self.effective_kernel(params)?.into_dimensionality::<Ix4>()?;
        Ok(conv2d_same(x.view(), k.view(), self.stride)?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{channel_norms, kernel_matrix, max_channel_norm};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tracked(bound: LayerBound, control: ControlScheme) -> LayerRole {
        LayerRole::Tracked(Some(LayerSensitivity { bound, control }))
    }

    fn build(role: LayerRole, filter: usize, in_f: usize, out_f: usize, stride: usize) -> Result<(BoundedConv, ParameterStore, SensitivityTracker)> {
        let mut params = ParameterStore::new();
        let mut tracker = SensitivityTracker::new();
        let mut rng = StdRng::seed_from_u64(42);
        let conv = BoundedConv::build("conv", filter, in_f, out_f, stride, role, &mut params, &mut tracker, &mut rng)?;
        Ok((conv, params, tracker))
    }

    /// Kernel whose `[out, f·f·in]` reshape has signed standard-basis rows.
    fn signed_permutation_kernel(filter: usize, in_f: usize, out_f: usize) -> ArrayD<f32> {
        let cols = filter * filter * in_f;
        let mut m = ndarray::Array2::<f32>::zeros((out_f, cols));
        for o in 0..out_f { m[[o, (o * 7) % cols]] = if o % 2 == 0 { 1.0 } else { -1.0 }; }
        crate::ops::from_kernel_matrix(m.view(), &[filter, filter, in_f, out_f]).unwrap()
    }

    #[test]
    fn exempt_layer_registers_nothing() {
        let (conv, params, tracker) = build(LayerRole::NoiseExempt, 3, 2, 4, 1).unwrap();
        assert_eq!(tracker.factors().len(), 1);
        assert!(params.tracked_for_tightening().is_empty());
        assert_eq!(conv.applied(), AppliedKernel::Raw);
    }

    #[test]
    fn orthonormal_optimize_is_rejected() {
        for (filter, stride) in [(1, 1), (3, 1), (3, 2), (5, 3)] {
            let err = build(tracked(LayerBound::Orthonormal, ControlScheme::Optimize), filter, 3, 8, stride).unwrap_err();
            assert!(err.to_string().contains("cannot optimize sensitivity under the orthonormal-bound scheme"), "{err}");
        }
    }

    #[test]
    fn tracked_layer_without_bound_is_rejected() {
        let err = build(LayerRole::Tracked(None), 3, 3, 8, 1).unwrap_err();
        assert!(err.to_string().contains("unsupported sensitivity configuration for a tracked layer"));
    }

    #[test]
    fn orthonormal_bound_rescales_and_tracks() {
        let (conv, mut params, tracker) = build(tracked(LayerBound::Orthonormal, ControlScheme::Bound), 3, 2, 4, 2).unwrap();
        assert_eq!(conv.applied(), AppliedKernel::Rescaled(2.0));
        assert_eq!(params.tracked_for_tightening(), vec![conv.kernel()]);
        assert_eq!(tracker.factors(), &[SensitivityFactor::Unit, SensitivityFactor::SpectralNorm(conv.kernel())]);

        params.assign(conv.kernel(), signed_permutation_kernel(3, 2, 4)).unwrap();
        assert_eq!(tracker.product(&params).unwrap(), 1.0);
        let applied = conv.effective_kernel(&params).unwrap();
        assert_eq!(applied, params.value(conv.kernel()).unwrap() / 2.0);
    }

    #[test]
    fn orthonormal_kernel_has_unit_sensitivity_for_every_shape() {
        for (filter, in_f, out_f, stride) in [(1, 1, 1, 1), (1, 4, 4, 1), (2, 3, 5, 1), (3, 1, 9, 2), (3, 3, 16, 1), (5, 2, 10, 4)] {
            let (conv, mut params, tracker) = build(tracked(LayerBound::Orthonormal, ControlScheme::Bound), filter, in_f, out_f, stride).unwrap();
            params.assign(conv.kernel(), signed_permutation_kernel(filter, in_f, out_f)).unwrap();
            assert_eq!(tracker.product(&params).unwrap(), 1.0, "filter {filter} in {in_f} out {out_f}");
        }
    }

    #[test]
    fn l2_bound_normalizes_every_channel() {
        let (conv, params, tracker) = build(tracked(LayerBound::L2Channel, ControlScheme::Bound), 3, 3, 8, 1).unwrap();
        assert_eq!(tracker.factors(), &[SensitivityFactor::Unit, SensitivityFactor::Unit]);
        let k = conv.effective_kernel(&params).unwrap();
        for n in channel_norms(&k, SensitivityNorm::L2).unwrap() { assert!((n - 1.0).abs() < 1e-5); }
        assert!(params.tracked_for_tightening().is_empty());
    }

    #[test]
    fn l1_bound_normalizes_every_channel() {
        let (conv, params, _) = build(tracked(LayerBound::L1Channel, ControlScheme::Bound), 2, 4, 6, 2).unwrap();
        let k = conv.effective_kernel(&params).unwrap();
        for n in channel_norms(&k, SensitivityNorm::L1).unwrap() { assert!((n - 1.0).abs() < 1e-5); }
    }

    #[test]
    fn optimize_mode_measures_raw_kernel() {
        let (conv, params, tracker) = build(tracked(LayerBound::L2Channel, ControlScheme::Optimize), 3, 3, 8, 1).unwrap();
        assert_eq!(conv.applied(), AppliedKernel::Raw);
        let raw = params.value(conv.kernel()).unwrap();
        let measured = max_channel_norm(raw, SensitivityNorm::L2).unwrap() as f64;
        assert_eq!(tracker.product(&params).unwrap(), measured);
        assert_eq!(&conv.effective_kernel(&params).unwrap(), raw);
    }

    #[test]
    fn kernel_init_scale_follows_fan_out() {
        let (conv, params, _) = build(LayerRole::NoiseExempt, 3, 16, 32, 1).unwrap();
        let k = params.value(conv.kernel()).unwrap();
        let n = k.len() as f32;
        let var = k.iter().map(|v| v * v).sum::<f32>() / n;
        let expected = 2.0 / (3.0 * 3.0 * 32.0);
        assert!((var / expected - 1.0).abs() < 0.1, "{var} vs {expected}");
        assert_eq!(kernel_matrix(k).unwrap().dim(), (32, 144));
    }

    #[test]
    fn forward_runs_same_padding() {
        let (conv, params, _) = build(LayerRole::NoiseExempt, 3, 2, 5, 2).unwrap();
        let x = ArrayD::ones(IxDyn(&[4, 7, 7, 2]));
        let y = conv.forward(x, &params).unwrap();
        assert_eq!(y.shape(), &[4, 4, 4, 5]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn bound_mode_leaves_every_output_channel_at_unit_norm(
            filter in 1usize..4,
            in_f in 1usize..4,
            out_f in 1usize..6,
            stride in 1usize..3,
            l1 in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let bound = if l1 { LayerBound::L1Channel } else { LayerBound::L2Channel };
            let (conv, mut params, _) = build(tracked(bound, ControlScheme::Bound), filter, in_f, out_f, stride).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let kernel = ArrayD::from_shape_fn(IxDyn(&[filter, filter, in_f, out_f]), |_| {
                let magnitude = rng.gen_range(0.01f32..10.0);
                if rng.gen::<bool>() { magnitude } else { -magnitude }
            });
            params.assign(conv.kernel(), kernel).unwrap();
            let applied = conv.effective_kernel(&params).unwrap();
            for n in channel_norms(&applied, bound.output_norm()).unwrap() {
                prop_assert!((n - 1.0).abs() < 1e-5, "channel norm {}", n);
            }
        }
    }
}
