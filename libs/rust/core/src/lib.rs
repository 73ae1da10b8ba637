//! Differential-privacy core for convolutional networks (PixelDP).
//!
//! A model is built once from `Hyperparameters` and an `Architecture`. Every
//! layer up to the noise ordinal is sensitivity-tracked, noise calibrated to
//! `(ε, δ)` and the attack bound is injected right after that layer, and the
//! `TrainingOrchestrator` keeps orthonormal-bound kernels close to Parseval
//! after every optimizer step.

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub mod config;
pub mod error;
pub mod layers;
pub mod linalg;
pub mod metrics;
pub mod model;
pub mod noise;
pub mod ops;
pub mod params;
pub mod parseval;
pub mod sensitivity;
pub mod training;

pub use config::{ControlScheme, Hyperparameters, LayerBound, OptimizerKind, SensitivityNorm};
pub use error::{PixelDpError, Result};
pub use layers::{Layer as NetworkLayer, LayerRole, LayerSensitivity};
pub use model::{Architecture, ForwardOutput, LayerSpec, Model, ModelBuilder};
pub use noise::{privacy_multiplier, NoiseInjector, NoiseOutcome, NoisyActivation};
pub use params::{Gradients, ParamId, ParamKind, ParameterStore};
pub use parseval::{ParsevalTightener, PARSEVAL_BETA};
pub use sensitivity::{SensitivityFactor, SensitivityTracker};
pub use training::{weight_decay, CostEvaluation, CostGradient, FiniteDifference, Optimizer, StepReport, TrainingOrchestrator, MOMENTUM};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once per process. `RUST_LOG` drives the
/// filter (default `info`); `PIXELDP_JSON_LOG=1` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let json = std::env::var("PIXELDP_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .try_init()
            .map_err(|e| PixelDpError::Telemetry(e.to_string()))
    })?;
    info!(service, "tracing initialized");
    Ok(())
}
