//! Metric instruments for the privacy pipeline.
//!
//! Instruments come from the global meter; without an installed provider
//! they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub struct PrivacyMetrics {
    pub train_steps_total: Counter<u64>,
    pub tightening_passes_total: Counter<u64>,
    pub tightened_tensors_total: Counter<u64>,
    pub noise_injections_total: Counter<u64>,
    pub noise_scale: Histogram<f64>,
    pub pre_noise_sensitivity: Histogram<f64>,
}

static PIXELDP_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("pixeldp"));

pub static PRIVACY_METRICS: Lazy<PrivacyMetrics> = Lazy::new(|| {
    PrivacyMetrics {
        train_steps_total: PIXELDP_METER.u64_counter("pixeldp_train_steps_total").with_description("Completed train steps").build(),
        tightening_passes_total: PIXELDP_METER.u64_counter("pixeldp_tightening_passes_total").with_description("Parseval tightening passes run after an optimizer step").build(),
        tightened_tensors_total: PIXELDP_METER.u64_counter("pixeldp_tightened_tensors_total").with_description("Tensors retracted toward orthonormality").build(),
        noise_injections_total: PIXELDP_METER.u64_counter("pixeldp_noise_injections_total").with_description("Forward passes that injected noise").build(),
        noise_scale: PIXELDP_METER.f64_histogram("pixeldp_noise_scale").with_description("Noise scale (ramp x multiplier x sensitivity)").build(),
        pre_noise_sensitivity: PIXELDP_METER.f64_histogram("pixeldp_pre_noise_sensitivity").with_description("Effective sensitivity used at the noise layer").build(),
    }
});
