use std::path::PathBuf;

use anyhow::{Context, Result};
use ndarray::{ArrayD, Ix2, IxDyn};
use pixeldp_core::{
    init_tracing, weight_decay, Architecture, FiniteDifference, Hyperparameters, LayerSpec, Model, ModelBuilder, TrainingOrchestrator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const DEFAULT_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/trainer.yaml");
const FD_STEP: f32 = 1e-3;

fn main() -> Result<()> {
    init_tracing("pixeldp-trainer")?;
    let config = std::env::var_os("PIXELDP_CONFIG_FILE").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let hps = Hyperparameters::load(Some(&config)).context("loading hyperparameters")?;
    let arch = match std::env::var("PIXELDP_ARCHITECTURE_FILE") {
        Ok(path) => Architecture::from_yaml(&std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?)?,
        Err(_) => default_architecture(&hps),
    };
    let seed: u64 = std::env::var("PIXELDP_SEED").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let steps: u64 = std::env::var("PIXELDP_TRAIN_STEPS").ok().and_then(|v| v.parse().ok()).unwrap_or(20);
    let warmup = (steps / 2).max(1);
    info!(target: "pixeldp-trainer", config=%config.display(), seed, steps, "starting trainer");

    let mut rng = StdRng::seed_from_u64(seed);
    let mut model = ModelBuilder::new(hps.clone()).build(&arch, &mut rng)?;
    let mut orchestrator = TrainingOrchestrator::new(&hps);

    for _ in 0..steps {
        let (images, labels) = synthetic_batch(&hps, &mut rng);
        // noise reaches full strength after the warm-up
        let ramp = ((orchestrator.global_step() + 1) as f32 / warmup as f32).min(1.0);
        let noise_seed: u64 = rng.gen();
        let rate = hps.weight_decay_rate;
        let cost = |m: &Model| -> pixeldp_core::Result<f64> {
            // same noise draw for every perturbed evaluation of this step
            let mut noise_rng = StdRng::seed_from_u64(noise_seed);
            let out = m.forward(&images, ramp, &mut noise_rng)?;
            Ok(cross_entropy(&out.logits, &labels)? + weight_decay(m.params(), rate))
        };
        let mut source = FiniteDifference::new(cost, FD_STEP)?;
        let report = orchestrator.train_step(&mut model, &mut source)?;
        info!(
            target: "pixeldp-trainer",
            step = report.step,
            cost = report.cost,
            ramp,
            tightened = report.tightened,
            sensitivity = report.pre_noise_sensitivity,
            "step complete"
        );
    }

    info!(
        target: "pixeldp-trainer",
        epsilon = hps.dp_epsilon,
        delta = hps.dp_delta,
        attack_norm_bound = hps.attack_norm_bound,
        attack_norm = %model.attack_norm(),
        multiplier = model.noise_injector().multiplier(),
        sensitivity = model.pre_noise_sensitivity()?,
        "training finished"
    );
    Ok(())
}

fn default_architecture(hps: &Hyperparameters) -> Architecture {
    Architecture::new(vec![
        LayerSpec::Conv { name: "init_conv".into(), filter_size: 3, in_filters: hps.image_channels, out_filters: 4, stride: 1 },
        LayerSpec::Relu { leakiness: 0.0 },
        LayerSpec::Conv { name: "unit_1".into(), filter_size: 3, in_filters: 4, out_filters: 4, stride: 2 },
        LayerSpec::Relu { leakiness: 0.0 },
        LayerSpec::FullyConnected { name: "logit".into(), out_dim: hps.num_classes, parseval: false },
    ])
}

/// Images whose class shows up as a bright horizontal band; each image is
/// repeated `n_draws` times, matching the layout of a noisy batch.
fn synthetic_batch(hps: &Hyperparameters, rng: &mut StdRng) -> (ArrayD<f32>, Vec<usize>) {
    let classes: Vec<usize> = (0..hps.batch_size).map(|_| rng.gen_range(0..hps.num_classes)).collect();
    let rows = hps.batch_size * hps.n_draws;
    let size = hps.image_size;
    let shape = IxDyn(&[rows, size, size, hps.image_channels]);
    let images = ArrayD::from_shape_fn(shape, |ix| {
        let label = classes[ix[0] / hps.n_draws];
        let band = ix[1] * hps.num_classes / size;
        if band == label { 1.0 } else { 0.0 }
    });
    let images = images.mapv(|v| v + 0.1 * rng.gen::<f32>());
    let labels = (0..rows).map(|r| classes[r / hps.n_draws]).collect();
    (images, labels)
}

fn cross_entropy(logits: &ArrayD<f32>, labels: &[usize]) -> pixeldp_core::Result<f64> {
    let logits = logits.view().into_dimensionality::<Ix2>()?;
    let mut total = 0.0;
    for (row, &label) in logits.outer_iter().zip(labels) {
        let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)) as f64;
        let lse = max + row.iter().map(|&v| (v as f64 - max).exp()).sum::<f64>().ln();
        total += lse - row[label] as f64;
    }
    Ok(total / labels.len().max(1) as f64)
}
