//! End-to-end training tests on a small synthetic operator.
//!
//! Targets are smooth functions of the branch input and the query
//! coordinate, so a few optimizer steps must reduce the loss for every
//! strategy.

use candle_core::{Device, Tensor};
use deeponet_rs::config::{OptimizerKind, Precision};
use deeponet_rs::optimizer::OptimizerConfig;
use deeponet_rs::{
    Activation, DecompositionHelper, DeepONet, DeepOnetBatch, DeepOnetConfig, Objective,
    OutputHandlingKind, PodBasisHelper, PodTraining, StandardTraining, Trainer,
    TrainingHistory, TrainingStrategyKind, TwoStepPhase, TwoStepTraining,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

const N_SAMPLES: usize = 8;
const N_POINTS: usize = 16;

fn batch() -> DeepOnetBatch {
    let device = Device::Cpu;
    let xb: Vec<f64> = (0..N_SAMPLES * 3)
        .map(|i| ((i * 5 % 7) as f64 - 3.0) / 3.0)
        .collect();
    let xt: Vec<f64> = (0..N_POINTS)
        .map(|i| i as f64 / (N_POINTS - 1) as f64)
        .collect();

    let mut real = Vec::with_capacity(N_SAMPLES * N_POINTS);
    let mut imag = Vec::with_capacity(N_SAMPLES * N_POINTS);
    for s in 0..N_SAMPLES {
        for &x in &xt {
            real.push(xb[s * 3] * x);
            imag.push(0.5 * xb[s * 3 + 1] - x);
        }
    }

    DeepOnetBatch::new(
        Some(Tensor::from_vec(xb, (N_SAMPLES, 3), &device).unwrap()),
        Some(Tensor::from_vec(xt, (N_POINTS, 1), &device).unwrap()),
    )
    .with_target(
        "g_u_real",
        Tensor::from_vec(real, (N_SAMPLES, N_POINTS), &device).unwrap(),
    )
    .with_target(
        "g_u_imag",
        Tensor::from_vec(imag, (N_SAMPLES, N_POINTS), &device).unwrap(),
    )
}

fn config(strategy: TrainingStrategyKind) -> DeepOnetConfig {
    DeepOnetConfig::default()
        .with_training_strategy(strategy)
        .with_output_handling(OutputHandlingKind::ShareTrunk)
        .with_basis_functions(4)
        .with_layers(vec![3, 16], vec![1, 16])
        .with_activation(Activation::Tanh)
        .with_precision(Precision::Float64)
        .with_seed(11)
}

fn objective(config: &DeepOnetConfig) -> Objective {
    Objective::new(
        config.loss_function,
        config.output_keys.clone(),
        config.error_norm,
    )
}

#[test]
fn test_sgd_steps_reduce_loss() {
    let config = config(TrainingStrategyKind::Standard).with_optimizer(OptimizerKind::Sgd, 5e-3);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let model = DeepONet::new(
        &config,
        StandardTraining::new(objective(&config)).into(),
        &Device::Cpu,
        &mut rng,
    )
    .unwrap();
    let batch = batch();

    let mut optimizer = OptimizerConfig::from_config(&config)
        .build(model.trainable_vars())
        .unwrap();
    let mut losses = Vec::new();
    for _ in 0..20 {
        let loss = model.compute_loss(&batch).unwrap();
        losses.push(loss.to_scalar::<f64>().unwrap());
        optimizer.step(&loss).unwrap();
    }

    for pair in losses.windows(2) {
        assert!(pair[1] < pair[0], "loss did not decrease: {losses:?}");
    }
}

#[test]
fn test_trainer_standard_run_and_history() {
    let mut config = config(TrainingStrategyKind::Standard);
    config.epochs = 30;
    config.log_every = 10;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut model = DeepONet::new(
        &config,
        StandardTraining::new(objective(&config)).into(),
        &Device::Cpu,
        &mut rng,
    )
    .unwrap();
    let batch = batch();

    let mut trainer = Trainer::new(config).unwrap();
    let history = trainer
        .fit(&mut model, &batch, Some(&batch), &mut rng)
        .unwrap()
        .clone();

    let losses = history.losses();
    assert_eq!(losses.len(), 30);
    assert!(losses[29] < losses[0]);
    assert_eq!(history.strategy, "standard");
    assert!(history.final_errors.contains_key("g_u_real"));
    assert!(history.final_val_errors.is_some());
    // Validation runs on log epochs only: 0, 10, 20 and the last.
    assert_eq!(
        history.epochs.iter().filter(|m| m.val_loss.is_some()).count(),
        4
    );

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.json");
    history.save_json(&path).unwrap();
    let loaded = TrainingHistory::load_json(&path).unwrap();
    assert_eq!(loaded.losses(), losses);
}

#[test]
fn test_trainer_two_step_runs_all_phases() {
    let config = config(TrainingStrategyKind::TwoStep).with_epochs(1, 15, 10);
    let strategy = TwoStepTraining::new(
        objective(&config),
        DecompositionHelper::new(config.decomposition),
        N_SAMPLES,
        TwoStepPhase::Trunk,
    );
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut model = DeepONet::new(&config, strategy.into(), &Device::Cpu, &mut rng).unwrap();
    let batch = batch();

    let mut trainer = Trainer::new(config).unwrap();
    let history = trainer.fit(&mut model, &batch, None, &mut rng).unwrap();

    assert_eq!(history.phase("trunk").count(), 15);
    assert_eq!(history.phase("branch").count(), 10);
    let trunk: Vec<f64> = history.phase("trunk").map(|m| m.loss).collect();
    assert!(trunk[14] < trunk[0]);
    assert_eq!(history.final_errors.len(), 2);

    assert_eq!(model.phase(), Some(TwoStepPhase::Both));
    assert_eq!(model.parts().trunk.kind_name(), "fixed");
    assert!(model.trainable_vars().is_empty());
}

#[test]
fn test_trainer_pod_run() {
    let mut config = config(TrainingStrategyKind::Pod);
    config.epochs = 20;
    let batch = batch();
    let data = [
        batch.target("g_u_real").unwrap().clone(),
        batch.target("g_u_imag").unwrap().clone(),
    ];
    let strategy = PodTraining::new(
        objective(&config),
        &PodBasisHelper::new(config.var_share).unwrap(),
        &data,
        config.output_handling.basis_config(),
    )
    .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut model = DeepONet::new(&config, strategy.into(), &Device::Cpu, &mut rng).unwrap();
    let mut trainer = Trainer::new(config).unwrap();
    let history = trainer.fit(&mut model, &batch, None, &mut rng).unwrap();

    let losses = history.losses();
    assert_eq!(losses.len(), 20);
    assert!(losses[19] < losses[0]);
    assert!(history.epochs.iter().all(|m| m.phase == "pod"));
}
