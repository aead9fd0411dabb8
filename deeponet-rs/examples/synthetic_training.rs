//! Train a DeepONet on a synthetic two-channel operator.
//!
//! The branch input holds three coefficients `(a, b, c)`; the operator maps
//! them to `a·sin(πx) + b·x` (real part) and `c·cos(πx)` (imaginary part) on
//! a uniform grid.
//!
//! ```bash
//! RUST_LOG=info cargo run --example synthetic_training -- --strategy two-step
//! RUST_LOG=debug cargo run --example synthetic_training -- \
//!     --config deeponet-rs/examples/configs/pod.yaml --strategy pod
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use deeponet_rs::config::OptimizerKind;
use deeponet_rs::{
    Activation, DecompositionHelper, DeepONet, DeepOnetBatch, DeepOnetConfig, Objective,
    OutputHandlingKind, PodBasisHelper, PodTraining, Result, StandardTraining, Trainer,
    TrainingStrategy, TrainingStrategyKind, TwoStepPhase, TwoStepTraining,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Standard,
    TwoStep,
    Pod,
}

impl From<Strategy> for TrainingStrategyKind {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Standard => Self::Standard,
            Strategy::TwoStep => Self::TwoStep,
            Strategy::Pod => Self::Pod,
        }
    }
}

#[derive(Parser)]
#[command(name = "synthetic_training")]
#[command(about = "Train a DeepONet on a synthetic operator")]
struct Cli {
    /// YAML configuration; a small built-in setup is used when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Training strategy, overrides the config
    #[arg(long, value_enum, default_value = "standard")]
    strategy: Strategy,
    /// Training samples
    #[arg(long, default_value_t = 64)]
    samples: usize,
    /// Grid points per sample
    #[arg(long, default_value_t = 32)]
    points: usize,
    /// Where to write the training history
    #[arg(long)]
    history: Option<PathBuf>,
}

fn synthetic_batch(
    n_samples: usize,
    n_points: usize,
    dtype: DType,
    rng: &mut ChaCha8Rng,
) -> Result<DeepOnetBatch> {
    let device = Device::Cpu;
    let tensor = |data: Vec<f32>, shape: (usize, usize)| {
        Tensor::from_vec(data, shape, &device)?.to_dtype(dtype)
    };
    let coeffs: Vec<f32> = (0..n_samples * 3).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let grid: Vec<f32> = (0..n_points)
        .map(|i| i as f32 / (n_points - 1).max(1) as f32)
        .collect();

    let mut real = Vec::with_capacity(n_samples * n_points);
    let mut imag = Vec::with_capacity(n_samples * n_points);
    for s in 0..n_samples {
        let (a, b, c) = (coeffs[3 * s], coeffs[3 * s + 1], coeffs[3 * s + 2]);
        for &x in &grid {
            let px = std::f32::consts::PI * x;
            real.push(a * px.sin() + b * x);
            imag.push(c * px.cos());
        }
    }

    Ok(DeepOnetBatch::new(
        Some(tensor(coeffs, (n_samples, 3))?),
        Some(tensor(grid, (n_points, 1))?),
    )
    .with_target("g_u_real", tensor(real, (n_samples, n_points))?)
    .with_target("g_u_imag", tensor(imag, (n_samples, n_points))?))
}

fn default_config() -> DeepOnetConfig {
    let mut config = DeepOnetConfig::default()
        .with_output_handling(OutputHandlingKind::SplitNetworks)
        .with_basis_functions(8)
        .with_layers(vec![3, 64, 64], vec![1, 64, 64])
        .with_activation(Activation::Tanh)
        .with_optimizer(OptimizerKind::AdamW, 2e-3)
        .with_epochs(1500, 1000, 1000);
    config.problem = "synthetic".into();
    config.log_every = 250;
    config
}

fn build_strategy(config: &DeepOnetConfig, train: &DeepOnetBatch) -> Result<TrainingStrategy> {
    let objective = Objective::new(
        config.loss_function,
        config.output_keys.clone(),
        config.error_norm,
    );
    Ok(match config.training_strategy {
        TrainingStrategyKind::Standard => StandardTraining::new(objective).into(),
        TrainingStrategyKind::TwoStep => TwoStepTraining::new(
            objective,
            DecompositionHelper::new(config.decomposition),
            train.branch_input()?.dims2()?.0,
            TwoStepPhase::Trunk,
        )
        .into(),
        TrainingStrategyKind::Pod => {
            let data = config
                .output_keys
                .iter()
                .map(|key| train.target(key).cloned())
                .collect::<Result<Vec<_>>>()?;
            PodTraining::new(
                objective,
                &PodBasisHelper::new(config.var_share)?,
                &data,
                config.output_handling.basis_config(),
            )?
            .into()
        }
    })
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DeepOnetConfig::from_file(path)?,
        None => default_config(),
    };
    config.training_strategy = cli.strategy.into();
    // Input sizes follow the synthetic data.
    if let Some(n) = config.branch_layers.first_mut() {
        *n = 3;
    }
    if let Some(n) = config.trunk_layers.first_mut() {
        *n = 1;
    }
    if config.training_strategy == TrainingStrategyKind::TwoStep
        && config.output_handling == OutputHandlingKind::ShareBranch
    {
        config.output_handling = OutputHandlingKind::ShareTrunk;
    }
    config.validate()?;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let dtype = config.dtype();
    let train = synthetic_batch(cli.samples, cli.points, dtype, &mut rng)?;
    let validation = synthetic_batch((cli.samples / 4).max(1), cli.points, dtype, &mut rng)?;

    let strategy = build_strategy(&config, &train)?;
    let mut model = DeepONet::new(&config, strategy, &Device::Cpu, &mut rng)?;
    println!(
        "{}: {} parameters, K = {}",
        config.model_name(),
        model.parameter_count(),
        model.n_basis_functions()
    );

    let mut trainer = Trainer::new(config)?;
    let history = trainer.fit(&mut model, &train, Some(&validation), &mut rng)?;

    let mut keys: Vec<_> = history.final_errors.keys().collect();
    keys.sort();
    for key in keys {
        let val = history
            .final_val_errors
            .as_ref()
            .and_then(|e| e.get(key))
            .copied()
            .unwrap_or(f64::NAN);
        println!(
            "{key:>10}  train {:.3e}  val {val:.3e}",
            history.final_errors[key]
        );
    }

    if let Some(path) = &cli.history {
        history.save_json(path)?;
        println!("history written to {}", path.display());
    }
    Ok(())
}
