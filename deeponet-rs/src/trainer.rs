//! Training loop.
//!
//! Full-batch epochs over a [`DeepONet`]. The optimizer is rebuilt over the
//! trainable variables whenever the phase changes, and every epoch is
//! recorded in a serializable [`TrainingHistory`].

use std::collections::HashMap;
use std::path::Path;

use candle_core::DType;
use indicatif::{ProgressBar, ProgressStyle};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::DeepOnetBatch;
use crate::config::{DeepOnetConfig, TrainingStrategyKind};
use crate::error::{DeepOnetError, Result};
use crate::model::DeepONet;
use crate::optimizer::OptimizerConfig;
use crate::scheduler::{LRScheduler, SchedulerType};
use crate::strategy::TwoStepPhase;

/// Metrics of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Epoch index within its phase.
    pub epoch: usize,
    /// Phase label (`standard`, `pod`, `trunk`, `branch`).
    pub phase: String,
    /// Training loss before the update.
    pub loss: f64,
    /// Learning rate used for the update.
    pub learning_rate: f64,
    /// Relative training error per output key.
    pub errors: HashMap<String, f64>,
    /// Validation loss, when validated this epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    /// Validation errors, when validated this epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_errors: Option<HashMap<String, f64>>,
}

/// Everything recorded during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Run name.
    pub model_name: String,
    /// Strategy used.
    pub strategy: String,
    /// Per-epoch metrics across all phases.
    pub epochs: Vec<EpochMetrics>,
    /// Training errors of the final model.
    #[serde(default)]
    pub final_errors: HashMap<String, f64>,
    /// Validation errors of the final model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_val_errors: Option<HashMap<String, f64>>,
}

impl TrainingHistory {
    /// Training losses in epoch order.
    #[must_use]
    pub fn losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.loss).collect()
    }

    /// Metrics recorded for `phase`.
    pub fn phase(&self, phase: &str) -> impl Iterator<Item = &EpochMetrics> {
        let phase = phase.to_string();
        self.epochs.iter().filter(move |m| m.phase == phase)
    }

    /// Write as pretty JSON.
    ///
    /// Infinite errors (zero-norm targets) are written as `null`.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a history written by [`save_json`](Self::save_json).
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use deeponet_rs::{DeepONet, DeepOnetBatch, DeepOnetConfig, Objective, StandardTraining, Trainer};
/// use rand::SeedableRng;
/// use rand_chacha::ChaCha8Rng;
///
/// # fn main() -> deeponet_rs::Result<()> {
/// # let batch = DeepOnetBatch::default();
/// let config = DeepOnetConfig::from_file("examples/configs/standard.yaml")?;
/// let objective = Objective::new(config.loss_function, config.output_keys.clone(), config.error_norm);
/// let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
/// let mut model = DeepONet::new(&config, StandardTraining::new(objective).into(), &Device::Cpu, &mut rng)?;
///
/// let mut trainer = Trainer::new(config)?;
/// let history = trainer.fit(&mut model, &batch, None, &mut rng)?;
/// history.save_json("history.json")?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    /// Configuration
    config: DeepOnetConfig,
    /// Recorded metrics
    history: TrainingHistory,
}

impl Trainer {
    /// Create a trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(config: DeepOnetConfig) -> Result<Self> {
        config.validate()?;
        let history = TrainingHistory {
            model_name: config.model_name(),
            strategy: config.training_strategy.to_string(),
            ..TrainingHistory::default()
        };
        Ok(Self { config, history })
    }

    /// Recorded metrics so far.
    #[must_use]
    pub const fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Train `model` on the full batch `train`.
    ///
    /// Single-phase strategies run `EPOCHS` epochs. Two-step training runs
    /// `TRUNK_TRAIN_EPOCHS` trunk epochs, decomposes the trunk on the training
    /// trunk input, runs `BRANCH_TRAIN_EPOCHS` branch epochs and finishes in
    /// the `both` phase. Final errors are computed in inference mode; a
    /// validation batch is only evaluated where its batch size cannot clash
    /// with the coefficient matrix (not during two-step phases).
    pub fn fit(
        &mut self,
        model: &mut DeepONet,
        train: &DeepOnetBatch,
        validation: Option<&DeepOnetBatch>,
        rng: &mut ChaCha8Rng,
    ) -> Result<&TrainingHistory> {
        info!(
            model = %self.history.model_name,
            strategy = %model.strategy().kind(),
            n_basis_functions = model.n_basis_functions(),
            parameters = model.parameter_count(),
            "starting training"
        );

        match model.strategy().kind() {
            TrainingStrategyKind::Standard | TrainingStrategyKind::Pod => {
                let label = model.strategy().kind().to_string();
                self.run_phase(model, train, validation, self.config.epochs, &label)?;
            }
            TrainingStrategyKind::TwoStep => self.fit_two_step(model, train, rng)?,
        }

        let (loss, errors) = model.evaluate(train)?;
        info!(loss, errors = ?errors, "final training metrics");
        self.history.final_errors = errors;
        if let Some(val) = validation {
            let (val_loss, val_errors) = model.evaluate(val)?;
            info!(val_loss, val_errors = ?val_errors, "final validation metrics");
            self.history.final_val_errors = Some(val_errors);
        }
        Ok(&self.history)
    }

    fn fit_two_step(
        &mut self,
        model: &mut DeepONet,
        train: &DeepOnetBatch,
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        if model.phase() == Some(TwoStepPhase::Trunk) {
            self.run_phase(model, train, None, self.config.trunk_train_epochs, "trunk")?;
            model.compute_trained_trunk(train.trunk_input()?)?;
            model.update_training_phase(TwoStepPhase::Branch)?;
            model.prepare_for_phase(rng)?;
        }
        if model.phase() == Some(TwoStepPhase::Branch) {
            self.run_phase(model, train, None, self.config.branch_train_epochs, "branch")?;
        }
        model.update_training_phase(TwoStepPhase::Both)?;
        model.prepare_for_phase(rng)
    }

    fn run_phase(
        &mut self,
        model: &mut DeepONet,
        train: &DeepOnetBatch,
        validation: Option<&DeepOnetBatch>,
        epochs: usize,
        phase: &str,
    ) -> Result<()> {
        let vars = model.trainable_vars();
        debug!(phase, n_vars = vars.len(), "building optimizer");
        let mut optimizer = OptimizerConfig::from_config(&self.config).build(vars)?;
        let mut scheduler = LRScheduler::new(
            SchedulerType::from_config(&self.config, epochs),
            self.config.learning_rate,
        );
        info!(phase, epochs, "starting phase");

        let pb = ProgressBar::new(epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>6} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(phase.to_string());

        for epoch in 0..epochs {
            let (loss, errors) = model.compute_loss_and_errors(train)?;
            let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            if !loss_value.is_finite() {
                return Err(DeepOnetError::training(format!(
                    "non-finite loss {loss_value} at {phase} epoch {epoch}"
                )));
            }
            let learning_rate = optimizer.learning_rate();
            optimizer.step(&loss)?;
            scheduler.step(&mut optimizer);
            pb.set_message(format!("{loss_value:.4e}"));
            pb.inc(1);

            let is_log_epoch = epoch % self.config.log_every == 0 || epoch + 1 == epochs;
            let (val_loss, val_errors) = match validation {
                Some(val) if is_log_epoch => {
                    let (l, e) = model.evaluate(val)?;
                    (Some(l), Some(e))
                }
                _ => (None, None),
            };
            if is_log_epoch {
                info!(
                    phase,
                    epoch,
                    loss = loss_value,
                    lr = learning_rate,
                    errors = ?errors,
                    val_loss = ?val_loss,
                    "epoch"
                );
            }

            model.after_epoch(epoch);
            self.history.epochs.push(EpochMetrics {
                epoch,
                phase: phase.to_string(),
                loss: loss_value,
                learning_rate,
                errors,
                val_loss,
                val_errors,
            });
        }
        pb.finish_with_message(format!("{phase} done"));
        Ok(())
    }
}
