//! The DeepONet composition root.
//!
//! The model owns its branch and trunk slots, the configured output handling
//! and the training strategy. Slots and output handling live in
//! [`ModelParts`] so the strategy can borrow them mutably (two-step training
//! swaps the trunk slot between phases) while the model owns both.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::batch::{expand_trunk_features, DeepOnetBatch};
use crate::component::Component;
use crate::config::DeepOnetConfig;
use crate::error::{DeepOnetError, Result};
use crate::network::Mlp;
use crate::output_handling::{OutputHandling, OutputLayout};
use crate::strategy::{TrainingStrategy, TwoStepPhase};

/// Branch, trunk and output handling of a model.
#[derive(Debug)]
pub struct ModelParts {
    /// Branch slot; always a network.
    pub branch: Component,
    /// Trunk slot.
    pub trunk: Component,
    /// Configured output handling.
    pub output_handling: OutputHandling,
    /// Tensor dtype.
    pub dtype: DType,
    /// Tensor device.
    pub device: Device,
}

impl ModelParts {
    fn check_widths(&self) -> Result<()> {
        let layout = self.output_handling.layout();
        let k = self.output_handling.n_basis_functions();
        let branch = self.branch.output_size();
        let trunk = self.trunk.output_size();
        if branch != layout.branch_output_size || branch % k != 0 {
            return Err(DeepOnetError::shape_mismatch(
                format!("branch width {}", layout.branch_output_size),
                format!("{branch}"),
            ));
        }
        if trunk != layout.trunk_output_size || trunk % k != 0 {
            return Err(DeepOnetError::shape_mismatch(
                format!("trunk width {}", layout.trunk_output_size),
                format!("{trunk}"),
            ));
        }
        Ok(())
    }
}

/// Deep operator network.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use deeponet_rs::{DeepONet, DeepOnetConfig, Objective, StandardTraining};
/// use rand::SeedableRng;
/// use rand_chacha::ChaCha8Rng;
///
/// # fn main() -> deeponet_rs::Result<()> {
/// let config = DeepOnetConfig::default()
///     .with_basis_functions(4)
///     .with_layers(vec![3, 16], vec![1, 16]);
/// let objective = Objective::new(config.loss_function, config.output_keys.clone(), config.error_norm);
/// let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
/// let model = DeepONet::new(&config, StandardTraining::new(objective).into(), &Device::Cpu, &mut rng)?;
///
/// let xb = Tensor::zeros((5, 3), candle_core::DType::F32, &Device::Cpu)?;
/// let xt = Tensor::zeros((7, 1), candle_core::DType::F32, &Device::Cpu)?;
/// let outputs = model.forward(Some(&xb), Some(&xt))?;
/// assert_eq!(outputs.len(), 2);
/// assert_eq!(outputs[0].dims(), &[5, 7]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DeepONet {
    parts: ModelParts,
    strategy: TrainingStrategy,
    trunk_feature_expansion: usize,
}

impl DeepONet {
    /// Build networks from `config` and prepare `strategy` for training.
    ///
    /// Layer lists in the config hold input and hidden sizes; the output
    /// widths come from the output handling. A POD strategy puts its basis in
    /// the trunk slot instead of a network, and K follows the basis.
    ///
    /// # Errors
    ///
    /// Configuration errors (including incompatible strategy pairs) and
    /// shape errors from the output handling.
    pub fn new(
        config: &DeepOnetConfig,
        mut strategy: TrainingStrategy,
        device: &Device,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        config.validate()?;
        if strategy.kind() != config.training_strategy {
            return Err(DeepOnetError::config(format!(
                "TRAINING_STRATEGY is {} but a {} strategy was supplied",
                config.training_strategy,
                strategy.kind()
            )));
        }
        if strategy.objective().output_keys() != config.output_keys.as_slice() {
            return Err(DeepOnetError::config(
                "strategy output keys differ from OUTPUT_KEYS",
            ));
        }

        let dtype = config.dtype();
        let output_handling = OutputHandling::configure(
            config.output_handling,
            strategy.kind(),
            config.basis_functions,
            config.n_outputs(),
            strategy.pod_basis(),
        )?;
        let layout = *output_handling.layout();

        let mut branch_layers = config.branch_layers.clone();
        branch_layers.push(layout.branch_output_size);
        let branch = Mlp::new(&branch_layers, config.activation, dtype, device, rng)?;

        let trunk = match strategy.pod_basis() {
            Some(basis) => Component::Pod(basis.clone()),
            None => {
                let mut trunk_layers = config.trunk_layers.clone();
                trunk_layers[0] *= 1 + 2 * config.trunk_feature_expansion;
                trunk_layers.push(layout.trunk_output_size);
                Component::Network(Mlp::new(
                    &trunk_layers,
                    config.activation,
                    dtype,
                    device,
                    rng,
                )?)
            }
        };

        let mut parts = ModelParts {
            branch: Component::Network(branch),
            trunk,
            output_handling,
            dtype,
            device: device.clone(),
        };
        parts.check_widths()?;
        strategy.prepare_training(&mut parts, rng)?;

        info!(
            model = %config.model_name(),
            n_basis_functions = parts.output_handling.n_basis_functions(),
            n_outputs = parts.output_handling.n_outputs(),
            branch = ?branch_layers,
            trunk = parts.trunk.kind_name(),
            "built DeepONet"
        );

        Ok(Self {
            parts,
            strategy,
            trunk_feature_expansion: config.trunk_feature_expansion,
        })
    }

    /// Assemble a model from existing slots, e.g. for inference.
    ///
    /// # Errors
    ///
    /// [`DeepOnetError::ShapeMismatch`] if a slot width disagrees with the
    /// output handling layout, plus any error from `prepare_training`.
    pub fn from_parts(
        mut parts: ModelParts,
        mut strategy: TrainingStrategy,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        parts
            .output_handling
            .kind()
            .check_compatibility(strategy.kind())?;
        parts.check_widths()?;
        strategy.prepare_training(&mut parts, rng)?;
        Ok(Self {
            parts,
            strategy,
            trunk_feature_expansion: 0,
        })
    }

    /// Append `harmonics` sin/cos features to trunk inputs before the trunk sees them.
    #[must_use]
    pub fn with_trunk_feature_expansion(mut self, harmonics: usize) -> Self {
        self.trunk_feature_expansion = harmonics;
        self
    }

    fn trunk_input(&self, xt: Option<&Tensor>) -> Result<Option<Tensor>> {
        xt.map(|x| expand_trunk_features(x, self.trunk_feature_expansion))
            .transpose()
    }

    /// Per-output predictions for the current strategy state.
    pub fn forward(&self, xb: Option<&Tensor>, xt: Option<&Tensor>) -> Result<Vec<Tensor>> {
        let xt = self.trunk_input(xt)?;
        self.strategy.forward(&self.parts, xb, xt.as_ref())
    }

    /// Forward pass on `batch` and its loss.
    pub fn compute_loss(&self, batch: &DeepOnetBatch) -> Result<Tensor> {
        let outputs = self.forward(batch.xb.as_ref(), batch.xt.as_ref())?;
        self.strategy.compute_loss(&self.parts, &outputs, batch)
    }

    /// Forward pass on `batch` and its relative errors per output key.
    pub fn compute_errors(&self, batch: &DeepOnetBatch) -> Result<HashMap<String, f64>> {
        let outputs = self.forward(batch.xb.as_ref(), batch.xt.as_ref())?;
        self.strategy.compute_errors(&self.parts, &outputs, batch)
    }

    /// Loss (with graph) and errors from a single forward pass.
    pub fn compute_loss_and_errors(
        &self,
        batch: &DeepOnetBatch,
    ) -> Result<(Tensor, HashMap<String, f64>)> {
        let outputs = self.forward(batch.xb.as_ref(), batch.xt.as_ref())?;
        let loss = self.strategy.compute_loss(&self.parts, &outputs, batch)?;
        let errors = self.strategy.compute_errors(&self.parts, &outputs, batch)?;
        Ok((loss, errors))
    }

    /// Loss value and errors, no gradients kept.
    pub fn evaluate(&self, batch: &DeepOnetBatch) -> Result<(f64, HashMap<String, f64>)> {
        let outputs = self.forward(batch.xb.as_ref(), batch.xt.as_ref())?;
        let outputs: Vec<Tensor> = outputs.iter().map(Tensor::detach).collect();
        let loss = self
            .strategy
            .compute_loss(&self.parts, &outputs, batch)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        let errors = self.strategy.compute_errors(&self.parts, &outputs, batch)?;
        Ok((loss, errors))
    }

    /// Variables the optimizer should update now.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.strategy.trainable_vars(&self.parts)
    }

    /// Current two-step phase, if training two-step.
    #[must_use]
    pub fn phase(&self) -> Option<TwoStepPhase> {
        self.strategy.as_two_step().map(|s| s.phase())
    }

    fn two_step_error(&self, operation: &str) -> DeepOnetError {
        DeepOnetError::config(format!(
            "{operation} requires two-step training, strategy is {}",
            self.strategy.kind()
        ))
    }

    /// Guarded two-step phase transition.
    pub fn update_training_phase(&mut self, phase: TwoStepPhase) -> Result<()> {
        match self.strategy.as_two_step_mut() {
            Some(s) => s.update_training_phase(phase),
            None => Err(self.two_step_error("a phase transition")),
        }
    }

    /// Apply the current phase's trainability and trunk slot.
    pub fn prepare_for_phase(&mut self, rng: &mut ChaCha8Rng) -> Result<()> {
        match self.strategy.as_two_step_mut() {
            Some(s) => s.prepare_for_phase(&mut self.parts, rng),
            None => {
                debug!(strategy = %self.strategy.kind(), "single-phase strategy, nothing to prepare");
                Ok(())
            }
        }
    }

    /// Decompose the trained trunk evaluated at `xt`; returns the orthonormal trunk.
    pub fn compute_trained_trunk(&mut self, xt: &Tensor) -> Result<Tensor> {
        let xt = expand_trunk_features(xt, self.trunk_feature_expansion)?;
        match self.strategy.as_two_step_mut() {
            Some(s) => Ok(s.compute_trained_trunk(&self.parts, &xt)?.clone()),
            None => Err(self.two_step_error("trunk decomposition")),
        }
    }

    /// Hook after every epoch.
    pub fn after_epoch(&mut self, epoch: usize) {
        self.strategy.after_epoch(epoch);
    }

    /// K.
    #[must_use]
    pub const fn n_basis_functions(&self) -> usize {
        self.parts.output_handling.n_basis_functions()
    }

    /// Number of output channels.
    #[must_use]
    pub const fn n_outputs(&self) -> usize {
        self.parts.output_handling.n_outputs()
    }

    /// Widths recorded by the output handling.
    #[must_use]
    pub const fn output_layout(&self) -> &OutputLayout {
        self.parts.output_handling.layout()
    }

    /// Slots and output handling.
    #[must_use]
    pub const fn parts(&self) -> &ModelParts {
        &self.parts
    }

    /// The training strategy.
    #[must_use]
    pub const fn strategy(&self) -> &TrainingStrategy {
        &self.strategy
    }

    /// Number of scalar parameters in network slots.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        [&self.parts.branch, &self.parts.trunk]
            .iter()
            .filter_map(|c| c.as_network())
            .map(Mlp::parameter_count)
            .sum()
    }
}
