//! Optimizer implementations (AdamW, SGD).

use candle_core::{Tensor, Var};
use candle_nn::{Optimizer as _, ParamsAdamW};

use crate::config::{DeepOnetConfig, OptimizerKind};
use crate::error::{DeepOnetError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub kind: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Optimizer settings from a run configuration.
    #[must_use]
    pub fn from_config(config: &DeepOnetConfig) -> Self {
        Self {
            kind: config.optimizer,
            learning_rate: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Self::default()
        }
    }

    /// Build an optimizer over `vars`.
    ///
    /// Called again whenever the trainable set changes, so optimizer state
    /// never refers to frozen variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, vars: Vec<Var>) -> Result<Optimizer> {
        match self.kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: self.learning_rate,
                    beta1: self.beta1,
                    beta2: self.beta2,
                    eps: self.eps,
                    weight_decay: self.weight_decay,
                };
                let opt = candle_nn::AdamW::new(vars, params).map_err(|e| {
                    DeepOnetError::training(format!("failed to create AdamW: {e}"))
                })?;
                Ok(Optimizer::AdamW(opt))
            }
            OptimizerKind::Sgd => {
                let opt = candle_nn::SGD::new(vars, self.learning_rate).map_err(|e| {
                    DeepOnetError::training(format!("failed to create SGD: {e}"))
                })?;
                Ok(Optimizer::Sgd(opt))
            }
        }
    }
}

/// A built optimizer.
pub enum Optimizer {
    /// AdamW.
    AdamW(candle_nn::AdamW),
    /// Plain SGD.
    Sgd(candle_nn::SGD),
}

impl Optimizer {
    /// Backpropagate `loss` and apply one update.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        let res = match self {
            Self::AdamW(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        };
        res.map_err(|e| DeepOnetError::training(format!("optimizer step failed: {e}")))
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
