//! Training strategies.
//!
//! A strategy decides which slots train, how the forward pass is assembled and
//! what the loss is measured against. The variants form a closed set selected
//! once from configuration:
//!
//! - [`StandardTraining`]: branch and trunk train jointly.
//! - [`TwoStepTraining`]: trunk phase against a free coefficient matrix,
//!   decomposition of the trained trunk, then branch phase against the
//!   transformed coefficients.
//! - [`PodTraining`]: the trunk is a fixed POD basis; only the branch trains.

mod pod;
mod standard;
mod two_step;

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use rand_chacha::ChaCha8Rng;

pub use pod::PodTraining;
pub use standard::StandardTraining;
pub use two_step::{TwoStepHelper, TwoStepPhase, TwoStepTraining};

use crate::batch::DeepOnetBatch;
use crate::config::TrainingStrategyKind;
use crate::error::Result;
use crate::loss::Objective;
use crate::model::ModelParts;
use crate::pod::PodBasis;

/// The active training strategy.
#[derive(Debug)]
pub enum TrainingStrategy {
    /// Joint single-phase training.
    Standard(StandardTraining),
    /// Decoupled trunk/branch training.
    TwoStep(TwoStepTraining),
    /// Fixed-basis training.
    Pod(PodTraining),
}

impl From<StandardTraining> for TrainingStrategy {
    fn from(s: StandardTraining) -> Self {
        Self::Standard(s)
    }
}

impl From<TwoStepTraining> for TrainingStrategy {
    fn from(s: TwoStepTraining) -> Self {
        Self::TwoStep(s)
    }
}

impl From<PodTraining> for TrainingStrategy {
    fn from(s: PodTraining) -> Self {
        Self::Pod(s)
    }
}

impl TrainingStrategy {
    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> TrainingStrategyKind {
        match self {
            Self::Standard(_) => TrainingStrategyKind::Standard,
            Self::TwoStep(_) => TrainingStrategyKind::TwoStep,
            Self::Pod(_) => TrainingStrategyKind::Pod,
        }
    }

    /// Loss, keys and error norm.
    #[must_use]
    pub const fn objective(&self) -> &Objective {
        match self {
            Self::Standard(s) => s.objective(),
            Self::TwoStep(s) => s.objective(),
            Self::Pod(s) => s.objective(),
        }
    }

    /// Precomputed basis the trunk slot must hold, if any.
    #[must_use]
    pub const fn pod_basis(&self) -> Option<&PodBasis> {
        match self {
            Self::Pod(s) => Some(s.basis()),
            _ => None,
        }
    }

    /// Two-step state, if this is the two-step strategy.
    #[must_use]
    pub const fn as_two_step(&self) -> Option<&TwoStepTraining> {
        match self {
            Self::TwoStep(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable two-step state, if this is the two-step strategy.
    pub fn as_two_step_mut(&mut self) -> Option<&mut TwoStepTraining> {
        match self {
            Self::TwoStep(s) => Some(s),
            _ => None,
        }
    }

    /// Validate wiring and set trainability before the first epoch.
    pub fn prepare_training(&mut self, parts: &mut ModelParts, rng: &mut ChaCha8Rng) -> Result<()> {
        match self {
            Self::Standard(s) => s.prepare_training(parts),
            Self::TwoStep(s) => s.prepare_training(parts, rng),
            Self::Pod(s) => s.prepare_training(parts),
        }
    }

    /// Per-output predictions, each `(batch, n_points)`.
    pub fn forward(
        &self,
        parts: &ModelParts,
        xb: Option<&Tensor>,
        xt: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        match self {
            Self::Standard(s) => s.forward(parts, xb, xt),
            Self::TwoStep(s) => s.forward(parts, xb, xt),
            Self::Pod(s) => s.forward(parts, xb),
        }
    }

    /// Scalar loss of `outputs` for `batch`.
    pub fn compute_loss(
        &self,
        parts: &ModelParts,
        outputs: &[Tensor],
        batch: &DeepOnetBatch,
    ) -> Result<Tensor> {
        match self {
            Self::Standard(s) => s.compute_loss(outputs, batch),
            Self::TwoStep(s) => s.compute_loss(parts, outputs, batch),
            Self::Pod(s) => s.compute_loss(outputs, batch),
        }
    }

    /// Relative error per output key.
    pub fn compute_errors(
        &self,
        parts: &ModelParts,
        outputs: &[Tensor],
        batch: &DeepOnetBatch,
    ) -> Result<HashMap<String, f64>> {
        match self {
            Self::Standard(s) => s.compute_errors(outputs, batch),
            Self::TwoStep(s) => s.compute_errors(parts, outputs, batch),
            Self::Pod(s) => s.compute_errors(outputs, batch),
        }
    }

    /// Variables the optimizer should update in the current state.
    #[must_use]
    pub fn trainable_vars(&self, parts: &ModelParts) -> Vec<Var> {
        let mut vars = parts.branch.trainable_vars();
        vars.extend(parts.trunk.trainable_vars());
        if let Self::TwoStep(s) = self {
            vars.extend(s.extra_trainable_vars());
        }
        vars
    }

    /// Hook run after every epoch.
    pub fn after_epoch(&mut self, epoch: usize) {
        if let Self::TwoStep(s) = self {
            s.after_epoch(epoch);
        }
    }
}
