//! Decoupled two-step training.
//!
//! 1. **Trunk phase.** A free coefficient matrix `A` stands in for the branch
//!    output; trunk and `A` are fitted to the raw targets.
//! 2. **Decomposition.** Each K-wide block of the trained trunk output is
//!    factored `T_j = Q_j R_j`. The `Q_j` become a frozen trunk and
//!    `R = blockdiag(R_j)` is kept.
//! 3. **Branch phase.** The branch learns the coefficients `A·Rᵀ` directly,
//!    fused with the identity trunk, so no trunk evaluation is needed.
//! 4. **Both.** Branch and frozen trunk compose the full operator for
//!    inference.

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::batch::DeepOnetBatch;
use crate::component::Component;
use crate::config::TrainingStrategyKind;
use crate::decomposition::{DecompositionHelper, TrunkDecomposition};
use crate::error::{DeepOnetError, Result};
use crate::loss::Objective;
use crate::model::ModelParts;
use crate::network::kaiming_uniform;
use crate::output_handling::OutputHandling;

/// Two-step training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TwoStepPhase {
    /// Trunk and coefficient matrix train.
    Trunk,
    /// Branch trains against transformed coefficients.
    Branch,
    /// Branch and trained trunk compose the operator.
    Both,
}

impl fmt::Display for TwoStepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trunk => write!(f, "trunk"),
            Self::Branch => write!(f, "branch"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Coefficient matrix, decomposition and basis change for two-step training.
#[derive(Debug)]
pub struct TwoStepHelper {
    decomposition: DecompositionHelper,
    a: Option<Var>,
    decomposed: Option<TrunkDecomposition>,
}

impl TwoStepHelper {
    /// Helper decomposing with `decomposition`.
    #[must_use]
    pub const fn new(decomposition: DecompositionHelper) -> Self {
        Self {
            decomposition,
            a: None,
            decomposed: None,
        }
    }

    /// (Re)draw `A` of shape `(batch_size, width)` from `rng`.
    pub fn init_coefficients(
        &mut self,
        batch_size: usize,
        width: usize,
        dtype: DType,
        device: &Device,
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        let a = kaiming_uniform(batch_size, width, dtype, device, rng)?;
        self.a = Some(Var::from_tensor(&a)?);
        debug!(batch_size, width, "initialized coefficient matrix A");
        Ok(())
    }

    /// The coefficient matrix.
    pub fn coefficients(&self) -> Result<&Var> {
        self.a.as_ref().ok_or_else(|| {
            DeepOnetError::training("coefficient matrix A is not initialized; call prepare_training")
        })
    }

    /// Basis change `R`, once the decomposition has run.
    #[must_use]
    pub fn basis_change(&self) -> Option<&Tensor> {
        self.decomposed.as_ref().map(|d| &d.r)
    }

    /// Orthonormal trained trunk, once the decomposition has run.
    #[must_use]
    pub fn trained_trunk(&self) -> Option<&Tensor> {
        self.decomposed.as_ref().map(|d| &d.trained_trunk)
    }

    /// Decompose `trunk_output` into the trained trunk and `R`.
    pub fn compute_trained_trunk(&mut self, trunk_output: &Tensor, k: usize) -> Result<&Tensor> {
        let decomposed = self.decomposition.decompose(trunk_output, k)?;
        Ok(&self.decomposed.insert(decomposed).trained_trunk)
    }

    /// `R` in the layout the output handling expects as a trunk.
    ///
    /// An `n·K × n·K` block-diagonal `R` becomes its `n` diagonal blocks side
    /// by side, `(K, n·K)`; any other `R` is used unchanged.
    pub fn merged_basis_change(&self, n_outputs: usize, k: usize) -> Result<Tensor> {
        let r = self
            .basis_change()
            .ok_or_else(|| DeepOnetError::missing_basis_change("the branch-phase targets"))?;
        let (rows, cols) = r.dims2()?;
        if rows == n_outputs * k && cols == n_outputs * k {
            let blocks = (0..n_outputs)
                .map(|i| r.narrow(0, i * k, k)?.narrow(1, i * k, k))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::cat(&blocks, 1)?)
        } else {
            Ok(r.clone())
        }
    }

    /// Targets for the branch phase: `output_handling(A, R')` with `A` detached.
    pub fn basis_change_targets(&self, output_handling: &OutputHandling) -> Result<Vec<Tensor>> {
        let r = self.merged_basis_change(
            output_handling.n_outputs(),
            output_handling.n_basis_functions(),
        )?;
        let a = self.coefficients()?.as_tensor().detach();
        output_handling.forward(&a, Some(&r))
    }
}

/// Decoupled trunk-then-branch training.
#[derive(Debug)]
pub struct TwoStepTraining {
    objective: Objective,
    helper: TwoStepHelper,
    phase: TwoStepPhase,
    batch_size: usize,
}

impl TwoStepTraining {
    /// Strategy for a training set of `batch_size` branch samples, starting in `initial_phase`.
    #[must_use]
    pub const fn new(
        objective: Objective,
        decomposition: DecompositionHelper,
        batch_size: usize,
        initial_phase: TwoStepPhase,
    ) -> Self {
        Self {
            objective,
            helper: TwoStepHelper::new(decomposition),
            phase: initial_phase,
            batch_size,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> TwoStepPhase {
        self.phase
    }

    /// Coefficient matrix, decomposition results.
    #[must_use]
    pub const fn helper(&self) -> &TwoStepHelper {
        &self.helper
    }

    pub(crate) const fn objective(&self) -> &Objective {
        &self.objective
    }

    pub(crate) fn prepare_training(
        &mut self,
        parts: &mut ModelParts,
        rng: &mut ChaCha8Rng,
    ) -> Result<()> {
        parts
            .output_handling
            .kind()
            .check_compatibility(TrainingStrategyKind::TwoStep)?;
        // The trunk phase draws A on entry.
        if self.phase != TwoStepPhase::Trunk {
            self.init_coefficients(parts, rng)?;
        }
        info!(phase = %self.phase, "two-step training prepared");
        self.prepare_for_phase(parts, rng)
    }

    fn init_coefficients(&mut self, parts: &ModelParts, rng: &mut ChaCha8Rng) -> Result<()> {
        let width = parts.output_handling.layout().branch_output_size;
        self.helper
            .init_coefficients(self.batch_size, width, parts.dtype, &parts.device, rng)
    }

    /// Move to `phase` if the transition is allowed.
    ///
    /// | from → to | allowed when |
    /// |---|---|
    /// | same → same | always (no-op) |
    /// | trunk → branch | `R` is available |
    /// | trunk → both, branch → both | always |
    ///
    /// # Errors
    ///
    /// [`DeepOnetError::MissingBasisChange`] for trunk → branch before the
    /// decomposition, [`DeepOnetError::InvalidPhaseTransition`] otherwise.
    pub fn update_training_phase(&mut self, phase: TwoStepPhase) -> Result<()> {
        use TwoStepPhase::{Both, Branch, Trunk};

        match (self.phase, phase) {
            (from, to) if from == to => return Ok(()),
            (Trunk, Branch) => {
                if self.helper.basis_change().is_none() {
                    return Err(DeepOnetError::missing_basis_change(
                        "the trunk -> branch transition",
                    ));
                }
            }
            (Trunk | Branch, Both) => {}
            (from, to) => {
                return Err(DeepOnetError::InvalidPhaseTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
        }
        info!(from = %self.phase, to = %phase, "two-step phase transition");
        self.phase = phase;
        Ok(())
    }

    /// Set trainability and trunk slot for the current phase.
    ///
    /// Entering the trunk phase draws `A`. The branch and both phases swap
    /// the trunk slot for the frozen trained trunk once it exists.
    pub fn prepare_for_phase(&mut self, parts: &mut ModelParts, rng: &mut ChaCha8Rng) -> Result<()> {
        match self.phase {
            TwoStepPhase::Trunk => {
                self.init_coefficients(parts, rng)?;
                parts.branch.set_trainable(false);
                parts.trunk.set_trainable(true);
            }
            TwoStepPhase::Branch | TwoStepPhase::Both => {
                match self.helper.trained_trunk() {
                    Some(trained) => parts.trunk = Component::Fixed(trained.clone()),
                    None => warn!(
                        phase = %self.phase,
                        "trained trunk not computed yet; keeping the trunk network frozen"
                    ),
                }
                parts.trunk.set_trainable(false);
                parts
                    .branch
                    .set_trainable(self.phase == TwoStepPhase::Branch);
            }
        }
        debug!(
            phase = %self.phase,
            branch_trainable = parts.branch.is_trainable(),
            trunk = parts.trunk.kind_name(),
            "prepared two-step phase"
        );
        Ok(())
    }

    /// Run the decomposition on the trunk output for `xt`.
    ///
    /// # Errors
    ///
    /// [`DeepOnetError::Config`] if the trunk slot is no longer a network.
    pub fn compute_trained_trunk(&mut self, parts: &ModelParts, xt: &Tensor) -> Result<&Tensor> {
        if parts.trunk.as_network().is_none() {
            return Err(DeepOnetError::config(format!(
                "decomposition needs the trunk network, found a {} trunk",
                parts.trunk.kind_name()
            )));
        }
        let trunk_output = parts.trunk.forward(Some(xt))?.detach();
        let k = parts.output_handling.n_basis_functions();
        self.helper.compute_trained_trunk(&trunk_output, k)
    }

    /// Phase-dependent forward pass.
    ///
    /// Once the trained trunk replaces the network, it is tied to the points
    /// it was decomposed on: `xt` is only checked for a matching point count
    /// and its coordinates are not read.
    pub(crate) fn forward(
        &self,
        parts: &ModelParts,
        xb: Option<&Tensor>,
        xt: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        match self.phase {
            TwoStepPhase::Trunk => {
                let trunk_out = parts.trunk.forward(xt)?;
                let a = self.helper.coefficients()?;
                parts.output_handling.forward(a.as_tensor(), Some(&trunk_out))
            }
            TwoStepPhase::Branch => {
                let branch_out = parts.branch.forward(xb)?;
                parts.output_handling.forward(&branch_out, None)
            }
            TwoStepPhase::Both => {
                if let (Component::Fixed(q), Some(xt)) = (&parts.trunk, xt) {
                    let (trained_points, _) = q.dims2()?;
                    let (n_points, _) = xt.dims2()?;
                    if n_points != trained_points {
                        return Err(DeepOnetError::shape_mismatch(
                            format!("{trained_points} trunk points, the grid of the trained trunk"),
                            format!("{n_points} points"),
                        ));
                    }
                }
                let branch_out = parts.branch.forward(xb)?;
                let trunk_out = parts.trunk.forward(xt)?;
                parts.output_handling.forward(&branch_out, Some(&trunk_out))
            }
        }
    }

    fn targets(&self, parts: &ModelParts, batch: &DeepOnetBatch) -> Result<Vec<Tensor>> {
        match self.phase {
            TwoStepPhase::Branch => self.helper.basis_change_targets(&parts.output_handling),
            TwoStepPhase::Trunk | TwoStepPhase::Both => self.objective.targets(batch),
        }
    }

    pub(crate) fn compute_loss(
        &self,
        parts: &ModelParts,
        outputs: &[Tensor],
        batch: &DeepOnetBatch,
    ) -> Result<Tensor> {
        let targets = self.targets(parts, batch)?;
        self.objective.loss(&targets, outputs)
    }

    pub(crate) fn compute_errors(
        &self,
        parts: &ModelParts,
        outputs: &[Tensor],
        batch: &DeepOnetBatch,
    ) -> Result<HashMap<String, f64>> {
        let targets = self.targets(parts, batch)?;
        self.objective.errors(&targets, outputs)
    }

    pub(crate) fn extra_trainable_vars(&self) -> Vec<Var> {
        match (self.phase, &self.helper.a) {
            (TwoStepPhase::Trunk, Some(a)) => vec![a.clone()],
            _ => Vec::new(),
        }
    }

    pub(crate) fn after_epoch(&mut self, epoch: usize) {
        tracing::trace!(epoch, phase = %self.phase, "two-step epoch finished");
    }
}
