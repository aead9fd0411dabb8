use std::collections::HashMap;

use candle_core::Tensor;
use tracing::info;

use crate::batch::DeepOnetBatch;
use crate::error::{DeepOnetError, Result};
use crate::loss::Objective;
use crate::model::ModelParts;
use crate::output_handling::BasisConfig;
use crate::pod::{PodBasis, PodBasisHelper};

/// Training against a fixed POD trunk; only the branch learns.
///
/// Predictions are `output_handling(branch(xb), basis) + mean`. The trunk
/// input is never read.
#[derive(Debug, Clone)]
pub struct PodTraining {
    objective: Objective,
    basis: PodBasis,
}

impl PodTraining {
    /// Compute the basis from one data matrix per output, `(n_samples, n_points)` each.
    ///
    /// The basis layout must match the output handling the model will use
    /// (see [`OutputHandlingKind::basis_config`](crate::output_handling::OutputHandlingKind::basis_config)).
    pub fn new(
        objective: Objective,
        helper: &PodBasisHelper,
        data: &[Tensor],
        basis_config: BasisConfig,
    ) -> Result<Self> {
        let basis = helper.compute(data, basis_config)?;
        Ok(Self { objective, basis })
    }

    /// Build from an already computed basis, e.g. for inference.
    #[must_use]
    pub fn from_basis(objective: Objective, basis: PodBasis) -> Self {
        Self { objective, basis }
    }

    /// The fixed basis.
    #[must_use]
    pub const fn basis(&self) -> &PodBasis {
        &self.basis
    }

    pub(crate) const fn objective(&self) -> &Objective {
        &self.objective
    }

    pub(crate) fn prepare_training(&mut self, parts: &mut ModelParts) -> Result<()> {
        let Some(pod) = parts.trunk.as_pod() else {
            return Err(DeepOnetError::config(format!(
                "POD training needs a POD trunk, found a {} trunk",
                parts.trunk.kind_name()
            )));
        };
        if pod.basis_config() != parts.output_handling.kind().basis_config() {
            return Err(DeepOnetError::config(format!(
                "{:?} POD basis cannot feed {}",
                pod.basis_config(),
                parts.output_handling.kind()
            )));
        }
        parts.branch.set_trainable(true);
        info!(
            n_modes = pod.n_modes(),
            n_sets = pod.n_sets(),
            "POD training: trunk fixed to POD basis"
        );
        Ok(())
    }

    pub(crate) fn forward(&self, parts: &ModelParts, xb: Option<&Tensor>) -> Result<Vec<Tensor>> {
        let pod = parts.trunk.as_pod().ok_or_else(|| {
            DeepOnetError::config("POD forward pass needs a POD trunk")
        })?;
        let branch_out = parts.branch.forward(xb)?;
        let fused = parts
            .output_handling
            .forward(&branch_out, Some(pod.basis()))?;
        pod.add_mean(fused)
    }

    pub(crate) fn compute_loss(&self, outputs: &[Tensor], batch: &DeepOnetBatch) -> Result<Tensor> {
        let targets = self.objective.targets(batch)?;
        self.objective.loss(&targets, outputs)
    }

    pub(crate) fn compute_errors(
        &self,
        outputs: &[Tensor],
        batch: &DeepOnetBatch,
    ) -> Result<HashMap<String, f64>> {
        let targets = self.objective.targets(batch)?;
        self.objective.errors(&targets, outputs)
    }
}
