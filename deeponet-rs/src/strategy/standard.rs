use std::collections::HashMap;

use candle_core::Tensor;
use tracing::info;

use crate::batch::DeepOnetBatch;
use crate::error::Result;
use crate::loss::Objective;
use crate::model::ModelParts;

/// Single-phase joint training of branch and trunk.
#[derive(Debug, Clone)]
pub struct StandardTraining {
    objective: Objective,
}

impl StandardTraining {
    /// Strategy measuring against `objective`.
    #[must_use]
    pub fn new(objective: Objective) -> Self {
        Self { objective }
    }

    pub(crate) const fn objective(&self) -> &Objective {
        &self.objective
    }

    pub(crate) fn prepare_training(&mut self, parts: &mut ModelParts) -> Result<()> {
        parts.branch.set_trainable(true);
        parts.trunk.set_trainable(true);
        info!(
            branch = parts.branch.kind_name(),
            trunk = parts.trunk.kind_name(),
            "standard training: branch and trunk trainable"
        );
        Ok(())
    }

    pub(crate) fn forward(
        &self,
        parts: &ModelParts,
        xb: Option<&Tensor>,
        xt: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        let branch_out = parts.branch.forward(xb)?;
        let trunk_out = parts.trunk.forward(xt)?;
        parts.output_handling.forward(&branch_out, Some(&trunk_out))
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
