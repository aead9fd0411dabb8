//! Loss functions and the per-output objective shared by all strategies.

use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::batch::DeepOnetBatch;
use crate::error::{DeepOnetError, Result};
use crate::linalg;

/// Training loss over a set of output channels.
///
/// The per-channel losses are averaged, so adding an output does not change
/// the loss scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossFunction {
    /// Mean squared error.
    #[default]
    Mse,
    /// Mean absolute error.
    Mae,
    /// Root mean squared error.
    Rmse,
}

impl LossFunction {
    /// Scalar loss between `targets` and `outputs`, paired by position.
    pub fn compute(self, targets: &[Tensor], outputs: &[Tensor]) -> Result<Tensor> {
        if targets.len() != outputs.len() || targets.is_empty() {
            return Err(DeepOnetError::shape_mismatch(
                format!("{} outputs", targets.len()),
                format!("{} outputs", outputs.len()),
            ));
        }

        let mut total: Option<Tensor> = None;
        for (target, output) in targets.iter().zip(outputs) {
            if target.dims() != output.dims() {
                return Err(DeepOnetError::shape_mismatch(
                    format!("{:?}", target.dims()),
                    format!("{:?}", output.dims()),
                ));
            }
            let diff = output.sub(target)?;
            let channel = match self {
                Self::Mse => diff.sqr()?.mean_all()?,
                Self::Mae => diff.abs()?.mean_all()?,
                Self::Rmse => diff.sqr()?.mean_all()?.sqrt()?,
            };
            total = Some(match total {
                Some(acc) => (acc + channel)?,
                None => channel,
            });
        }

        // Non-empty checked above.
        let total = total.ok_or_else(|| DeepOnetError::training("no output channels"))?;
        Ok((total / targets.len() as f64)?)
    }
}

/// Loss, ordered output keys and error norm: what every strategy measures against.
#[derive(Debug, Clone)]
pub struct Objective {
    loss: LossFunction,
    output_keys: Vec<String>,
    error_norm: f64,
}

impl Objective {
    /// Create an objective over `output_keys` in order.
    pub fn new(loss: LossFunction, output_keys: Vec<String>, error_norm: f64) -> Self {
        Self {
            loss,
            output_keys,
            error_norm,
        }
    }

    /// The loss function.
    #[must_use]
    pub const fn loss_function(&self) -> LossFunction {
        self.loss
    }

    /// Ordered target keys.
    #[must_use]
    pub fn output_keys(&self) -> &[String] {
        &self.output_keys
    }

    /// Norm order for relative errors.
    #[must_use]
    pub const fn error_norm(&self) -> f64 {
        self.error_norm
    }

    /// Targets in `output_keys` order.
    ///
    /// # Errors
    ///
    /// [`DeepOnetError::MissingTarget`] for the first key absent from the batch.
    pub fn targets(&self, batch: &DeepOnetBatch) -> Result<Vec<Tensor>> {
        self.output_keys
            .iter()
            .map(|key| batch.target(key).cloned())
            .collect()
    }

    /// Scalar loss of `outputs` against `targets`.
    pub fn loss(&self, targets: &[Tensor], outputs: &[Tensor]) -> Result<Tensor> {
        self.loss.compute(targets, outputs)
    }

    /// Relative error per output key.
    ///
    /// A target with zero norm reports `f64::INFINITY`.
    pub fn errors(&self, targets: &[Tensor], outputs: &[Tensor]) -> Result<HashMap<String, f64>> {
        if targets.len() != self.output_keys.len() || outputs.len() != self.output_keys.len() {
            return Err(DeepOnetError::shape_mismatch(
                format!("{} outputs", self.output_keys.len()),
                format!("{} targets and {} outputs", targets.len(), outputs.len()),
            ));
        }
        let mut errors = HashMap::with_capacity(self.output_keys.len());
        for ((key, target), output) in self.output_keys.iter().zip(targets).zip(outputs) {
            let err = linalg::relative_error(target, output, self.error_norm)?;
            errors.insert(key.clone(), err);
        }
        Ok(errors)
    }
}
