//! Named tensors handed to the strategies, plus trunk-input preprocessing.

use std::collections::HashMap;
use std::f64::consts::PI;

use candle_core::Tensor;

use crate::error::{DeepOnetError, Result};

/// One full batch: branch input, trunk input and a target per output key.
///
/// `xb` is `(batch, n_sensors)`, `xt` is `(n_points, n_coords)`, each target
/// is `(batch, n_points)`. Either input may be absent when the active
/// strategy does not need it (a POD trunk ignores `xt`).
#[derive(Debug, Clone, Default)]
pub struct DeepOnetBatch {
    /// Branch input.
    pub xb: Option<Tensor>,
    /// Trunk input.
    pub xt: Option<Tensor>,
    /// Targets keyed by output name.
    pub targets: HashMap<String, Tensor>,
}

impl DeepOnetBatch {
    /// Batch with inputs and no targets.
    #[must_use]
    pub fn new(xb: Option<Tensor>, xt: Option<Tensor>) -> Self {
        Self {
            xb,
            xt,
            targets: HashMap::new(),
        }
    }

    /// Add a target.
    #[must_use]
    pub fn with_target(mut self, key: impl Into<String>, target: Tensor) -> Self {
        self.targets.insert(key.into(), target);
        self
    }

    /// Target for `key`.
    pub fn target(&self, key: &str) -> Result<&Tensor> {
        self.targets
            .get(key)
            .ok_or_else(|| DeepOnetError::MissingTarget(key.to_string()))
    }

    /// Branch input, required.
    pub fn branch_input(&self) -> Result<&Tensor> {
        self.xb
            .as_ref()
            .ok_or_else(|| DeepOnetError::MissingInput("branch input xb".into()))
    }

    /// Trunk input, required.
    pub fn trunk_input(&self) -> Result<&Tensor> {
        self.xt
            .as_ref()
            .ok_or_else(|| DeepOnetError::MissingInput("trunk input xt".into()))
    }

    /// Number of branch samples, if the branch input is present.
    pub fn batch_size(&self) -> Result<Option<usize>> {
        match &self.xb {
            Some(xb) => Ok(Some(xb.dims2()?.0)),
            None => Ok(None),
        }
    }
}

/// Append `sin(kπx)` and `cos(kπx)` for `k = 1..=harmonics` to every coordinate.
///
/// `(n_points, d) → (n_points, d·(1 + 2·harmonics))`; zero harmonics returns the input.
pub fn expand_trunk_features(xt: &Tensor, harmonics: usize) -> Result<Tensor> {
    if harmonics == 0 {
        return Ok(xt.clone());
    }
    let mut features = Vec::with_capacity(1 + 2 * harmonics);
    features.push(xt.clone());
    for k in 1..=harmonics {
        let scaled = xt.affine(k as f64 * PI, 0.0)?;
        features.push(scaled.sin()?);
        features.push(scaled.cos()?);
    }
    Ok(Tensor::cat(&features, 1)?)
}
