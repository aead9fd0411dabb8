//! Trunk decomposition for two-step training.
//!
//! The trunk output `T` of shape `(n_points, K·m)` is split into `m` blocks of
//! width K. Each block is factored as `T_j = Q_j R_j` with `Q_j` orthonormal
//! `(n_points, K)` and `R_j` square `(K, K)`. The orthonormal factors form the
//! trained trunk `[Q_1 … Q_m]`; the `R_j` form `R = blockdiag(R_1 … R_m)`.

use candle_core::Tensor;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DeepOnetError, Result};
use crate::linalg;

/// Factorization used per trunk block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecompositionKind {
    /// Thin QR.
    #[default]
    Qr,
    /// Thin SVD `U Σ Vᵀ` with `Q = U` and `R = Σ Vᵀ`.
    Svd,
}

/// Result of decomposing a trunk output.
#[derive(Debug, Clone)]
pub struct TrunkDecomposition {
    /// Orthonormal trained trunk `(n_points, K·m)`.
    pub trained_trunk: Tensor,
    /// Block-diagonal basis change `(K·m, K·m)`.
    pub r: Tensor,
}

/// Decomposes trunk outputs block by block.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecompositionHelper {
    kind: DecompositionKind,
}

impl DecompositionHelper {
    /// Helper using `kind`.
    #[must_use]
    pub const fn new(kind: DecompositionKind) -> Self {
        Self { kind }
    }

    /// Factorization in use.
    #[must_use]
    pub const fn kind(&self) -> DecompositionKind {
        self.kind
    }

    /// Decompose `trunk_output` into K-wide orthonormal blocks and `R`.
    ///
    /// # Errors
    ///
    /// [`DeepOnetError::Decomposition`] if the width is not a multiple of K or
    /// there are fewer points than K.
    pub fn decompose(&self, trunk_output: &Tensor, k: usize) -> Result<TrunkDecomposition> {
        let (n_points, width) = trunk_output.dims2()?;
        if k == 0 || width % k != 0 {
            return Err(DeepOnetError::decomposition(format!(
                "trunk width {width} is not a multiple of K = {k}"
            )));
        }
        if n_points < k {
            return Err(DeepOnetError::decomposition(format!(
                "need at least K = {k} trunk points, got {n_points}"
            )));
        }

        let dtype = trunk_output.dtype();
        let device = trunk_output.device();
        let n_blocks = width / k;
        let mut qs = Vec::with_capacity(n_blocks);
        let mut rs = Vec::with_capacity(n_blocks);
        for j in 0..n_blocks {
            let block = linalg::tensor_to_dmatrix(&trunk_output.narrow(1, j * k, k)?)?;
            let (q, r) = match self.kind {
                DecompositionKind::Qr => qr_factors(block),
                DecompositionKind::Svd => svd_factors(block)?,
            };
            qs.push(linalg::dmatrix_to_tensor(&q, dtype, device)?);
            rs.push(linalg::dmatrix_to_tensor(&r, dtype, device)?);
        }

        let trained_trunk = Tensor::cat(&qs, 1)?;
        let r = linalg::block_diag(&rs)?;
        info!(
            kind = ?self.kind,
            n_blocks,
            trained_trunk = ?trained_trunk.dims(),
            r = ?r.dims(),
            "decomposed trunk output"
        );
        Ok(TrunkDecomposition { trained_trunk, r })
    }
}

fn qr_factors(block: DMatrix<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
    let qr = block.qr();
    (qr.q(), qr.r())
}

fn svd_factors(block: DMatrix<f64>) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    let svd = block.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| DeepOnetError::decomposition("SVD did not produce U"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| DeepOnetError::decomposition("SVD did not produce Vᵀ"))?;
    debug!(singular_values = ?svd.singular_values.as_slice(), "trunk block SVD");
    let r = DMatrix::from_diagonal(&svd.singular_values) * v_t;
    Ok((u, r))
}
