//! Proper orthogonal decomposition (POD) basis from output data.
//!
//! Each output's data matrix `(n_samples, n_points)` is centered by its mean
//! over samples, transposed, and factored with a thin SVD. The leading left
//! singular vectors become the trunk basis; the number kept is chosen so the
//! retained modes explain at least `var_share` of the variance.

use candle_core::Tensor;
use nalgebra::DMatrix;
use tracing::info;

use crate::error::{DeepOnetError, Result};
use crate::linalg;
use crate::output_handling::BasisConfig;

/// Number of modes needed to reach `var_share` of the total energy `Σσ²`.
///
/// Counts the cumulative energy ratios strictly below `var_share` and adds
/// one, capped at the number of singular values.
///
/// ```rust
/// use deeponet_rs::pod::retained_modes;
///
/// // Ratios 0.990, 0.9999, 1.0.
/// assert_eq!(retained_modes(&[10.0, 1.0, 0.1], 0.95), 1);
/// assert_eq!(retained_modes(&[10.0, 1.0, 0.1], 0.995), 2);
/// ```
#[must_use]
pub fn retained_modes(singular_values: &[f64], var_share: f64) -> usize {
    if singular_values.is_empty() {
        return 0;
    }
    let total: f64 = singular_values.iter().map(|s| s * s).sum();
    if total <= 0.0 {
        return 1;
    }
    let mut cumulative = 0.0;
    let below = singular_values
        .iter()
        .filter(|s| {
            cumulative += *s * *s;
            cumulative / total < var_share
        })
        .count();
    (below + 1).min(singular_values.len())
}

/// A fixed POD basis and the mean field(s) removed before computing it.
#[derive(Debug, Clone)]
pub struct PodBasis {
    basis: Tensor,
    mean: Tensor,
    basis_config: BasisConfig,
    n_modes: usize,
}

impl PodBasis {
    /// Assemble a basis from precomputed tensors.
    ///
    /// `basis` is `(n_points, width)`. For [`BasisConfig::Single`] `mean` is
    /// `(1, n_points)` and `width` is the mode count. For
    /// [`BasisConfig::Multiple`] `mean` is `(n, n_points)` and `width` is
    /// `n` times the mode count.
    pub fn new(basis: Tensor, mean: Tensor, basis_config: BasisConfig) -> Result<Self> {
        let (n_points, width) = basis.dims2()?;
        let (n_means, mean_points) = mean.dims2()?;
        if mean_points != n_points {
            return Err(DeepOnetError::shape_mismatch(
                format!("mean with {n_points} points"),
                format!("{mean_points} points"),
            ));
        }
        let n_modes = match basis_config {
            BasisConfig::Single if n_means == 1 => width,
            BasisConfig::Multiple if n_means > 0 && width % n_means == 0 => width / n_means,
            _ => {
                return Err(DeepOnetError::shape_mismatch(
                    format!("{basis_config:?} basis consistent with its mean"),
                    format!("basis width {width}, {n_means} mean rows"),
                ))
            }
        };
        Ok(Self {
            basis,
            mean,
            basis_config,
            n_modes,
        })
    }

    /// Basis tensor `(n_points, width)`.
    #[must_use]
    pub const fn basis(&self) -> &Tensor {
        &self.basis
    }

    /// Mean field(s), one row per basis set.
    #[must_use]
    pub const fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Single or per-output basis.
    #[must_use]
    pub const fn basis_config(&self) -> BasisConfig {
        self.basis_config
    }

    /// Modes per basis set.
    #[must_use]
    pub const fn n_modes(&self) -> usize {
        self.n_modes
    }

    /// Number of basis sets.
    #[must_use]
    pub fn n_sets(&self) -> usize {
        match self.basis_config {
            BasisConfig::Single => 1,
            BasisConfig::Multiple => self.width() / self.n_modes.max(1),
        }
    }

    /// Total basis width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.basis.dims().get(1).copied().unwrap_or(0)
    }

    /// Add the mean field back to fused outputs.
    ///
    /// Single: the shared mean is added to every output. Multiple: mean row
    /// `i` is added to output `i`.
    pub fn add_mean(&self, outputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let mut shifted = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.into_iter().enumerate() {
            let mean = match self.basis_config {
                BasisConfig::Single => self.mean.clone(),
                BasisConfig::Multiple => self.mean.narrow(0, i, 1)?,
            };
            shifted.push(output.broadcast_add(&mean)?);
        }
        Ok(shifted)
    }
}

/// Computes [`PodBasis`] values from data.
#[derive(Debug, Clone, Copy)]
pub struct PodBasisHelper {
    var_share: f64,
}

impl Default for PodBasisHelper {
    fn default() -> Self {
        Self { var_share: 0.95 }
    }
}

struct ModeSet {
    u: DMatrix<f64>,
    mean: DMatrix<f64>,
    retained: usize,
}

impl PodBasisHelper {
    /// Helper retaining `var_share` of the variance.
    ///
    /// # Errors
    ///
    /// `var_share` must lie in `(0, 1]`.
    pub fn new(var_share: f64) -> Result<Self> {
        if !(var_share > 0.0 && var_share <= 1.0) {
            return Err(DeepOnetError::config(format!(
                "var_share must be in (0, 1], got {var_share}"
            )));
        }
        Ok(Self { var_share })
    }

    /// Variance share threshold.
    #[must_use]
    pub const fn var_share(&self) -> f64 {
        self.var_share
    }

    /// Compute a basis from one data matrix per output, each `(n_samples, n_points)`.
    ///
    /// [`BasisConfig::Single`] stacks all samples into one basis;
    /// [`BasisConfig::Multiple`] builds one basis per output and keeps the
    /// largest retained count for all of them.
    pub fn compute(&self, data: &[Tensor], basis_config: BasisConfig) -> Result<PodBasis> {
        let first = data
            .first()
            .ok_or_else(|| DeepOnetError::config("POD needs at least one data matrix"))?;
        let (dtype, device) = (first.dtype(), first.device().clone());
        let n_points = first.dims2()?.1;
        for d in data {
            let (_, points) = d.dims2()?;
            if points != n_points {
                return Err(DeepOnetError::shape_mismatch(
                    format!("{n_points} points in every data matrix"),
                    format!("{points}"),
                ));
            }
        }

        let (basis, mean) = match basis_config {
            BasisConfig::Single => {
                let stacked = Tensor::cat(data, 0)?;
                let modes = self.modes(&linalg::tensor_to_dmatrix(&stacked)?)?;
                info!(
                    retained = modes.retained,
                    var_share = self.var_share,
                    "computed single POD basis"
                );
                let basis = modes.u.columns(0, modes.retained).into_owned();
                (basis, modes.mean)
            }
            BasisConfig::Multiple => {
                let sets = data
                    .iter()
                    .map(|d| self.modes(&linalg::tensor_to_dmatrix(d)?))
                    .collect::<Result<Vec<_>>>()?;
                let k = sets.iter().map(|s| s.retained).max().unwrap_or(1);
                let mut basis = DMatrix::<f64>::zeros(n_points, k * sets.len());
                let mut mean = DMatrix::<f64>::zeros(sets.len(), n_points);
                for (i, set) in sets.iter().enumerate() {
                    if set.u.ncols() < k {
                        return Err(DeepOnetError::decomposition(format!(
                            "output {i} has rank {} but {k} modes are required",
                            set.u.ncols()
                        )));
                    }
                    basis
                        .columns_mut(i * k, k)
                        .copy_from(&set.u.columns(0, k));
                    mean.row_mut(i).copy_from(&set.mean.row(0));
                }
                info!(
                    retained = k,
                    per_output = ?sets.iter().map(|s| s.retained).collect::<Vec<_>>(),
                    var_share = self.var_share,
                    "computed per-output POD bases"
                );
                (basis, mean)
            }
        };

        PodBasis::new(
            linalg::dmatrix_to_tensor(&basis, dtype, &device)?,
            linalg::dmatrix_to_tensor(&mean, dtype, &device)?,
            basis_config,
        )
    }

    fn modes(&self, data: &DMatrix<f64>) -> Result<ModeSet> {
        let (n_samples, n_points) = data.shape();
        if n_samples == 0 {
            return Err(DeepOnetError::config("POD data matrix has no samples"));
        }
        let mean = DMatrix::from_fn(1, n_points, |_, j| data.column(j).mean());
        let centered_t = DMatrix::from_fn(n_points, n_samples, |i, j| data[(j, i)] - mean[(0, i)]);

        let svd = centered_t.svd(true, false);
        let u = svd
            .u
            .ok_or_else(|| DeepOnetError::decomposition("SVD did not produce U"))?;

        // Order modes by decreasing singular value.
        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
        let sigma: Vec<f64> = order.iter().map(|&i| svd.singular_values[i]).collect();
        let u = u.select_columns(order.iter());

        Ok(ModeSet {
            retained: retained_modes(&sigma, self.var_share),
            u,
            mean,
        })
    }
}
