//! Output handling: how branch and trunk tensors are fused into output channels.
//!
//! All variants share one contract. Given a branch tensor `B` of shape
//! `(batch, branch_width)` and a trunk tensor `T` of shape
//! `(n_points, trunk_width)`, produce exactly `n_outputs` tensors of shape
//! `(batch, n_points)`. When no trunk tensor is supplied a variant-specific
//! identity default stands in, so the outputs become the branch coefficients.
//!
//! | Variant | Branch width | Trunk width | Output `i` |
//! |---|---|---|---|
//! | `ShareTrunk` | `K·n` | `K` | `B_i · Tᵀ` |
//! | `SplitNetworks` | `K·n` | `K·n` | `B_i · T_iᵀ` |
//! | `ShareBranch` | `K` | `K·n` | `B · T_iᵀ` |

use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrainingStrategyKind;
use crate::error::{DeepOnetError, Result};
use crate::linalg;
use crate::pod::PodBasis;

/// Selects the output handling variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputHandlingKind {
    /// One trunk basis shared by every output; the branch emits `n` coefficient blocks.
    #[default]
    ShareTrunk,
    /// One basis block and one coefficient block per output.
    SplitNetworks,
    /// One coefficient block shared by every output; the trunk emits `n` basis blocks.
    ShareBranch,
}

impl fmt::Display for OutputHandlingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShareTrunk => write!(f, "share_trunk"),
            Self::SplitNetworks => write!(f, "split_networks"),
            Self::ShareBranch => write!(f, "share_branch"),
        }
    }
}

/// Number of basis sets a variant expects from a precomputed basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasisConfig {
    /// A single basis shared by all outputs.
    Single,
    /// One basis per output.
    Multiple,
}

impl OutputHandlingKind {
    /// Basis layout this variant consumes.
    #[must_use]
    pub const fn basis_config(self) -> BasisConfig {
        match self {
            Self::ShareTrunk => BasisConfig::Single,
            Self::SplitNetworks | Self::ShareBranch => BasisConfig::Multiple,
        }
    }

    /// Reject variant/strategy pairs that cannot work together.
    ///
    /// # Errors
    ///
    /// `ShareBranch` with two-step training returns
    /// [`DeepOnetError::IncompatibleStrategies`]: the decomposition needs one
    /// coefficient block per trunk block.
    pub fn check_compatibility(self, strategy: TrainingStrategyKind) -> Result<()> {
        if self == Self::ShareBranch && strategy == TrainingStrategyKind::TwoStep {
            return Err(DeepOnetError::IncompatibleStrategies {
                output_handling: self.to_string(),
                training_strategy: strategy.to_string(),
            });
        }
        Ok(())
    }

    /// Tag used in generated run names.
    #[must_use]
    pub const fn name_tag(self) -> &'static str {
        match self {
            Self::ShareTrunk => "singlebasis",
            Self::SplitNetworks => "splitbasis",
            Self::ShareBranch => "sharedbranch",
        }
    }
}

/// Widths chosen by [`OutputHandling::configure`], fixed for the model lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLayout {
    /// Branch network output width.
    pub branch_output_size: usize,
    /// Trunk network output width.
    pub trunk_output_size: usize,
    /// Number of K-wide blocks in the branch output.
    pub n_branch_outputs: usize,
    /// Number of K-wide blocks in the trunk output.
    pub n_trunk_outputs: usize,
}

/// A configured output handling: variant, basis count and recorded layout.
#[derive(Debug, Clone)]
pub struct OutputHandling {
    kind: OutputHandlingKind,
    n_basis_functions: usize,
    n_outputs: usize,
    layout: OutputLayout,
}

impl OutputHandling {
    /// Configure a variant for `n_outputs` channels with `n_basis_functions` basis functions.
    ///
    /// When `pod_basis` is given, `n_basis_functions` is redefined from its
    /// width: the full width for `ShareTrunk` (which requires a single basis
    /// set), or the per-set mode count for the multi-basis variants, which
    /// need one basis set per output.
    ///
    /// # Errors
    ///
    /// - [`DeepOnetError::IncompatibleStrategies`] for `ShareBranch` with two-step training.
    /// - [`DeepOnetError::ShapeMismatch`] when the POD basis does not fit the variant.
    /// - [`DeepOnetError::Config`] when `n_basis_functions` or `n_outputs` is zero.
    pub fn configure(
        kind: OutputHandlingKind,
        strategy: TrainingStrategyKind,
        n_basis_functions: usize,
        n_outputs: usize,
        pod_basis: Option<&PodBasis>,
    ) -> Result<Self> {
        kind.check_compatibility(strategy)?;
        if n_outputs == 0 {
            return Err(DeepOnetError::config("n_outputs must be at least 1"));
        }

        let k = match pod_basis {
            None => n_basis_functions,
            Some(basis) => {
                let width = basis.width();
                match kind.basis_config() {
                    BasisConfig::Single => {
                        if basis.n_sets() != 1 {
                            return Err(DeepOnetError::shape_mismatch(
                                format!("a single POD basis set for {kind}"),
                                format!("{} basis sets", basis.n_sets()),
                            ));
                        }
                        width
                    }
                    BasisConfig::Multiple => {
                        if basis.n_sets() != n_outputs || width % n_outputs != 0 {
                            return Err(DeepOnetError::shape_mismatch(
                                format!("{n_outputs} POD basis sets for {kind}"),
                                format!(
                                    "{} sets of {} modes, width {width}",
                                    basis.n_sets(),
                                    basis.n_modes()
                                ),
                            ));
                        }
                        basis.n_modes()
                    }
                }
            }
        };
        if k == 0 {
            return Err(DeepOnetError::config("n_basis_functions must be positive"));
        }
        if k != n_basis_functions {
            debug!(
                from = n_basis_functions,
                to = k,
                "n_basis_functions redefined from POD basis"
            );
        }

        let (branch_output_size, trunk_output_size) = match kind {
            OutputHandlingKind::ShareTrunk => (k * n_outputs, k),
            OutputHandlingKind::SplitNetworks => (k * n_outputs, k * n_outputs),
            OutputHandlingKind::ShareBranch => (k, k * n_outputs),
        };
        let layout = OutputLayout {
            branch_output_size,
            trunk_output_size,
            n_branch_outputs: branch_output_size / k,
            n_trunk_outputs: trunk_output_size / k,
        };
        debug!(
            %kind,
            n_basis_functions = k,
            branch_output_size,
            trunk_output_size,
            n_branch_outputs = layout.n_branch_outputs,
            n_trunk_outputs = layout.n_trunk_outputs,
            "configured output handling"
        );

        Ok(Self {
            kind,
            n_basis_functions: k,
            n_outputs,
            layout,
        })
    }

    /// The variant.
    #[must_use]
    pub const fn kind(&self) -> OutputHandlingKind {
        self.kind
    }

    /// K, possibly redefined by a POD basis.
    #[must_use]
    pub const fn n_basis_functions(&self) -> usize {
        self.n_basis_functions
    }

    /// Number of output channels.
    #[must_use]
    pub const fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Recorded widths.
    #[must_use]
    pub const fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Trunk tensor used when no trunk is supplied.
    ///
    /// `I_K` for `ShareTrunk`, `n` side-by-side copies of `I_K` otherwise.
    pub fn default_trunk(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let k = self.n_basis_functions;
        match self.kind {
            OutputHandlingKind::ShareTrunk => linalg::identity(k, dtype, device),
            OutputHandlingKind::SplitNetworks | OutputHandlingKind::ShareBranch => {
                linalg::tiled_identity(k, self.n_outputs, dtype, device)
            }
        }
    }

    /// Fuse branch and trunk tensors into `n_outputs` tensors of shape `(batch, n_points)`.
    ///
    /// # Errors
    ///
    /// Returns [`DeepOnetError::ShapeMismatch`] if either width disagrees with
    /// the variant's contract.
    pub fn forward(&self, branch: &Tensor, trunk: Option<&Tensor>) -> Result<Vec<Tensor>> {
        let k = self.n_basis_functions;
        let n = self.n_outputs;

        let default;
        let trunk = match trunk {
            Some(t) => t,
            None => {
                default = self.default_trunk(branch.dtype(), branch.device())?;
                &default
            }
        };

        let (_, branch_width) = branch.dims2()?;
        let (_, trunk_width) = trunk.dims2()?;
        let (expected_branch, expected_trunk) = match self.kind {
            OutputHandlingKind::ShareTrunk => (k * n, k),
            OutputHandlingKind::SplitNetworks => (k * n, k * n),
            OutputHandlingKind::ShareBranch => (k, k * n),
        };
        if branch_width != expected_branch || trunk_width != expected_trunk {
            return Err(DeepOnetError::shape_mismatch(
                format!(
                    "{} branch width {expected_branch} and trunk width {expected_trunk}",
                    self.kind
                ),
                format!("branch width {branch_width}, trunk width {trunk_width}"),
            ));
        }

        let mut outputs = Vec::with_capacity(n);
        for i in 0..n {
            let (b, t) = match self.kind {
                OutputHandlingKind::ShareTrunk => (block(branch, i, k)?, trunk.clone()),
                OutputHandlingKind::SplitNetworks => (block(branch, i, k)?, block(trunk, i, k)?),
                OutputHandlingKind::ShareBranch => (branch.clone(), block(trunk, i, k)?),
            };
            outputs.push(b.matmul(&t.t()?.contiguous()?)?);
        }
        Ok(outputs)
    }
}

/// Column block `i` of width `k`.
fn block(t: &Tensor, i: usize, k: usize) -> Result<Tensor> {
    Ok(t.narrow(1, i * k, k)?.contiguous()?)
}
