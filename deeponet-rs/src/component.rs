//! Branch and trunk slots.

use candle_core::{Tensor, Var};

use crate::error::{DeepOnetError, Result};
use crate::network::Mlp;
use crate::pod::PodBasis;

/// What occupies a branch or trunk slot.
///
/// A slot starts as a trainable network. Two-step training swaps the trunk
/// for a frozen tensor once the decomposition has run, and POD training uses
/// a fixed basis from the start.
#[derive(Debug)]
pub enum Component {
    /// Trainable (or frozen) network.
    Network(Mlp),
    /// Frozen tensor returned as-is; the input is ignored.
    Fixed(Tensor),
    /// Fixed POD basis with its mean field; the input is ignored.
    Pod(PodBasis),
}

impl Component {
    /// Evaluate the slot.
    ///
    /// # Errors
    ///
    /// A network slot without input returns [`DeepOnetError::MissingInput`].
    pub fn forward(&self, x: Option<&Tensor>) -> Result<Tensor> {
        match self {
            Self::Network(mlp) => {
                let x = x.ok_or_else(|| {
                    DeepOnetError::MissingInput("network component needs an input".into())
                })?;
                mlp.forward(x)
            }
            Self::Fixed(t) => Ok(t.clone()),
            Self::Pod(pod) => Ok(pod.basis().clone()),
        }
    }

    /// Variables the optimizer should update.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            Self::Network(mlp) => mlp.trainable_vars(),
            Self::Fixed(_) | Self::Pod(_) => Vec::new(),
        }
    }

    /// Freeze or unfreeze. Fixed slots stay frozen.
    pub fn set_trainable(&mut self, trainable: bool) {
        if let Self::Network(mlp) = self {
            mlp.set_trainable(trainable);
        }
    }

    /// Whether the slot currently receives updates.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Network(mlp) if mlp.is_trainable())
    }

    /// Output width.
    #[must_use]
    pub fn output_size(&self) -> usize {
        match self {
            Self::Network(mlp) => mlp.output_size(),
            Self::Fixed(t) => t.dims().last().copied().unwrap_or(0),
            Self::Pod(pod) => pod.width(),
        }
    }

    /// The network, if this slot holds one.
    #[must_use]
    pub const fn as_network(&self) -> Option<&Mlp> {
        match self {
            Self::Network(mlp) => Some(mlp),
            _ => None,
        }
    }

    /// The POD basis, if this slot holds one.
    #[must_use]
    pub const fn as_pod(&self) -> Option<&PodBasis> {
        match self {
            Self::Pod(pod) => Some(pod),
            _ => None,
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Fixed(_) => "fixed",
            Self::Pod(_) => "pod",
        }
    }
}
