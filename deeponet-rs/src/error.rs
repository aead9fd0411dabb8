//! Error types for deeponet-rs.
//!
//! Every error in this crate is fatal at the point it is raised. Degenerate
//! numerical cases (a target with zero norm) are not errors: they surface as
//! `f64::INFINITY` in the error dictionaries instead.
//!
//! # Example
//!
//! ```rust
//! use deeponet_rs::{DeepOnetConfig, DeepOnetError};
//! use deeponet_rs::config::TrainingStrategyKind;
//! use deeponet_rs::output_handling::OutputHandlingKind;
//!
//! let config = DeepOnetConfig::default()
//!     .with_output_handling(OutputHandlingKind::ShareBranch)
//!     .with_training_strategy(TrainingStrategyKind::TwoStep);
//!
//! match config.validate() {
//!     Err(DeepOnetError::IncompatibleStrategies { .. }) => {}
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for deeponet-rs operations.
pub type Result<T> = std::result::Result<T, DeepOnetError>;

/// Errors that can occur while building or training a DeepONet.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeepOnetError {
    /// Invalid configuration value or component wiring.
    #[error("configuration error: {0}")]
    Config(String),

    /// The chosen output handling cannot be combined with the training strategy.
    #[error("{output_handling} is incompatible with {training_strategy}; choose a different output handling or training strategy")]
    IncompatibleStrategies {
        /// Output handling variant name.
        output_handling: String,
        /// Training strategy variant name.
        training_strategy: String,
    },

    /// Tensor shape does not satisfy the output handling contract.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// What the contract requires.
        expected: String,
        /// What was supplied.
        got: String,
    },

    /// Branch phase requested before the decomposition produced R.
    #[error("basis-change matrix R is not available; run the trunk decomposition before {operation}")]
    MissingBasisChange {
        /// The operation that needed R.
        operation: String,
    },

    /// The two-step phase machine rejected a transition.
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidPhaseTransition {
        /// Current phase.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// A declared output key has no target tensor in the batch.
    #[error("batch has no target for output key '{0}'")]
    MissingTarget(String),

    /// A required batch input is absent.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Decomposition (QR/SVD) failed or received a degenerate matrix.
    #[error("decomposition error: {0}")]
    Decomposition(String),

    /// Training loop failure.
    #[error("training error: {0}")]
    Training(String),

    /// Tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for DeepOnetError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

impl DeepOnetError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a missing basis-change error for `operation`.
    pub fn missing_basis_change(operation: impl Into<String>) -> Self {
        Self::MissingBasisChange {
            operation: operation.into(),
        }
    }

    /// Create a decomposition error.
    pub fn decomposition(msg: impl Into<String>) -> Self {
        Self::Decomposition(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Whether this error is a construction-time configuration failure.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::IncompatibleStrategies { .. } | Self::ConfigParse(_)
        )
    }
}
