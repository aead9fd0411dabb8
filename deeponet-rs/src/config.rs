//! Configuration parsing and validation.

use std::fmt;
use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::decomposition::DecompositionKind;
use crate::error::{DeepOnetError, Result};
use crate::loss::LossFunction;
use crate::network::Activation;
use crate::output_handling::OutputHandlingKind;

/// Selects the training strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStrategyKind {
    /// Branch and trunk trained jointly in a single phase.
    #[default]
    Standard,
    /// Trunk phase, decomposition, then branch phase.
    TwoStep,
    /// Trunk fixed to a POD basis computed from data.
    Pod,
}

impl fmt::Display for TrainingStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::TwoStep => write!(f, "two_step"),
            Self::Pod => write!(f, "pod"),
        }
    }
}

/// Optimizer type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with decoupled weight decay.
    #[default]
    AdamW,
    /// Plain stochastic gradient descent.
    Sgd,
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduler {
    /// Constant learning rate.
    #[default]
    Constant,
    /// Multiply by `LR_GAMMA` every `LR_STEP_SIZE` epochs.
    StepDecay,
    /// Cosine annealing down to `MIN_LEARNING_RATE`.
    Cosine,
}

/// Floating point precision of all tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floats.
    #[default]
    Float32,
    /// 64-bit floats.
    Float64,
}

impl Precision {
    /// Matching candle dtype.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::Float32 => DType::F32,
            Self::Float64 => DType::F64,
        }
    }
}

/// Main configuration for a DeepONet run.
///
/// Keys are `SCREAMING_SNAKE_CASE` in YAML and every key is optional.
///
/// # Example
///
/// ```rust
/// use deeponet_rs::DeepOnetConfig;
/// use deeponet_rs::config::TrainingStrategyKind;
///
/// let config: DeepOnetConfig = serde_yaml::from_str(
///     "BASIS_FUNCTIONS: 8\nTRAINING_STRATEGY: two_step\nERROR_NORM: .inf\n",
/// )
/// .unwrap();
/// assert_eq!(config.basis_functions, 8);
/// assert_eq!(config.training_strategy, TrainingStrategyKind::TwoStep);
/// assert!(config.error_norm.is_infinite());
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeepOnetConfig {
    /// Problem name, used in run names.
    #[serde(default = "default_problem")]
    pub problem: String,

    /// Ordered names of the target fields; one output channel each.
    #[serde(default = "default_output_keys")]
    pub output_keys: Vec<String>,

    /// Norm order for relative errors (`.inf` for the max norm).
    #[serde(default = "default_error_norm")]
    pub error_norm: f64,

    /// Number of basis functions K.
    #[serde(default = "default_basis_functions")]
    pub basis_functions: usize,

    /// Output handling variant.
    #[serde(default)]
    pub output_handling: OutputHandlingKind,

    /// Training strategy.
    #[serde(default)]
    pub training_strategy: TrainingStrategyKind,

    /// Branch input and hidden sizes; the output width is appended.
    #[serde(default = "default_branch_layers")]
    pub branch_layers: Vec<usize>,

    /// Trunk input and hidden sizes; the output width is appended.
    #[serde(default = "default_trunk_layers")]
    pub trunk_layers: Vec<usize>,

    /// Hidden activation for both networks.
    #[serde(default)]
    pub activation: Activation,

    /// Training loss.
    #[serde(default)]
    pub loss_function: LossFunction,

    /// Optimizer.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Weight decay (AdamW only).
    #[serde(default)]
    pub weight_decay: f64,

    /// Learning rate scheduler.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Epoch interval for step decay.
    #[serde(default = "default_lr_step_size")]
    pub lr_step_size: usize,

    /// Multiplicative factor for step decay.
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: f64,

    /// Floor of the cosine schedule.
    #[serde(default)]
    pub min_learning_rate: f64,

    /// Epochs for single-phase strategies.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Trunk-phase epochs (two-step).
    #[serde(default = "default_epochs")]
    pub trunk_train_epochs: usize,

    /// Branch-phase epochs (two-step).
    #[serde(default = "default_epochs")]
    pub branch_train_epochs: usize,

    /// Trunk decomposition (two-step).
    #[serde(default)]
    pub decomposition: DecompositionKind,

    /// Variance share retained by the POD basis.
    #[serde(default = "default_var_share")]
    pub var_share: f64,

    /// Tensor precision.
    #[serde(default)]
    pub precision: Precision,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Log every N epochs.
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    /// Number of sin/cos harmonics appended to trunk inputs.
    #[serde(default)]
    pub trunk_feature_expansion: usize,
}

fn default_problem() -> String {
    "kelvin".into()
}
fn default_output_keys() -> Vec<String> {
    vec!["g_u_real".into(), "g_u_imag".into()]
}
fn default_error_norm() -> f64 {
    2.0
}
fn default_basis_functions() -> usize {
    32
}
fn default_branch_layers() -> Vec<usize> {
    vec![1, 64, 64]
}
fn default_trunk_layers() -> Vec<usize> {
    vec![2, 64, 64]
}
fn default_lr() -> f64 {
    1e-3
}
fn default_lr_step_size() -> usize {
    100
}
fn default_lr_gamma() -> f64 {
    0.5
}
fn default_epochs() -> usize {
    1000
}
fn default_var_share() -> f64 {
    0.95
}
fn default_seed() -> u64 {
    42
}
fn default_log_every() -> usize {
    100
}

impl Default for DeepOnetConfig {
    fn default() -> Self {
        Self {
            problem: default_problem(),
            output_keys: default_output_keys(),
            error_norm: default_error_norm(),
            basis_functions: default_basis_functions(),
            output_handling: OutputHandlingKind::default(),
            training_strategy: TrainingStrategyKind::default(),
            branch_layers: default_branch_layers(),
            trunk_layers: default_trunk_layers(),
            activation: Activation::default(),
            loss_function: LossFunction::default(),
            optimizer: OptimizerKind::default(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            lr_scheduler: LrScheduler::default(),
            lr_step_size: default_lr_step_size(),
            lr_gamma: default_lr_gamma(),
            min_learning_rate: 0.0,
            epochs: default_epochs(),
            trunk_train_epochs: default_epochs(),
            branch_train_epochs: default_epochs(),
            decomposition: DecompositionKind::default(),
            var_share: default_var_share(),
            precision: Precision::default(),
            seed: default_seed(),
            log_every: default_log_every(),
            trunk_feature_expansion: 0,
        }
    }
}

impl DeepOnetConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Checks value ranges and the output handling / training strategy pairing.
    pub fn validate(&self) -> Result<()> {
        self.output_handling
            .check_compatibility(self.training_strategy)?;

        if self.output_keys.is_empty() {
            return Err(DeepOnetError::config("OUTPUT_KEYS must not be empty"));
        }
        for (i, key) in self.output_keys.iter().enumerate() {
            if self.output_keys[..i].contains(key) {
                return Err(DeepOnetError::config(format!(
                    "OUTPUT_KEYS contains '{key}' twice"
                )));
            }
        }
        if self.basis_functions == 0 {
            return Err(DeepOnetError::config("BASIS_FUNCTIONS must be > 0"));
        }
        if self.error_norm.is_nan() || self.error_norm <= 0.0 {
            return Err(DeepOnetError::config(format!(
                "ERROR_NORM must be positive or .inf, got {}",
                self.error_norm
            )));
        }
        if self.branch_layers.is_empty() || self.trunk_layers.is_empty() {
            return Err(DeepOnetError::config(
                "BRANCH_LAYERS and TRUNK_LAYERS need at least the input size",
            ));
        }
        if self.branch_layers.contains(&0) || self.trunk_layers.contains(&0) {
            return Err(DeepOnetError::config("layer sizes must be > 0"));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(DeepOnetError::config("LEARNING_RATE must be > 0"));
        }
        if self.weight_decay < 0.0 {
            return Err(DeepOnetError::config("WEIGHT_DECAY must be >= 0"));
        }
        if self.lr_scheduler == LrScheduler::StepDecay && self.lr_step_size == 0 {
            return Err(DeepOnetError::config("LR_STEP_SIZE must be > 0"));
        }
        if !(self.var_share > 0.0 && self.var_share <= 1.0) {
            return Err(DeepOnetError::config(format!(
                "VAR_SHARE must be in (0, 1], got {}",
                self.var_share
            )));
        }
        if self.log_every == 0 {
            return Err(DeepOnetError::config("LOG_EVERY must be > 0"));
        }

        Ok(())
    }

    /// Number of output channels.
    #[must_use]
    pub fn n_outputs(&self) -> usize {
        self.output_keys.len()
    }

    /// Candle dtype for all tensors.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// Descriptive run name, e.g. `DeepONet_kelvin_two_step_trunkexp_singlebasis`.
    #[must_use]
    pub fn model_name(&self) -> String {
        let mut name = String::from("DeepONet");
        let problem = self.problem.to_lowercase();
        if !problem.is_empty() {
            name.push('_');
            name.push_str(&problem);
        }
        name.push('_');
        name.push_str(&self.training_strategy.to_string());
        if self.trunk_feature_expansion > 0 {
            name.push_str("_trunkexp");
        }
        name.push('_');
        name.push_str(self.output_handling.name_tag());
        name
    }

    /// Set the output handling.
    #[must_use]
    pub fn with_output_handling(mut self, kind: OutputHandlingKind) -> Self {
        self.output_handling = kind;
        self
    }

    /// Set the training strategy.
    #[must_use]
    pub fn with_training_strategy(mut self, kind: TrainingStrategyKind) -> Self {
        self.training_strategy = kind;
        self
    }

    /// Set K.
    #[must_use]
    pub fn with_basis_functions(mut self, k: usize) -> Self {
        self.basis_functions = k;
        self
    }

    /// Set the output keys.
    #[must_use]
    pub fn with_output_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set branch and trunk layer sizes (output widths excluded).
    #[must_use]
    pub fn with_layers(mut self, branch: Vec<usize>, trunk: Vec<usize>) -> Self {
        self.branch_layers = branch;
        self.trunk_layers = trunk;
        self
    }

    /// Set the hidden activation.
    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Set optimizer and learning rate.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: OptimizerKind, learning_rate: f64) -> Self {
        self.optimizer = optimizer;
        self.learning_rate = learning_rate;
        self
    }

    /// Set the epoch counts: single-phase, trunk phase, branch phase.
    #[must_use]
    pub fn with_epochs(mut self, epochs: usize, trunk: usize, branch: usize) -> Self {
        self.epochs = epochs;
        self.trunk_train_epochs = trunk;
        self.branch_train_epochs = branch;
        self
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the precision.
    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = DeepOnetConfig::default();
        assert_eq!(config.output_keys, vec!["g_u_real", "g_u_imag"]);
        assert_eq!(config.error_norm, 2.0);
        assert_eq!(config.basis_functions, 32);
        assert_eq!(config.output_handling, OutputHandlingKind::ShareTrunk);
        assert_eq!(config.training_strategy, TrainingStrategyKind::Standard);
        assert_eq!(config.decomposition, DecompositionKind::Qr);
        assert_eq!(config.var_share, 0.95);
        assert_eq!(config.dtype(), DType::F32);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: DeepOnetConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.n_outputs(), 2);
    }

    #[test]
    fn test_yaml_keys_are_screaming_snake_case() {
        let yaml = serde_yaml::to_string(&DeepOnetConfig::default()).unwrap();
        assert!(yaml.contains("OUTPUT_KEYS"));
        assert!(yaml.contains("BASIS_FUNCTIONS"));
        assert!(yaml.contains("OUTPUT_HANDLING: share_trunk"));
        assert!(yaml.contains("TRAINING_STRATEGY: standard"));
    }

    #[test]
    fn test_share_branch_two_step_is_rejected() {
        let config = DeepOnetConfig::default()
            .with_output_handling(OutputHandlingKind::ShareBranch)
            .with_training_strategy(TrainingStrategyKind::TwoStep);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DeepOnetError::IncompatibleStrategies { .. }));
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = DeepOnetConfig::default();
        config.var_share = 1.5;
        assert!(config.validate().is_err());

        let mut config = DeepOnetConfig::default();
        config.output_keys.clear();
        assert!(config.validate().is_err());

        let config = DeepOnetConfig::default().with_output_keys(["u", "u"]);
        assert!(config.validate().is_err());

        let mut config = DeepOnetConfig::default();
        config.error_norm = f64::INFINITY;
        config.validate().unwrap();
        config.error_norm = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_name() {
        let config = DeepOnetConfig::default()
            .with_training_strategy(TrainingStrategyKind::TwoStep)
            .with_output_handling(OutputHandlingKind::SplitNetworks);
        assert_eq!(config.model_name(), "DeepONet_kelvin_two_step_splitbasis");

        let mut config = DeepOnetConfig::default();
        config.trunk_feature_expansion = 2;
        assert_eq!(config.model_name(), "DeepONet_kelvin_standard_trunkexp_singlebasis");
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = DeepOnetConfig::from_file("/nonexistent/path/config.yaml");
        assert!(matches!(result, Err(DeepOnetError::Io(_))));
    }

    #[test]
    fn test_load_config_malformed_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "BASIS_FUNCTIONS: [[[").unwrap();

        let result = DeepOnetConfig::from_file(temp_file.path());
        assert!(matches!(result, Err(DeepOnetError::ConfigParse(_))));
    }

    #[test]
    fn test_save_config_roundtrip() {
        let config = DeepOnetConfig::default()
            .with_basis_functions(12)
            .with_training_strategy(TrainingStrategyKind::Pod)
            .with_seed(7);
        let temp_file = NamedTempFile::new().unwrap();

        config.to_file(temp_file.path()).unwrap();
        let loaded = DeepOnetConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.basis_functions, 12);
        assert_eq!(loaded.training_strategy, TrainingStrategyKind::Pod);
        assert_eq!(loaded.seed, 7);
        assert_eq!(loaded.output_keys, config.output_keys);
    }
}
