//! # deeponet-rs
//!
//! Deep operator networks (DeepONet) on candle, with interchangeable output
//! handling and training strategies.
//!
//! A DeepONet learns an operator `G: u ↦ G(u)(y)` from a branch network
//! (encoding the input function `u` sampled at sensors) and a trunk network
//! (encoding query coordinates `y`). Their outputs are fused into one or more
//! output fields.
//!
//! ## Features
//!
//! - **Output handling** - `share_trunk`, `split_networks`, `share_branch`
//! - **Training strategies** - standard joint training, two-step
//!   (trunk, QR/SVD decomposition, branch) and POD (fixed basis from data)
//! - **YAML Configuration** - one `SCREAMING_SNAKE_CASE` file per run
//! - **Reproducible** - all initialization from an explicit seeded RNG
//!
//! ## Quick Start
//!
//! ```no_run
//! use candle_core::Device;
//! use deeponet_rs::{
//!     DeepONet, DeepOnetBatch, DeepOnetConfig, DecompositionHelper, Objective, Trainer,
//!     TwoStepPhase, TwoStepTraining,
//! };
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! # fn main() -> deeponet_rs::Result<()> {
//! # let train = DeepOnetBatch::default();
//! let config = DeepOnetConfig::from_file("examples/configs/two_step.yaml")?;
//! let objective = Objective::new(config.loss_function, config.output_keys.clone(), config.error_norm);
//! let n_train = train.batch_size()?.unwrap_or(0);
//! let strategy = TwoStepTraining::new(
//!     objective,
//!     DecompositionHelper::new(config.decomposition),
//!     n_train,
//!     TwoStepPhase::Trunk,
//! );
//!
//! let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
//! let mut model = DeepONet::new(&config, strategy.into(), &Device::Cpu, &mut rng)?;
//! let mut trainer = Trainer::new(config)?;
//! let history = trainer.fit(&mut model, &train, None, &mut rng)?;
//! println!("{:?}", history.final_errors);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod component;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod linalg;
pub mod loss;
pub mod model;
pub mod network;
pub mod optimizer;
pub mod output_handling;
pub mod pod;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use batch::{expand_trunk_features, DeepOnetBatch};
pub use component::Component;
pub use config::{DeepOnetConfig, TrainingStrategyKind};
pub use decomposition::{DecompositionHelper, DecompositionKind};
pub use error::{DeepOnetError, Result};
pub use loss::{LossFunction, Objective};
pub use model::{DeepONet, ModelParts};
pub use network::{Activation, Mlp};
pub use output_handling::{BasisConfig, OutputHandling, OutputHandlingKind, OutputLayout};
pub use pod::{PodBasis, PodBasisHelper};
pub use strategy::{
    PodTraining, StandardTraining, TrainingStrategy, TwoStepHelper, TwoStepPhase, TwoStepTraining,
};
pub use trainer::{EpochMetrics, Trainer, TrainingHistory};
