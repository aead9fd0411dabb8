//! Learning rate schedulers, stepped once per epoch.

use crate::config::{DeepOnetConfig, LrScheduler};
use crate::optimizer::Optimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Multiply by `gamma` every `step_size` epochs
    StepDecay {
        /// Epochs between decays
        step_size: usize,
        /// Decay factor
        gamma: f64,
    },
    /// Cosine annealing from the base rate to `min_lr`
    Cosine {
        /// Epochs in the schedule
        total_epochs: usize,
        /// Final learning rate
        min_lr: f64,
    },
}

impl SchedulerType {
    /// Scheduler for a run whose current phase lasts `total_epochs`.
    #[must_use]
    pub fn from_config(config: &DeepOnetConfig, total_epochs: usize) -> Self {
        match config.lr_scheduler {
            LrScheduler::Constant => Self::Constant,
            LrScheduler::StepDecay => Self::StepDecay {
                step_size: config.lr_step_size,
                gamma: config.lr_gamma,
            },
            LrScheduler::Cosine => Self::Cosine {
                total_epochs,
                min_lr: config.min_learning_rate,
            },
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
    /// Current epoch
    current_epoch: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub const fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_epoch: 0,
        }
    }

    /// Get learning rate for current epoch.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        match self.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::StepDecay { step_size, gamma } => {
                let decays = self.current_epoch / step_size.max(1);
                self.base_lr * gamma.powi(i32::try_from(decays).unwrap_or(i32::MAX))
            }
            SchedulerType::Cosine {
                total_epochs,
                min_lr,
            } => {
                let progress = (self.current_epoch as f64 / total_epochs.max(1) as f64).min(1.0);
                let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                min_lr + (self.base_lr - min_lr) * cosine_decay
            }
        }
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut Optimizer) {
        self.current_epoch += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Epochs stepped so far.
    #[must_use]
    pub const fn current_epoch(&self) -> usize {
        self.current_epoch
    }
}
