//! Adversarial training of a pluggable generator/discriminator pair on burn, with
//! checkpointing, moving-average weights and FID / Inception Score evaluation.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod ema;
pub mod error;
pub mod eval;
#[cfg(feature = "inception")]
pub mod inception;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod steps;
pub mod summary;
pub mod training;
pub mod utils;

pub use config::TrainerConfig;
pub use data::{folder::ImageFolderDataset, GanDataset};
pub use error::{GanError, Result};
pub use eval::{Activations, ClassifierOutput, FeatureClassifier, SweepReport};
pub use model::{DcganModel, DiscOutput, GanModel, ModelConfig};
pub use training::{GanTrainer, Phase, TrainingReport, TrainingSession};
