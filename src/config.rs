use burn::config::Config;

use crate::error::GanError;

/// Everything the trainer needs besides the model and the dataset.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// Root under which `{model}_{dataset}/` save directories are created.
    pub log_dir: String,

    #[config(default = 100000)]
    pub num_train_steps: usize,
    #[config(default = "String::from(\"adam\")")]
    pub optimizer_d: String,
    #[config(default = "String::from(\"adam\")")]
    pub optimizer_g: String,
    /// Adam beta1, or the momentum coefficient for the momentum optimizer.
    #[config(default = 0.5)]
    pub momentum: f64,
    #[config(default = 0.999)]
    pub beta2: f64,
    /// Discriminator updates per generator update.
    #[config(default = 1)]
    pub n_disc: usize,
    #[config(default = 1e-4)]
    pub lr: f64,
    #[config(default = 0.9999)]
    pub moving_avgs_decay: f64,
    /// Cap the moving-average decay by `(1 + step) / (10 + step)` early in training.
    #[config(default = true)]
    pub ema_warmup: bool,
    #[config(default = 123)]
    pub seed: u64,
    /// Number of batches the training feed may prepare ahead of the loop.
    #[config(default = 100)]
    pub prefetch: usize,
    /// Side length the classifier expects its input images to have.
    #[config(default = 299)]
    pub classifier_size: usize,
}

impl TrainerConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.num_train_steps == 0 {
            return Err(GanError::config("num_train_steps must be positive"));
        }
        if self.n_disc == 0 {
            return Err(GanError::config("n_disc must be positive"));
        }
        if self.prefetch == 0 {
            return Err(GanError::config("prefetch must be positive"));
        }
        if !(0.0..1.0).contains(&self.moving_avgs_decay) {
            return Err(GanError::config(format!(
                "moving_avgs_decay must lie in [0, 1), got {}",
                self.moving_avgs_decay
            )));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(GanError::config(format!("lr must be positive, got {}", self.lr)));
        }
        Ok(())
    }

    /// Applies to the optimizer counter: one increment per `apply_gradients`.
    pub fn applies_per_step(&self) -> u64 {
        1 + self.n_disc as u64
    }
}
