use std::{fmt, path::Path, str::FromStr};

use burn::{
    module::AutodiffModule,
    optim::{momentum::MomentumConfig, AdamConfig, GradientsParams, Optimizer, SgdConfig},
    record::{Recorder, RecorderError},
    tensor::{backend::AutodiffBackend, Tensor},
};

use crate::{
    checkpoint::CheckpointRecorder,
    config::TrainerConfig,
    error::{GanError, Result},
};

/// Counts every gradient application, whichever sub-network it updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobalStep(u64);

impl GlobalStep {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    fn increment(&mut self) {
        self.0 += 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Momentum,
}

impl FromStr for OptimizerKind {
    type Err = GanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            "momentum" => Ok(Self::Momentum),
            other => Err(GanError::config(format!(
                "unknown optimizer `{other}` (expected one of adam, sgd, momentum)"
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
            Self::Momentum => "momentum",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OptimizerSettings {
    pub lr: f64,
    pub momentum: f64,
    pub beta2: f64,
}

impl From<&TrainerConfig> for OptimizerSettings {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            lr: config.lr,
            momentum: config.momentum,
            beta2: config.beta2,
        }
    }
}

// Object-safe view over burn's optimizers so that the kind can be picked at runtime.
trait StepOptimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    fn apply(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
    fn save(&self, path: &Path) -> std::result::Result<(), RecorderError>;
    fn load(&mut self, path: &Path, device: &B::Device) -> std::result::Result<(), RecorderError>;
}

impl<M, B, O> StepOptimizer<M, B> for O
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B> + Clone + 'static,
{
    fn apply(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }

    fn save(&self, path: &Path) -> std::result::Result<(), RecorderError> {
        CheckpointRecorder::new().record(self.to_record(), path.to_path_buf())?;
        Ok(())
    }

    fn load(&mut self, path: &Path, device: &B::Device) -> std::result::Result<(), RecorderError> {
        let record = CheckpointRecorder::new().load(path.to_path_buf(), device)?;
        *self = self.clone().load_record(record);
        Ok(())
    }
}

/// A stateful optimizer bound to one sub-network type.
pub struct GanOptimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    kind: OptimizerKind,
    lr: f64,
    iterations: usize,
    inner: Box<dyn StepOptimizer<M, B>>,
}

impl<M, B> GanOptimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + 'static,
{
    pub fn new(kind: OptimizerKind, settings: OptimizerSettings) -> Self {
        let inner: Box<dyn StepOptimizer<M, B>> = match kind {
            OptimizerKind::Adam => Box::new(
                AdamConfig::new()
                    .with_beta_1(settings.momentum as f32)
                    .with_beta_2(settings.beta2 as f32)
                    .with_epsilon(1e-8)
                    .init::<B, M>(),
            ),
            OptimizerKind::Sgd => Box::new(SgdConfig::new().init::<B, M>()),
            OptimizerKind::Momentum => Box::new(
                SgdConfig::new()
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(settings.momentum)
                            .with_dampening(0.0),
                    ))
                    .init::<B, M>(),
            ),
        };

        Self {
            kind,
            lr: settings.lr,
            iterations: 0,
            inner,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Number of `apply_gradients` calls made through this optimizer.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Backpropagates `loss` and keeps only the gradients of `module`'s parameters.
    pub fn compute_gradients(&self, loss: Tensor<B, 1>, module: &M) -> GradientsParams {
        GradientsParams::from_grads(loss.backward(), module)
    }

    pub fn apply_gradients(
        &mut self,
        module: M,
        grads: GradientsParams,
        global_step: &mut GlobalStep,
    ) -> M {
        let module = self.inner.apply(self.lr, module, grads);
        self.iterations += 1;
        global_step.increment();
        module
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.inner.save(path)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path, device: &B::Device) -> Result<()> {
        self.inner.load(path, device)?;
        Ok(())
    }
}

/// Builds an optimizer from its configuration name.
pub fn build_optimizer<M, B>(kind: &str, settings: OptimizerSettings) -> Result<GanOptimizer<M, B>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + 'static,
{
    let kind = kind.parse::<OptimizerKind>()?;
    Ok(GanOptimizer::new(kind, settings))
}
