use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    tensor::{
        backend::{AutodiffBackend, Backend},
        cast::ToElement,
        Tensor,
    },
};

use crate::{
    checkpoint::{
        load_matching, CheckpointRecorder, CheckpointStore, TrainingState, DISCRIMINATOR,
        DISCRIMINATOR_EMA, GENERATOR, GENERATOR_EMA, OPTIMIZER_D, OPTIMIZER_G,
    },
    config::TrainerConfig,
    data::{FeedOptions, GanDataset, TrainFeed},
    ema::{trainable_ids, ExponentialMovingAverage},
    error::{GanError, Result},
    model::GanModel,
    optim::{build_optimizer, GanOptimizer, GlobalStep, OptimizerSettings},
    steps::{DiscriminatorStep, GeneratorStep},
    summary::{activation_histograms, grad_histograms, param_histograms, SummaryEvent, SummaryWriter},
};

/// `max(total / divisor, 1)`
pub fn cadence(total: usize, divisor: usize) -> usize {
    (total / divisor).max(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Restoring,
    Running,
    Checkpointing,
    Done,
}

/// What one call to [`GanTrainer::train_model`] did.
#[derive(Clone, Debug, Default)]
pub struct TrainingReport {
    pub start_step: usize,
    pub steps_run: usize,
    pub global_step: u64,
    pub last_loss_g: Option<f64>,
    pub last_loss_d: Option<f64>,
    /// Gradient applications made by this run, per optimizer.
    pub iterations_g: usize,
    pub iterations_d: usize,
    pub restored_from: Option<PathBuf>,
    pub checkpoints: Vec<PathBuf>,
}

/// Owns the model, the dataset and the configuration of one experiment.
pub struct GanTrainer<B: Backend, M, D> {
    model: M,
    dataset: D,
    config: TrainerConfig,
    device: B::Device,
}

impl<B: Backend, M: GanModel, D: GanDataset> GanTrainer<B, M, D> {
    pub fn new(model: M, dataset: D, config: TrainerConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            dataset,
            config,
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// `{log_dir}/{model}_{dataset}`
    pub fn save_dir(&self) -> PathBuf {
        Path::new(&self.config.log_dir).join(format!(
            "{}_{}",
            self.model.name(),
            self.dataset.name()
        ))
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.save_dir())
    }
}

impl<B, M, D> GanTrainer<B, M, D>
where
    B: AutodiffBackend,
    M: GanModel,
    D: GanDataset,
    M::Generator<B>: AutodiffModule<B, InnerModule = M::Generator<B::InnerBackend>> + 'static,
    M::Discriminator<B>:
        AutodiffModule<B, InnerModule = M::Discriminator<B::InnerBackend>> + 'static,
{
    /// Trains from the latest checkpoint of this experiment if there is one, otherwise from
    /// the `generator`/`discriminator` records in `pretrained`, otherwise from scratch.
    pub fn train_model(&self, pretrained: Option<&Path>) -> Result<TrainingReport> {
        let mut session = TrainingSession::new(self)?;
        session.restore(pretrained)?;
        session.run()
    }
}

/// Live state of a training run: networks, their shadows, optimizers and the step counter.
pub struct TrainingSession<'a, B, M, D>
where
    B: AutodiffBackend,
    M: GanModel,
    D: GanDataset,
    M::Generator<B>: AutodiffModule<B, InnerModule = M::Generator<B::InnerBackend>> + 'static,
    M::Discriminator<B>:
        AutodiffModule<B, InnerModule = M::Discriminator<B::InnerBackend>> + 'static,
{
    trainer: &'a GanTrainer<B, M, D>,
    phase: Phase,
    generator: M::Generator<B>,
    discriminator: M::Discriminator<B>,
    generator_ema: ExponentialMovingAverage<B::InnerBackend, M::Generator<B::InnerBackend>>,
    discriminator_ema:
        ExponentialMovingAverage<B::InnerBackend, M::Discriminator<B::InnerBackend>>,
    optimizer_g: GanOptimizer<M::Generator<B>, B>,
    optimizer_d: GanOptimizer<M::Discriminator<B>, B>,
    global_step: GlobalStep,
    g_step: GeneratorStep<M>,
    d_step: DiscriminatorStep<M>,
    feed: TrainFeed<B>,
    store: CheckpointStore,
    summaries: SummaryWriter,
    restored_from: Option<PathBuf>,
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().into_scalar().to_f64()
}

fn restore_scope<B: Backend, M: Module<B>>(
    module: &M,
    dir: &Path,
    scope: &str,
    device: &B::Device,
) -> Option<M> {
    let file = dir.join(scope);
    if !file.with_extension("mpk").is_file() {
        tracing::warn!(scope, "no pretrained record, skipping");
        return None;
    }
    match load_matching(module.clone(), &file, device) {
        Ok((module, stats)) if stats.restored > 0 => {
            tracing::info!(scope, restored = stats.restored, skipped = stats.skipped, "restored");
            Some(module)
        }
        Ok(_) => {
            tracing::warn!(scope, "no pretrained tensor fits the network, skipping");
            None
        }
        Err(err) => {
            tracing::warn!(scope, error = %err, "pretrained record does not decode, skipping");
            None
        }
    }
}

impl<'a, B, M, D> TrainingSession<'a, B, M, D>
where
    B: AutodiffBackend,
    M: GanModel,
    D: GanDataset,
    M::Generator<B>: AutodiffModule<B, InnerModule = M::Generator<B::InnerBackend>> + 'static,
    M::Discriminator<B>:
        AutodiffModule<B, InnerModule = M::Discriminator<B::InnerBackend>> + 'static,
{
    pub fn new(trainer: &'a GanTrainer<B, M, D>) -> Result<Self> {
        let config = &trainer.config;
        let model = &trainer.model;
        let device = &trainer.device;
        tracing::debug!(phase = ?Phase::Initializing, "training session");

        B::seed(config.seed);

        let store = trainer.checkpoints();
        fs::create_dir_all(store.save_dir())?;
        config.save(store.save_dir().join("config.json"))?;
        let summaries = SummaryWriter::new(store.save_dir().join("summaries"))?;

        let settings = OptimizerSettings::from(config);
        let optimizer_d = build_optimizer(&config.optimizer_d, settings)?;
        let optimizer_g = build_optimizer(&config.optimizer_g, settings)?;

        let generator = model.init_generator::<B>(device);
        let discriminator = model.init_discriminator::<B>(device);
        let generator_ema = ExponentialMovingAverage::new(
            config.moving_avgs_decay,
            &generator.valid(),
            trainable_ids(&generator),
        );
        let discriminator_ema = ExponentialMovingAverage::new(
            config.moving_avgs_decay,
            &discriminator.valid(),
            trainable_ids(&discriminator),
        );
        tracing::info!(
            optimizer_d = ?optimizer_d.kind(),
            optimizer_g = ?optimizer_g.kind(),
            decay = generator_ema.decay(),
            warmup = config.ema_warmup,
            "networks initialised"
        );

        let (g_step, created) = GeneratorStep::new(model);
        let d_step = DiscriminatorStep::new(model, created);

        let feed = TrainFeed::new(
            &trainer.dataset,
            FeedOptions {
                batch_size: model.batch_size(),
                image_shape: model.image_shape(),
                seed: config.seed,
                prefetch: config.prefetch,
            },
            device,
        )?;

        Ok(Self {
            trainer,
            phase: Phase::Initializing,
            generator,
            discriminator,
            generator_ema,
            discriminator_ema,
            optimizer_g,
            optimizer_d,
            global_step: GlobalStep::default(),
            g_step,
            d_step,
            feed,
            store,
            summaries,
            restored_from: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn global_step(&self) -> GlobalStep {
        self.global_step
    }

    pub fn generator(&self) -> &M::Generator<B> {
        &self.generator
    }

    pub fn discriminator(&self) -> &M::Discriminator<B> {
        &self.discriminator
    }

    pub fn generator_ema(&self) -> &M::Generator<B::InnerBackend> {
        self.generator_ema.shadow()
    }

    pub fn discriminator_ema(&self) -> &M::Discriminator<B::InnerBackend> {
        self.discriminator_ema.shadow()
    }

    fn set_phase(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// First outer step to run: the global step converted back to outer-step units.
    pub fn start_step(&self) -> usize {
        (self.global_step.value() / self.trainer.config.applies_per_step()) as usize
    }

    pub fn restore(&mut self, pretrained: Option<&Path>) -> Result<()> {
        self.set_phase(Phase::Restoring);

        if let Some(checkpoint) = self.store.latest()? {
            tracing::info!(checkpoint = %checkpoint.display(), "restoring from previous checkpoint");
            self.restore_checkpoint(&checkpoint)?;
            self.restored_from = Some(checkpoint);
        } else if let Some(path) = pretrained {
            tracing::info!(path = %path.display(), "restoring pretrained weights");
            self.restore_pretrained(path);
            self.restored_from = Some(path.to_path_buf());
        }
        Ok(())
    }

    fn restore_checkpoint(&mut self, dir: &Path) -> Result<()> {
        let device = &self.trainer.device;
        let recorder = CheckpointRecorder::new();

        self.generator = self
            .generator
            .clone()
            .load_file(dir.join(GENERATOR), &recorder, device)?;
        self.discriminator = self
            .discriminator
            .clone()
            .load_file(dir.join(DISCRIMINATOR), &recorder, device)?;
        self.generator_ema.load(&dir.join(GENERATOR_EMA), device)?;
        self.generator_ema.track(trainable_ids(&self.generator));
        self.discriminator_ema.load(&dir.join(DISCRIMINATOR_EMA), device)?;
        self.discriminator_ema
            .track(trainable_ids(&self.discriminator));
        self.optimizer_g.load(&dir.join(OPTIMIZER_G), device)?;
        self.optimizer_d.load(&dir.join(OPTIMIZER_D), device)?;

        let state = TrainingState::load(dir)?;
        self.global_step = GlobalStep::new(state.global_step);
        Ok(())
    }

    // Each scope takes the tensors its record supplies; the rest keep their fresh weights.
    fn restore_pretrained(&mut self, path: &Path) {
        let device = &self.trainer.device;

        if let Some(generator) = restore_scope(&self.generator, path, GENERATOR, device) {
            self.generator = generator;
            self.generator_ema
                .reset(&self.generator.valid(), trainable_ids(&self.generator));
        }
        if let Some(discriminator) =
            restore_scope(&self.discriminator, path, DISCRIMINATOR, device)
        {
            self.discriminator = discriminator;
            self.discriminator_ema
                .reset(&self.discriminator.valid(), trainable_ids(&self.discriminator));
        }
    }

    /// Shadows follow both networks after every gradient application.
    fn update_averages(&mut self) {
        let num_updates = self
            .trainer
            .config
            .ema_warmup
            .then(|| self.global_step.value());
        self.generator_ema.apply(&self.generator.valid(), num_updates);
        self.discriminator_ema
            .apply(&self.discriminator.valid(), num_updates);
    }

    pub fn discriminator_update(&mut self) -> Result<f64> {
        let trainer = self.trainer;
        let out = self.d_step.run(
            &trainer.model,
            &self.generator,
            &self.discriminator,
            &mut self.feed,
            &trainer.device,
        )?;
        let loss = scalar(&out.loss);

        let grads = self
            .optimizer_d
            .compute_gradients(out.loss, &self.discriminator);
        self.discriminator =
            self.optimizer_d
                .apply_gradients(self.discriminator.clone(), grads, &mut self.global_step);
        self.update_averages();

        Ok(loss)
    }

    pub fn generator_update(&mut self) -> f64 {
        let trainer = self.trainer;
        let out = self.g_step.run(
            &trainer.model,
            &self.generator,
            &self.discriminator,
            &trainer.device,
        );
        let loss = scalar(&out.loss);

        let grads = self.optimizer_g.compute_gradients(out.loss, &self.generator);
        self.generator =
            self.optimizer_g
                .apply_gradients(self.generator.clone(), grads, &mut self.global_step);
        self.update_averages();

        loss
    }

    /// Evaluates one extra step of each network without updating anything and logs
    /// losses, histograms and image montages.
    pub fn write_summary(&mut self, step: usize) -> Result<()> {
        let trainer = self.trainer;
        let model = &trainer.model;
        let device = &trainer.device;

        let g_out = self
            .g_step
            .run(model, &self.generator, &self.discriminator, device);
        let d_out = self.d_step.run(
            model,
            &self.generator,
            &self.discriminator,
            &mut self.feed,
            device,
        )?;

        let mut event = SummaryEvent::new(step as u64);
        event.scalars.insert("loss_g".into(), scalar(&g_out.loss));
        event.scalars.insert("loss_d".into(), scalar(&d_out.loss));

        event
            .histograms
            .extend(param_histograms(GENERATOR, &self.generator));
        event
            .histograms
            .extend(param_histograms(DISCRIMINATOR, &self.discriminator));
        event
            .histograms
            .extend(activation_histograms(&d_out.layers));

        let d_grads = self
            .optimizer_d
            .compute_gradients(d_out.loss, &self.discriminator);
        event.histograms.extend(grad_histograms(
            DISCRIMINATOR,
            &self.discriminator,
            &d_grads,
        ));
        let g_grads = self.optimizer_g.compute_gradients(g_out.loss, &self.generator);
        event
            .histograms
            .extend(grad_histograms(GENERATOR, &self.generator, &g_grads));

        self.summaries.write_event(&event)?;
        if let Some(real) = d_out.real {
            self.summaries.write_images("train", step as u64, real)?;
        }
        self.summaries
            .write_images("fake", step as u64, d_out.fake)?;
        Ok(())
    }

    /// Writes all networks, shadows and optimizer states as checkpoint `step`.
    pub fn save_checkpoint(&mut self, step: usize) -> Result<PathBuf> {
        self.set_phase(Phase::Checkpointing);
        let state = TrainingState::now(self.global_step.value(), step as u64);

        let path = self.store.save(&state, |dir| {
            let recorder = CheckpointRecorder::new();
            self.generator
                .clone()
                .save_file(dir.join(GENERATOR), &recorder)?;
            self.discriminator
                .clone()
                .save_file(dir.join(DISCRIMINATOR), &recorder)?;
            self.generator_ema.save(&dir.join(GENERATOR_EMA))?;
            self.discriminator_ema.save(&dir.join(DISCRIMINATOR_EMA))?;
            self.optimizer_d.save(&dir.join(OPTIMIZER_D))?;
            self.optimizer_g.save(&dir.join(OPTIMIZER_G))?;
            Ok(())
        })?;

        tracing::info!(checkpoint = %path.display(), step, "saved checkpoint");
        self.set_phase(Phase::Running);
        Ok(path)
    }

    /// Runs the remaining outer steps: `n_disc` discriminator updates, then one generator
    /// update, each followed by the moving-average update.
    pub fn run(mut self) -> Result<TrainingReport> {
        let trainer = self.trainer;
        let config = &trainer.config;
        let total = config.num_train_steps;
        let log_every = cadence(total, 2000);
        let summary_every = cadence(total, 200);
        let checkpoint_every = cadence(total, 40);
        let batch_size = trainer.model.batch_size();

        let start_step = self.start_step();
        tracing::info!(start_step, total, "start training");
        self.set_phase(Phase::Running);

        let mut report = TrainingReport {
            start_step,
            restored_from: self.restored_from.clone(),
            ..Default::default()
        };

        for step in start_step..total {
            let start = Instant::now();

            for _ in 0..config.n_disc {
                report.last_loss_d = Some(self.discriminator_update()?);
            }
            let loss_g = self.generator_update();
            report.last_loss_g = Some(loss_g);
            report.steps_run += 1;

            let duration = start.elapsed().as_secs_f64();

            if !loss_g.is_finite() {
                return Err(GanError::Divergence { step, loss: loss_g });
            }

            if step % log_every == 0 {
                tracing::info!(
                    "step {}/{}, loss = {:.5} ({:.1} examples/sec; {:.3} sec/batch)",
                    step,
                    total,
                    loss_g,
                    batch_size as f64 / duration,
                    duration
                );
            }

            if step % summary_every == 0 {
                tracing::info!(step, "writing summaries");
                self.write_summary(step)?;
            }

            if step % checkpoint_every == 0 || step + 1 == total {
                let path = self.save_checkpoint(step)?;
                report.checkpoints.push(path);
            }
        }

        self.set_phase(Phase::Done);
        report.global_step = self.global_step.value();
        report.iterations_g = self.optimizer_g.iterations();
        report.iterations_d = self.optimizer_d.iterations();
        Ok(report)
    }
}
