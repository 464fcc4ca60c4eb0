mod common;

use std::{collections::HashSet, fs};

use approx::assert_relative_eq;
use burn::{
    module::{Module, ModuleVisitor, ParamId},
    prelude::Backend,
    tensor::Tensor,
};
use common::{toy_config, toy_model, toy_trainer, TestBackend, ToyDataset, IMAGE_SHAPE};
use gan_trainer::{
    checkpoint::{CheckpointRecorder, TrainingState},
    ema::trainable_ids,
    model::{
        discriminator::Discriminator,
        generator::Generator,
    },
    summary::{param_histograms, SummaryEvent},
    DcganModel, DiscOutput, GanError, GanModel, GanTrainer, Phase, TrainingSession,
};

#[test]
fn one_step_with_two_discriminator_updates_applies_three_times() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = toy_trainer(dir.path(), 1, 2);

    let report = trainer.train_model(None).unwrap();

    assert_eq!(report.start_step, 0);
    assert_eq!(report.steps_run, 1);
    assert_eq!(report.iterations_d, 2);
    assert_eq!(report.iterations_g, 1);
    assert_eq!(report.global_step, 3);
    assert!(report.last_loss_g.unwrap().is_finite());

    let all = trainer.checkpoints().all().unwrap();
    assert_eq!(all, report.checkpoints);
    assert_eq!(all.len(), 1);
    assert_eq!(trainer.checkpoints().latest().unwrap(), Some(all[0].clone()));
}

#[test]
fn two_steps_with_one_discriminator_update_apply_four_times() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = toy_trainer(dir.path(), 2, 1);

    let report = trainer.train_model(None).unwrap();

    assert_eq!(report.global_step, 4);
    assert_eq!((report.iterations_d, report.iterations_g), (2, 2));
    // Short runs checkpoint every step.
    assert_eq!(report.checkpoints.len(), 2);
}

#[test]
fn checkpoint_holds_every_network_shadow_and_optimizer() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = toy_trainer(dir.path(), 1, 1);
    let report = trainer.train_model(None).unwrap();

    let checkpoint = &report.checkpoints[0];
    assert!(checkpoint.ends_with("model.ckpt-0"));
    for name in [
        "generator",
        "discriminator",
        "generator_ema",
        "discriminator_ema",
        "optimizer_d",
        "optimizer_g",
    ] {
        assert!(
            checkpoint.join(format!("{name}.mpk")).is_file(),
            "missing {name}"
        );
    }

    let state = TrainingState::load(checkpoint).unwrap();
    assert_eq!((state.global_step, state.step), (2, 0));
    assert!(trainer.save_dir().join("config.json").is_file());
    assert!(trainer.save_dir().ends_with("dcgan_toy"));
}

#[test]
fn summaries_are_written_at_the_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = toy_trainer(dir.path(), 1, 1);
    trainer.train_model(None).unwrap();

    let summaries = trainer.save_dir().join("summaries");
    let contents = fs::read_to_string(summaries.join("events.jsonl")).unwrap();
    let events = contents
        .lines()
        .map(|line| serde_json::from_str::<SummaryEvent>(line).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step, 0);
    assert!(events[0].scalars.contains_key("loss_g"));
    assert!(events[0].scalars.contains_key("loss_d"));
    assert!(events[0]
        .histograms
        .iter()
        .any(|h| h.name.starts_with("gradients/discriminator")));
    assert!(events[0]
        .histograms
        .iter()
        .any(|h| h.name == "activations/features"));

    // 4 x 16 grid of 8 x 8 images.
    let fake = image::open(summaries.join("imgs/fake-0.png")).unwrap();
    assert_eq!((fake.width(), fake.height()), (128, 32));
    assert!(summaries.join("imgs/train-0.png").is_file());
}

#[test]
fn resumes_at_the_step_after_the_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    toy_trainer(dir.path(), 2, 1).train_model(None).unwrap();

    let trainer = toy_trainer(dir.path(), 3, 1);
    let report = trainer.train_model(None).unwrap();

    // 4 applies at 2 per step.
    assert_eq!(report.start_step, 2);
    assert_eq!(report.steps_run, 1);
    assert_eq!(report.global_step, 6);
    assert_eq!(
        report.restored_from,
        Some(trainer.save_dir().join("model.ckpt-1"))
    );

    let latest = trainer.checkpoints().latest().unwrap().unwrap();
    let state = TrainingState::load(&latest).unwrap();
    assert_eq!((state.global_step, state.step), (6, 2));
    assert_eq!(trainer.checkpoints().all().unwrap().len(), 3);
}

#[test]
fn finished_runs_do_not_train_again() {
    let dir = tempfile::tempdir().unwrap();
    toy_trainer(dir.path(), 2, 1).train_model(None).unwrap();

    let report = toy_trainer(dir.path(), 2, 1).train_model(None).unwrap();
    assert_eq!(report.start_step, 2);
    assert_eq!(report.steps_run, 0);
    assert!(report.checkpoints.is_empty());
}

#[test]
fn pretrained_restore_skips_missing_and_mismatched_scopes() {
    let dir = tempfile::tempdir().unwrap();
    let pretrained = dir.path().join("pretrained");
    fs::create_dir_all(&pretrained).unwrap();

    let device = Default::default();
    let model = toy_model(4);
    let saved = model.init_generator::<TestBackend>(&device);
    saved
        .clone()
        .save_file(pretrained.join("generator"), &CheckpointRecorder::new())
        .unwrap();
    fs::write(pretrained.join("discriminator.mpk"), b"not a record").unwrap();

    let trainer = toy_trainer(&dir.path().join("logs"), 1, 1);
    let mut session = TrainingSession::new(&trainer).unwrap();
    assert_eq!(session.phase(), Phase::Initializing);

    session.restore(Some(&pretrained)).unwrap();
    assert_eq!(session.phase(), Phase::Restoring);
    assert_eq!(session.global_step().value(), 0);
    assert_eq!(
        param_histograms("g", session.generator()),
        param_histograms("g", &saved)
    );
    assert_eq!(
        param_histograms("g", session.generator_ema()),
        param_histograms("g", &saved)
    );

    // Only the generator scope exists here; training still starts.
    let only_generator = dir.path().join("only_generator");
    fs::create_dir_all(&only_generator).unwrap();
    saved
        .save_file(only_generator.join("generator"), &CheckpointRecorder::new())
        .unwrap();
    let trainer = toy_trainer(&dir.path().join("logs2"), 1, 1);
    let report = trainer.train_model(Some(&only_generator)).unwrap();
    assert_eq!(report.restored_from, Some(only_generator));
    assert_eq!(report.global_step, 2);
}

/// `(dims, values)` of every float tensor, in visiting order; `ids` filters when given.
fn tensors<B: Backend, M: Module<B>>(
    module: &M,
    ids: Option<&HashSet<ParamId>>,
) -> Vec<(Vec<usize>, Vec<f32>)> {
    struct Collect<'a> {
        ids: Option<&'a HashSet<ParamId>>,
        out: Vec<(Vec<usize>, Vec<f32>)>,
    }

    impl<B: Backend> ModuleVisitor<B> for Collect<'_> {
        fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
            if self.ids.is_none_or(|ids| ids.contains(&id)) {
                let values = tensor
                    .clone()
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .unwrap();
                self.out.push((tensor.dims().to_vec(), values));
            }
        }
    }

    let mut collect = Collect {
        ids,
        out: Vec::new(),
    };
    module.visit(&mut collect);
    collect.out
}

fn flat<B: Backend, M: Module<B>>(module: &M, ids: &HashSet<ParamId>) -> Vec<f32> {
    tensors(module, Some(ids))
        .into_iter()
        .flat_map(|(_, values)| values)
        .collect()
}

fn assert_blend(actual: &[f32], parts: &[(f32, &[f32])]) {
    assert_eq!(actual.len(), parts[0].1.len());
    for (i, value) in actual.iter().enumerate() {
        let expected = parts.iter().map(|(w, xs)| w * xs[i]).sum::<f32>();
        assert_relative_eq!(*value, expected, epsilon = 1e-5);
    }
}

#[test]
fn both_shadows_follow_every_gradient_application() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = GanTrainer::<TestBackend, _, _>::new(
        toy_model(4),
        ToyDataset::new(12, 10),
        toy_config(dir.path(), 1, 1)
            .with_ema_warmup(false)
            .with_moving_avgs_decay(0.5)
            .with_lr(1e-2),
        Default::default(),
    )
    .unwrap();
    let mut session = TrainingSession::new(&trainer).unwrap();

    let g_ids = trainable_ids(session.generator());
    let d_ids = trainable_ids(session.discriminator());
    let g0 = flat(session.generator(), &g_ids);
    let d0 = flat(session.discriminator(), &d_ids);

    session.discriminator_update().unwrap();
    let d1 = flat(session.discriminator(), &d_ids);
    assert_ne!(d1, d0);
    assert_eq!(flat(session.generator(), &g_ids), g0);
    assert_blend(
        &flat(session.discriminator_ema(), &d_ids),
        &[(0.5, &d0[..]), (0.5, &d1[..])],
    );
    assert_blend(&flat(session.generator_ema(), &g_ids), &[(1.0, &g0[..])]);

    session.generator_update();
    let g1 = flat(session.generator(), &g_ids);
    assert_ne!(g1, g0);
    assert_eq!(flat(session.discriminator(), &d_ids), d1);
    assert_blend(
        &flat(session.generator_ema(), &g_ids),
        &[(0.5, &g0[..]), (0.5, &g1[..])],
    );
    assert_blend(
        &flat(session.discriminator_ema(), &d_ids),
        &[(0.25, &d0[..]), (0.75, &d1[..])],
    );
    assert_eq!(session.global_step().value(), 2);
}

#[test]
fn pretrained_restore_takes_every_tensor_that_fits() {
    let dir = tempfile::tempdir().unwrap();
    let pretrained = dir.path().join("pretrained");
    fs::create_dir_all(&pretrained).unwrap();

    // Same generator for grey images: only the output convolution differs in shape.
    let device = Default::default();
    let grey = gan_trainer::ModelConfig::for_images([1, 8, 8], 4).init();
    let saved = grey.init_generator::<TestBackend>(&device);
    saved
        .clone()
        .save_file(pretrained.join("generator"), &CheckpointRecorder::new())
        .unwrap();

    let trainer = toy_trainer(&dir.path().join("logs"), 1, 1);
    let mut session = TrainingSession::new(&trainer).unwrap();
    let initial = tensors(session.generator(), None);
    session.restore(Some(&pretrained)).unwrap();

    let restored = tensors(session.generator(), None);
    let source = tensors(&saved, None);
    assert_eq!(restored.len(), source.len());

    let mut kept = 0;
    for ((restored, source), initial) in restored.iter().zip(&source).zip(&initial) {
        assert_eq!(restored.0, initial.0);
        if restored.0 == source.0 {
            assert_eq!(restored.1, source.1);
        } else {
            assert_eq!(restored.1, initial.1);
            kept += 1;
        }
    }
    // Output convolution weight and bias.
    assert_eq!(kept, 2);
    assert_eq!(
        tensors(session.generator_ema(), None),
        tensors(session.generator(), None)
    );
}

#[test]
fn rejects_unknown_optimizer_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = GanTrainer::<TestBackend, _, _>::new(
        toy_model(4),
        ToyDataset::new(8, 8),
        toy_config(dir.path(), 1, 1).with_optimizer_g("rmsprop".into()),
        Default::default(),
    )
    .unwrap();

    assert!(matches!(
        trainer.train_model(None),
        Err(GanError::Configuration(_))
    ));
}

#[test]
fn every_optimizer_kind_trains() {
    for kind in ["sgd", "momentum"] {
        let dir = tempfile::tempdir().unwrap();
        let trainer = GanTrainer::<TestBackend, _, _>::new(
            toy_model(4),
            ToyDataset::new(8, 8),
            toy_config(dir.path(), 1, 1)
                .with_optimizer_d(kind.into())
                .with_optimizer_g(kind.into()),
            Default::default(),
        )
        .unwrap();
        assert_eq!(trainer.train_model(None).unwrap().global_step, 2);
    }
}

#[test]
fn malformed_training_data_fails_at_setup() {
    let dir = tempfile::tempdir().unwrap();
    // Images are 3 x 8 x 8, the model expects 3 x 16 x 16.
    let model = gan_trainer::ModelConfig::for_images([3, 16, 16], 4)
        .with_batch_size(4)
        .init();
    let trainer = GanTrainer::<TestBackend, _, _>::new(
        model,
        ToyDataset::new(8, 8),
        toy_config(dir.path(), 1, 1),
        Default::default(),
    )
    .unwrap();

    assert!(matches!(trainer.train_model(None), Err(GanError::Data(_))));
}

/// The reference model with a generator loss that is never finite.
struct DivergingModel {
    inner: DcganModel,
}

impl GanModel for DivergingModel {
    type Generator<B: Backend> = Generator<B>;
    type Discriminator<B: Backend> = Discriminator<B>;

    fn name(&self) -> &str {
        "diverging"
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn image_shape(&self) -> [usize; 3] {
        self.inner.image_shape()
    }

    fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.inner.init_generator(device)
    }

    fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.inner.init_discriminator(device)
    }

    fn generate<B: Backend>(&self, generator: &Generator<B>, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        self.inner.generate(generator, noise)
    }

    fn discriminate<B: Backend>(
        &self,
        discriminator: &Discriminator<B>,
        images: Tensor<B, 4>,
    ) -> DiscOutput<B> {
        self.inner.discriminate(discriminator, images)
    }

    fn g_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>) -> Tensor<B, 1> {
        self.inner.g_loss(preds_fake).add_scalar(f64::NAN)
    }

    fn d_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>, preds_real: Tensor<B, 2>) -> Tensor<B, 1> {
        self.inner.d_loss(preds_fake, preds_real)
    }
}

#[test]
fn non_finite_generator_loss_stops_training() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = GanTrainer::<TestBackend, _, _>::new(
        DivergingModel {
            inner: toy_model(4),
        },
        ToyDataset::new(8, 8),
        toy_config(dir.path(), 5, 1),
        Default::default(),
    )
    .unwrap();

    match trainer.train_model(None) {
        Err(GanError::Divergence { step, loss }) => {
            assert_eq!(step, 0);
            assert!(loss.is_nan());
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    // Nothing was checkpointed.
    assert!(trainer.checkpoints().all().unwrap().is_empty());
    assert_eq!(IMAGE_SHAPE, trainer.model().image_shape());
}
