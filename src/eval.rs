use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    tensor::{
        backend::{AutodiffBackend, Backend},
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Tensor,
    },
};
use nalgebra::DMatrix;

use crate::{
    checkpoint::{resolve_checkpoint, CheckpointRecorder, GENERATOR_EMA},
    data::{FeedOptions, GanDataset, TestFeed},
    error::{GanError, Result},
    metrics::{frechet_distance, inception_score, MetricSummary},
    model::GanModel,
    steps::sample_noise,
    training::GanTrainer,
};

/// Pooled features and class logits of one classified batch.
#[derive(Debug, Clone)]
pub struct ClassifierOutput<B: Backend> {
    /// `[N, F]`
    pub pool: Tensor<B, 2>,
    /// `[N, K]`
    pub logits: Tensor<B, 2>,
}

/// A frozen, pretrained image classifier used as a feature extractor.
pub trait FeatureClassifier<B: Backend> {
    /// `images [N, 3, S, S]` in `[-1, 1]`, `S` being the configured classifier size.
    fn classify(&self, images: Tensor<B, 4>) -> Result<ClassifierOutput<B>>;
}

/// Activations collected from real and generated test samples, `num_comp` rows each.
#[derive(Debug, Clone)]
pub struct Activations {
    pub real: DMatrix<f64>,
    pub fake: DMatrix<f64>,
    pub fake_logits: DMatrix<f64>,
    /// Number of batches drawn from the test feed.
    pub batches: usize,
}

/// Metrics of every checkpoint, plus their mean and spread.
#[derive(Debug, Clone)]
pub struct SweepReport {
    /// `(checkpoint, fid, inception score)` in ascending step order.
    pub checkpoints: Vec<(PathBuf, f64, f64)>,
    pub fid: MetricSummary,
    pub inception_score: MetricSummary,
}

// Row-major accumulator for per-batch `[n, width]` outputs.
#[derive(Default)]
struct Rows {
    values: Vec<f64>,
    width: Option<usize>,
}

impl Rows {
    fn push<B: Backend>(&mut self, tensor: Tensor<B, 2>) -> Result<()> {
        let [_, width] = tensor.dims();
        match self.width {
            Some(expected) if expected != width => {
                return Err(GanError::Classifier(format!(
                    "classifier output width changed from {expected} to {width}"
                )))
            }
            _ => self.width = Some(width),
        }
        let values = tensor
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| GanError::Classifier(format!("unreadable classifier output: {e:?}")))?;
        self.values.extend(values);
        Ok(())
    }

    fn into_matrix(self, rows: usize) -> DMatrix<f64> {
        let width = self.width.unwrap_or_default();
        let available = if width == 0 { 0 } else { self.values.len() / width };
        let rows = rows.min(available);
        DMatrix::from_row_slice(rows, width, &self.values[..rows * width])
    }
}

/// Brings `[N, C, H, W]` images to the classifier's `[N, 3, size, size]` input.
pub fn prepare_images<B: Backend>(images: Tensor<B, 4>, size: usize) -> Result<Tensor<B, 4>> {
    let [_, channels, height, width] = images.dims();
    let images = match channels {
        3 => images,
        1 => images.repeat_dim(1, 3),
        _ => {
            return Err(GanError::data(format!(
                "the classifier needs 1 or 3 channel images, got {channels}"
            )))
        }
    };
    if (height, width) == (size, size) {
        return Ok(images);
    }
    Ok(interpolate(
        images,
        [size, size],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    ))
}

impl<B, M, D> GanTrainer<B, M, D>
where
    B: AutodiffBackend,
    M: GanModel,
    D: GanDataset,
{
    /// `checkpoint` may name a checkpoint directory or a save directory; `None` picks the
    /// latest checkpoint of this experiment.
    pub fn resolve_checkpoint(&self, checkpoint: Option<&Path>) -> Result<PathBuf> {
        let save_dir = self.save_dir();
        let checkpoint = resolve_checkpoint(checkpoint.unwrap_or(save_dir.as_path()))?;
        if !checkpoint.join(GENERATOR_EMA).with_extension("mpk").is_file() {
            return Err(GanError::CheckpointNotFound(checkpoint));
        }
        Ok(checkpoint)
    }

    /// Restores the moving-average generator of `checkpoint` on the inner backend.
    pub fn load_eval_generator(&self, checkpoint: &Path) -> Result<M::Generator<B::InnerBackend>> {
        let device = self.device();
        let generator = self
            .model()
            .init_generator::<B::InnerBackend>(device)
            .load_file(checkpoint.join(GENERATOR_EMA), &CheckpointRecorder::new(), device)?;
        Ok(generator)
    }

    /// Classifies `ceil(num_comp / batch_size)` batches of real test images and as many
    /// generated ones, keeping the first `num_comp` rows of each output.
    pub fn get_activations<C>(
        &self,
        num_comp: usize,
        checkpoint: Option<&Path>,
        classifier: &C,
    ) -> Result<Activations>
    where
        C: FeatureClassifier<B::InnerBackend>,
    {
        let checkpoint = self.resolve_checkpoint(checkpoint)?;
        tracing::info!(checkpoint = %checkpoint.display(), num_comp, "collecting activations");

        let model = self.model();
        let device = self.device();
        let size = self.config().classifier_size;
        let generator = self.load_eval_generator(&checkpoint)?;

        let feed = TestFeed::<B::InnerBackend>::new(
            self.dataset(),
            FeedOptions {
                batch_size: model.batch_size(),
                image_shape: model.image_shape(),
                seed: self.config().seed,
                prefetch: self.config().prefetch,
            },
            device,
        )?;
        if feed.num_samples() < num_comp {
            return Err(GanError::data(format!(
                "test split holds {} samples, {num_comp} requested",
                feed.num_samples()
            )));
        }
        let num_batches = num_comp.div_ceil(model.batch_size());

        let mut real = Rows::default();
        let mut fake = Rows::default();
        let mut fake_logits = Rows::default();
        let mut batches = 0;
        for batch in feed.iter().take(num_batches) {
            let noise = sample_noise(batch.size(), device);
            let generated = model.generate(&generator, noise);

            let real_out = classifier.classify(prepare_images(batch.images, size)?)?;
            let fake_out = classifier.classify(prepare_images(generated, size)?)?;

            real.push(real_out.pool)?;
            fake.push(fake_out.pool)?;
            fake_logits.push(fake_out.logits)?;
            batches += 1;
        }

        Ok(Activations {
            real: real.into_matrix(num_comp),
            fake: fake.into_matrix(num_comp),
            fake_logits: fake_logits.into_matrix(num_comp),
            batches,
        })
    }

    /// `(FID, Inception Score)` of one checkpoint.
    pub fn test_gan<C>(
        &self,
        num_comp: usize,
        checkpoint: Option<&Path>,
        classifier: &C,
    ) -> Result<(f64, f64)>
    where
        C: FeatureClassifier<B::InnerBackend>,
    {
        let acts = self.get_activations(num_comp, checkpoint, classifier)?;
        let fid = frechet_distance(&acts.real, &acts.fake)?;
        let is = inception_score(&acts.fake_logits)?;
        Ok((fid, is))
    }

    /// Evaluates every checkpoint of this experiment.
    pub fn sweep<C>(&self, num_comp: usize, classifier: &C) -> Result<SweepReport>
    where
        C: FeatureClassifier<B::InnerBackend>,
    {
        let all = self.checkpoints().all()?;
        if all.is_empty() {
            return Err(GanError::CheckpointNotFound(self.save_dir()));
        }

        let mut checkpoints = Vec::with_capacity(all.len());
        for checkpoint in all {
            let (fid, is) = self.test_gan(num_comp, Some(&checkpoint), classifier)?;
            tracing::info!(checkpoint = %checkpoint.display(), fid, is, "FID: {fid}  IS: {is}");
            checkpoints.push((checkpoint, fid, is));
        }

        let fids = checkpoints.iter().map(|(_, fid, _)| *fid).collect::<Vec<_>>();
        let scores = checkpoints.iter().map(|(_, _, is)| *is).collect::<Vec<_>>();
        let fid = MetricSummary::from_values(&fids)
            .ok_or_else(|| GanError::CheckpointNotFound(self.save_dir()))?;
        let inception_score = MetricSummary::from_values(&scores)
            .ok_or_else(|| GanError::CheckpointNotFound(self.save_dir()))?;

        Ok(SweepReport {
            checkpoints,
            fid,
            inception_score,
        })
    }

    /// `("{mean}+-{std}" of FID, "{mean}+-{std}" of Inception Score)` over all checkpoints.
    pub fn test_gan_all<C>(&self, num_comp: usize, classifier: &C) -> Result<(String, String)>
    where
        C: FeatureClassifier<B::InnerBackend>,
    {
        let report = self.sweep(num_comp, classifier)?;
        Ok((report.fid.to_string(), report.inception_score.to_string()))
    }
}
