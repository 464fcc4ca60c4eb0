#![allow(dead_code)]

use std::path::Path;

use burn::{
    backend::{Autodiff, NdArray},
    tensor::TensorData,
};
use gan_trainer::{DcganModel, GanDataset, GanTrainer, ModelConfig, Result, TrainerConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub type TestBackend = Autodiff<NdArray<f32>>;

pub const IMAGE_SHAPE: [usize; 3] = [3, 8, 8];

/// Uniform noise images in `[-1, 1]` with labels cycling over 3 classes.
pub struct ToyDataset {
    pub num_train: usize,
    pub num_test: usize,
}

impl ToyDataset {
    pub fn new(num_train: usize, num_test: usize) -> Self {
        Self {
            num_train,
            num_test,
        }
    }

    fn split(&self, num: usize, seed: u64) -> (TensorData, TensorData) {
        let [c, h, w] = IMAGE_SHAPE;
        let mut rng = StdRng::seed_from_u64(seed);
        let pixels = (0..num * c * h * w)
            .map(|_| rng.random::<f32>() * 2.0 - 1.0)
            .collect::<Vec<_>>();
        let labels = (0..num as i64).map(|i| i % 3).collect::<Vec<_>>();
        (
            TensorData::new(pixels, [num, c, h, w]),
            TensorData::new(labels, [num]),
        )
    }
}

impl GanDataset for ToyDataset {
    fn name(&self) -> &str {
        "toy"
    }

    fn num_train(&self) -> usize {
        self.num_train
    }

    fn num_test(&self) -> usize {
        self.num_test
    }

    fn get_data_train(&self) -> Result<(TensorData, TensorData)> {
        Ok(self.split(self.num_train, 1))
    }

    fn get_data_test(&self) -> Result<(TensorData, TensorData)> {
        Ok(self.split(self.num_test, 2))
    }
}

pub fn toy_model(batch_size: usize) -> DcganModel {
    ModelConfig::for_images(IMAGE_SHAPE, 4)
        .with_batch_size(batch_size)
        .init()
}

pub fn toy_config(log_dir: &Path, num_train_steps: usize, n_disc: usize) -> TrainerConfig {
    TrainerConfig::new(log_dir.to_string_lossy().into_owned())
        .with_num_train_steps(num_train_steps)
        .with_n_disc(n_disc)
        .with_prefetch(4)
        .with_classifier_size(16)
}

pub fn toy_trainer(
    log_dir: &Path,
    num_train_steps: usize,
    n_disc: usize,
) -> GanTrainer<TestBackend, DcganModel, ToyDataset> {
    GanTrainer::new(
        toy_model(4),
        ToyDataset::new(12, 10),
        toy_config(log_dir, num_train_steps, n_disc),
        Default::default(),
    )
    .unwrap()
}
