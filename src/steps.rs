//! The two adversarial steps.
//!
//! Each step runs in two phases: `forward` evaluates the networks, which commits batch norm
//! running statistics, and `finish` turns the resulting predictions into a loss. Both
//! discriminator evaluations of a step borrow the same discriminator parameters.
//!
//! The generator step has to be constructed first: constructing it hands out the
//! [`DiscriminatorCreated`] token that the discriminator step consumes.
//!
//! ```compile_fail
//! use gan_trainer::{
//!     model::{DcganModel, ModelConfig},
//!     steps::{DiscriminatorCreated, DiscriminatorStep},
//! };
//!
//! let model = ModelConfig::for_images([3, 8, 8], 4).init();
//! // Tokens only come from `GeneratorStep::new`.
//! let d_step = DiscriminatorStep::<DcganModel>::new(&model, DiscriminatorCreated { _private: () });
//! ```

use std::marker::PhantomData;

use burn::tensor::{backend::Backend, Distribution, Tensor};

use crate::{
    data::TrainFeed,
    error::{GanError, Result},
    model::GanModel,
};

/// Width of the noise vectors fed to the generator.
pub const NOISE_DIM: usize = 128;

/// Standard normal noise of shape `[batch_size, NOISE_DIM]`.
pub fn sample_noise<B: Backend>(batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::random([batch_size, NOISE_DIM], Distribution::Normal(0.0, 1.0), device)
}

/// Proof that the discriminator parameter set has been claimed by a generator step.
#[derive(Debug)]
pub struct DiscriminatorCreated {
    _private: (),
}

/// Predictions of one step; batch norm statistics are already committed.
pub struct Forward<B: Backend> {
    preds_fake: Tensor<B, 2>,
    preds_real: Option<Tensor<B, 2>>,
    layers: Vec<(String, Tensor<B, 2>)>,
    fake: Tensor<B, 4>,
    real: Option<Tensor<B, 4>>,
}

#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Named discriminator activations, `[N, F]` each.
    pub layers: Vec<(String, Tensor<B, 2>)>,
    pub fake: Tensor<B, 4>,
    /// The real batch, for the discriminator step only.
    pub real: Option<Tensor<B, 4>>,
}

pub struct GeneratorStep<M> {
    batch_size: usize,
    _model: PhantomData<fn(&M)>,
}

impl<M: GanModel> GeneratorStep<M> {
    pub fn new(model: &M) -> (Self, DiscriminatorCreated) {
        let step = Self {
            batch_size: model.batch_size(),
            _model: PhantomData,
        };
        (step, DiscriminatorCreated { _private: () })
    }

    pub fn forward<B: Backend>(
        &self,
        model: &M,
        generator: &M::Generator<B>,
        discriminator: &M::Discriminator<B>,
        device: &B::Device,
    ) -> Forward<B> {
        let noise = sample_noise(self.batch_size, device);
        let fake = model.generate(generator, noise);
        let out = model.discriminate(discriminator, fake.clone());

        Forward {
            preds_fake: out.preds,
            preds_real: None,
            layers: out.layers,
            fake,
            real: None,
        }
    }

    pub fn finish<B: Backend>(&self, model: &M, forward: Forward<B>) -> StepOutput<B> {
        StepOutput {
            loss: model.g_loss(forward.preds_fake),
            layers: forward.layers,
            fake: forward.fake,
            real: forward.real,
        }
    }

    pub fn run<B: Backend>(
        &self,
        model: &M,
        generator: &M::Generator<B>,
        discriminator: &M::Discriminator<B>,
        device: &B::Device,
    ) -> StepOutput<B> {
        let forward = self.forward(model, generator, discriminator, device);
        self.finish(model, forward)
    }
}

pub struct DiscriminatorStep<M> {
    batch_size: usize,
    image_shape: [usize; 3],
    _model: PhantomData<fn(&M)>,
}

impl<M: GanModel> DiscriminatorStep<M> {
    pub fn new(model: &M, _created: DiscriminatorCreated) -> Self {
        Self {
            batch_size: model.batch_size(),
            image_shape: model.image_shape(),
            _model: PhantomData,
        }
    }

    /// Draws one real batch and one independent fake batch and scores both.
    pub fn forward<B: Backend>(
        &self,
        model: &M,
        generator: &M::Generator<B>,
        discriminator: &M::Discriminator<B>,
        feed: &mut TrainFeed<B>,
        device: &B::Device,
    ) -> Result<Forward<B>> {
        let real = feed.next_batch()?.images;
        let [c, h, w] = self.image_shape;
        if real.dims() != [self.batch_size, c, h, w] {
            return Err(GanError::data(format!(
                "real batch has shape {:?}, expected {:?}",
                real.dims(),
                [self.batch_size, c, h, w]
            )));
        }

        let noise = sample_noise(self.batch_size, device);
        let fake = model.generate(generator, noise).detach();

        let fake_out = model.discriminate(discriminator, fake.clone());
        let real_out = model.discriminate(discriminator, real.clone());

        Ok(Forward {
            preds_fake: fake_out.preds,
            preds_real: Some(real_out.preds),
            layers: real_out.layers,
            fake,
            real: Some(real),
        })
    }

    pub fn finish<B: Backend>(&self, model: &M, forward: Forward<B>) -> Result<StepOutput<B>> {
        let preds_real = forward
            .preds_real
            .ok_or_else(|| GanError::data("discriminator step ran without a real batch"))?;
        Ok(StepOutput {
            loss: model.d_loss(forward.preds_fake, preds_real),
            layers: forward.layers,
            fake: forward.fake,
            real: forward.real,
        })
    }

    pub fn run<B: Backend>(
        &self,
        model: &M,
        generator: &M::Generator<B>,
        discriminator: &M::Discriminator<B>,
        feed: &mut TrainFeed<B>,
        device: &B::Device,
    ) -> Result<StepOutput<B>> {
        let forward = self.forward(model, generator, discriminator, feed, device)?;
        self.finish(model, forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{FeedOptions, GanDataset},
        model::ModelConfig,
    };
    use burn::{backend::NdArray, tensor::TensorData};

    type TestBackend = NdArray<f32>;

    struct Constant {
        num: usize,
    }

    impl GanDataset for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn num_train(&self) -> usize {
            self.num
        }

        fn num_test(&self) -> usize {
            self.num
        }

        fn get_data_train(&self) -> Result<(TensorData, TensorData)> {
            Ok((
                TensorData::new(vec![0.5f32; self.num * 3 * 8 * 8], [self.num, 3, 8, 8]),
                TensorData::new(vec![0i64; self.num], [self.num]),
            ))
        }

        fn get_data_test(&self) -> Result<(TensorData, TensorData)> {
            self.get_data_train()
        }
    }

    #[test]
    fn steps_produce_scalar_losses_and_batches() {
        let device = Default::default();
        let model = ModelConfig::for_images([3, 8, 8], 4)
            .with_batch_size(2)
            .init();
        let generator = model.init_generator::<TestBackend>(&device);
        let discriminator = model.init_discriminator::<TestBackend>(&device);

        let (g_step, created) = GeneratorStep::new(&model);
        let d_step = DiscriminatorStep::new(&model, created);

        let g_out = g_step.run::<TestBackend>(&model, &generator, &discriminator, &device);
        assert_eq!(g_out.loss.dims(), [1]);
        assert_eq!(g_out.fake.dims(), [2, 3, 8, 8]);
        assert!(g_out.real.is_none());

        let options = FeedOptions {
            batch_size: 2,
            image_shape: [3, 8, 8],
            seed: 1,
            prefetch: 1,
        };
        let mut feed = TrainFeed::<TestBackend>::new(&Constant { num: 3 }, options, &device).unwrap();
        let d_out = d_step
            .run(&model, &generator, &discriminator, &mut feed, &device)
            .unwrap();
        assert_eq!(d_out.loss.dims(), [1]);
        assert!(d_out.loss.into_scalar().is_finite());
        assert_eq!(d_out.real.map(|r| r.dims()), Some([2, 3, 8, 8]));
        assert_eq!(d_out.layers[0].0, "features");
    }

    #[test]
    fn discriminator_step_rejects_mismatched_batches() {
        let device = Default::default();
        // The feed serves batches of 2 while the model expects 4.
        let model = ModelConfig::for_images([3, 8, 8], 4)
            .with_batch_size(4)
            .init();
        let generator = model.init_generator::<TestBackend>(&device);
        let discriminator = model.init_discriminator::<TestBackend>(&device);
        let (_, created) = GeneratorStep::new(&model);
        let d_step = DiscriminatorStep::new(&model, created);

        let options = FeedOptions {
            batch_size: 2,
            image_shape: [3, 8, 8],
            seed: 1,
            prefetch: 1,
        };
        let mut feed = TrainFeed::<TestBackend>::new(&Constant { num: 3 }, options, &device).unwrap();
        let result = d_step.run(&model, &generator, &discriminator, &mut feed, &device);
        assert!(matches!(result, Err(GanError::Data(_))));
    }
}
