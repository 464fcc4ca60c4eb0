pub mod discriminator;
pub mod generator;
mod layers;

use burn::{
    module::Module,
    nn::loss::BinaryCrossEntropyLossConfig,
    prelude::*,
};

use crate::model::{
    discriminator::{Discriminator, DiscriminatorConfig},
    generator::{Generator, GeneratorConfig},
};

/// Discriminator predictions plus named auxiliary activations (flattened to `[N, F]`).
#[derive(Clone, Debug)]
pub struct DiscOutput<B: Backend> {
    pub preds: Tensor<B, 2>,
    pub layers: Vec<(String, Tensor<B, 2>)>,
}

impl<B: Backend> DiscOutput<B> {
    pub fn new(preds: Tensor<B, 2>) -> Self {
        Self {
            preds,
            layers: Vec::new(),
        }
    }
}

/// The generator/discriminator pair the trainer drives.
///
/// Networks are generic over the backend so that training runs them under autodiff
/// and evaluation runs their `valid()` counterparts.
pub trait GanModel {
    type Generator<B: Backend>: Module<B>;
    type Discriminator<B: Backend>: Module<B>;

    fn name(&self) -> &str;
    fn batch_size(&self) -> usize;
    /// `[C, H, W]`
    fn image_shape(&self) -> [usize; 3];

    fn init_generator<B: Backend>(&self, device: &B::Device) -> Self::Generator<B>;
    fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Self::Discriminator<B>;

    /// `noise [N, 128]` -> `images [N, C, H, W]`
    fn generate<B: Backend>(&self, generator: &Self::Generator<B>, noise: Tensor<B, 2>)
        -> Tensor<B, 4>;
    fn discriminate<B: Backend>(
        &self,
        discriminator: &Self::Discriminator<B>,
        images: Tensor<B, 4>,
    ) -> DiscOutput<B>;

    fn g_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>) -> Tensor<B, 1>;
    fn d_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>, preds_real: Tensor<B, 2>)
        -> Tensor<B, 1>;
}

// ////////////////////////////////////////////////////////////////////////////
// Reference DCGAN
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub generator_config: GeneratorConfig,
    pub discriminator_config: DiscriminatorConfig,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = "String::from(\"dcgan\")")]
    pub name: String,
}
impl ModelConfig {
    /// Both networks sized for `[C, H, W]` images with `base_channels` feature maps.
    pub fn for_images(image_shape: [usize; 3], base_channels: usize) -> Self {
        Self::new(
            GeneratorConfig::new(image_shape).with_base_channels(base_channels),
            DiscriminatorConfig::new(image_shape).with_base_channels(base_channels),
        )
    }

    pub fn init(&self) -> DcganModel {
        DcganModel {
            config: self.clone(),
        }
    }
}

/// Non-saturating GAN with a pixel-shuffle generator and a strided conv discriminator.
#[derive(Debug, Clone)]
pub struct DcganModel {
    config: ModelConfig,
}

fn bce<B: Backend, const D: usize>(logits: Tensor<B, D>, target: i64) -> Tensor<B, 1> {
    let device = logits.device();
    let targets = logits.ones_like().int().mul_scalar(target);
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init::<B>(&device)
        .forward(logits, targets)
}

impl GanModel for DcganModel {
    type Generator<B: Backend> = Generator<B>;
    type Discriminator<B: Backend> = Discriminator<B>;

    fn name(&self) -> &str {
        &self.config.name
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn image_shape(&self) -> [usize; 3] {
        self.config.generator_config.image_shape
    }

    fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.config.generator_config.init(device)
    }

    fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.config.discriminator_config.init(device)
    }

    fn generate<B: Backend>(&self, generator: &Generator<B>, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        generator.forward(noise)
    }

    fn discriminate<B: Backend>(
        &self,
        discriminator: &Discriminator<B>,
        images: Tensor<B, 4>,
    ) -> DiscOutput<B> {
        let (preds, features) = discriminator.forward(images);
        DiscOutput {
            preds,
            layers: vec![("features".to_string(), features)],
        }
    }

    fn g_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>) -> Tensor<B, 1> {
        bce(preds_fake, 1)
    }

    fn d_loss<B: Backend>(&self, preds_fake: Tensor<B, 2>, preds_real: Tensor<B, 2>) -> Tensor<B, 1> {
        (bce(preds_fake, 0) + bce(preds_real, 1)) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn losses_favour_the_right_side() {
        let model = ModelConfig::for_images([1, 4, 4], 2).init();
        let device = Default::default();

        let confident_real = Tensor::<TestBackend, 2>::full([4, 1], 5.0, &device);
        let confident_fake = Tensor::<TestBackend, 2>::full([4, 1], -5.0, &device);

        let fooled = model.g_loss(confident_real.clone()).into_scalar();
        let caught = model.g_loss(confident_fake.clone()).into_scalar();
        assert!(fooled < caught);

        let sharp = model
            .d_loss(confident_fake.clone(), confident_real.clone())
            .into_scalar();
        let confused = model.d_loss(confident_real, confident_fake).into_scalar();
        assert!(sharp < 0.01);
        assert!(confused > 4.0);
    }

    #[test]
    fn discriminator_scores_one_logit_per_image() {
        let model = ModelConfig::for_images([3, 8, 8], 4)
            .with_batch_size(2)
            .init();
        let device = Default::default();
        let discriminator = model.init_discriminator::<TestBackend>(&device);

        let out = model.discriminate(&discriminator, Tensor::zeros([2, 3, 8, 8], &device));
        assert_eq!(out.preds.dims(), [2, 1]);
        assert_eq!(out.layers.len(), 1);
        assert_eq!(out.layers[0].1.dims(), [2, 16 * 2 * 2]);
    }
}
