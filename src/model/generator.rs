use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PRelu, PReluConfig, PaddingConfig2d,
    },
    prelude::*,
};

use crate::model::layers::UpscaleBlock;

#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    in_layer: Linear<B>,
    batch_norm: BatchNorm<B, 2>,
    prelu: PRelu<B>,
    up_layer_1: UpscaleBlock<B>,
    up_layer_2: UpscaleBlock<B>,
    out_layer: Conv2d<B>,
    base_channels: usize,
    base_height: usize,
    base_width: usize,
}
impl<B: Backend> Generator<B> {
    /// `[N, noise_dim]` -> `[N, C, H, W]` in `[-1, 1]`
    pub fn forward(&self, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch_size, _] = noise.dims();

        let output = self.in_layer.forward(noise);
        let output = output.reshape([
            batch_size,
            self.base_channels,
            self.base_height,
            self.base_width,
        ]);
        let output = self.batch_norm.forward(output);
        let output = self.prelu.forward(output);

        let output = self.up_layer_1.forward(output);
        let output = self.up_layer_2.forward(output);

        let output = self.out_layer.forward(output);

        burn::tensor::activation::tanh(output)
    }
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// `[C, H, W]`; `H` and `W` must be multiples of 4.
    pub image_shape: [usize; 3],
    #[config(default = 128)]
    pub noise_dim: usize,
    /// Channels at the lowest resolution, halved by each upscale; at least 4.
    #[config(default = 64)]
    pub base_channels: usize,
}
impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let [channels, height, width] = self.image_shape;
        let base_height = height / 4;
        let base_width = width / 4;

        let in_layer = LinearConfig::new(
            self.noise_dim,
            self.base_channels * base_height * base_width,
        )
        .init(device);
        let batch_norm = BatchNormConfig::new(self.base_channels)
            .with_momentum(0.5)
            .init::<B, 2>(device);
        let prelu = PReluConfig::new().init(device);

        let up_layer_1 = UpscaleBlock::new([self.base_channels, self.base_channels / 2], 2, device);
        let up_layer_2 =
            UpscaleBlock::new([self.base_channels / 2, self.base_channels / 4], 2, device);

        let out_layer = Conv2dConfig::new([self.base_channels / 4, channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Generator {
            in_layer,
            batch_norm,
            prelu,
            up_layer_1,
            up_layer_2,
            out_layer,
            base_channels: self.base_channels,
            base_height,
            base_width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TestBackend = NdArray<f32>;

    #[test]
    fn produces_images_in_tanh_range() {
        let device = Default::default();
        let generator = GeneratorConfig::new([3, 8, 12])
            .with_base_channels(4)
            .init::<TestBackend>(&device);

        let noise =
            Tensor::<TestBackend, 2>::random([2, 128], Distribution::Normal(0.0, 1.0), &device);
        let images = generator.forward(noise);

        assert_eq!(images.dims(), [2, 3, 8, 12]);
        let values = images.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
