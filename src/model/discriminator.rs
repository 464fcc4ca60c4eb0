use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        LeakyRelu, LeakyReluConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
};

use crate::model::layers::DownBlock;

#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    in_layer: Conv2d<B>,
    down_1: DownBlock<B>,
    down_2: DownBlock<B>,
    out_layer: Linear<B>,
    lrelu: LeakyRelu,
}
impl<B: Backend> Discriminator<B> {
    /// Returns `(logits [N, 1], features [N, F])`.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let output = self.in_layer.forward(input);
        let output = self.lrelu.forward(output);

        let output = self.down_1.forward(output);
        let output = self.down_2.forward(output);

        let features: Tensor<B, 2> = output.flatten(1, 3);
        let logits = self.out_layer.forward(features.clone());

        (logits, features)
    }
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// `[C, H, W]`; `H` and `W` must be multiples of 4.
    pub image_shape: [usize; 3],
    #[config(default = 64)]
    pub base_channels: usize,
}
impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let [channels, height, width] = self.image_shape;
        let base = self.base_channels;

        let in_layer = Conv2dConfig::new([channels, base], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let down_1 = DownBlock::new([base, base * 2], true, device);
        let down_2 = DownBlock::new([base * 2, base * 4], true, device);

        let out_layer = LinearConfig::new(base * 4 * (height / 4) * (width / 4), 1).init(device);
        let lrelu = LeakyReluConfig::new().with_negative_slope(0.2).init();

        Discriminator {
            in_layer,
            down_1,
            down_2,
            out_layer,
            lrelu,
        }
    }
}
