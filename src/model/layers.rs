use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, PRelu, PReluConfig,
        PaddingConfig2d,
    },
    prelude::*,
};

/// Halves the spatial resolution with a 4x4 strided convolution.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
    lrelu: LeakyRelu,
}
impl<B: Backend> DownBlock<B> {
    pub fn new(channels: [usize; 2], normalize: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [4, 4])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(!normalize)
            .init(device);
        let norm = normalize.then(|| BatchNormConfig::new(channels[1]).init(device));
        let lrelu = LeakyReluConfig::new().with_negative_slope(0.2).init();

        Self { conv, norm, lrelu }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut output = self.conv.forward(input);
        if let Some(norm) = &self.norm {
            output = norm.forward(output);
        }
        self.lrelu.forward(output)
    }
}

/// Conv, pixel shuffle by `factor`, batch norm, PReLU.
#[derive(Module, Debug)]
pub struct UpscaleBlock<B: Backend> {
    conv: Conv2d<B>,
    shuffle: PixelShuffle,
    norm: BatchNorm<B, 2>,
    prelu: PRelu<B>,
}
impl<B: Backend> UpscaleBlock<B> {
    pub fn new(channels: [usize; 2], factor: usize, device: &B::Device) -> Self {
        let [in_channels, out_channels] = channels;
        let conv = Conv2dConfig::new([in_channels, out_channels * factor * factor], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            shuffle: PixelShuffle::new(factor),
            norm: BatchNormConfig::new(out_channels).init(device),
            prelu: PReluConfig::new().init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = self.shuffle.forward(output);
        let output = self.norm.forward(output);
        self.prelu.forward(output)
    }
}

/// Moves `factor * factor` channel groups into space: `[N, C r^2, H, W] -> [N, C, H r, W r]`.
#[derive(Module, Debug, Clone)]
pub struct PixelShuffle {
    factor: usize,
}
impl PixelShuffle {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }

    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let r = self.factor;
        let [batch_size, channels, height, width] = input.dims();

        input
            .reshape([batch_size, channels / (r * r), r, r, height, width])
            // [N, C, r_h, r_w, H, W] -> [N, C, H, r_h, W, r_w]
            .permute([0, 1, 4, 2, 5, 3])
            .reshape([batch_size, channels / (r * r), height * r, width * r])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn pixel_shuffle_interleaves_channels() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1, Int>::arange(1..5, &device)
            .float()
            .reshape([1, 4, 1, 1])
            .repeat_dim(2, 2)
            .repeat_dim(3, 2);

        let output = PixelShuffle::new(2).forward(input);

        assert_eq!(output.dims(), [1, 1, 4, 4]);
        let values = output.into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            values,
            vec![
                1.0, 2.0, 1.0, 2.0, //
                3.0, 4.0, 3.0, 4.0, //
                1.0, 2.0, 1.0, 2.0, //
                3.0, 4.0, 3.0, 4.0,
            ]
        );
    }

    #[test]
    fn blocks_change_resolution() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::zeros([2, 8, 4, 4], &device);

        let up = UpscaleBlock::new([8, 6], 2, &device);
        assert_eq!(up.forward(input.clone()).dims(), [2, 6, 8, 8]);

        let down = DownBlock::new([8, 16], true, &device);
        assert_eq!(down.forward(input.clone()).dims(), [2, 16, 2, 2]);
        let plain = DownBlock::new([8, 16], false, &device);
        assert_eq!(plain.forward(input).dims(), [2, 16, 2, 2]);
    }
}
