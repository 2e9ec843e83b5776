use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use super::{SqueezeExcite, SqueezeExciteConfig};
use crate::config::{BlockConfig, BlockPlan};

/// Configuration for the [`ConvBlock`] module.
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    /// Number of input channels.
    in_channels: usize,
    /// Number of output channels of both convolutions.
    filters: usize,
    /// Squeeze-excite reduction ratio.
    #[config(default = "8")]
    se_ratio: usize,
    /// Batch norm epsilon.
    #[config(default = "1e-3")]
    norm_epsilon: f64,
    /// Batch norm momentum.
    #[config(default = "0.01")]
    norm_momentum: f64,
}

impl ConvBlockConfig {
    /// Configuration for a planned block.
    pub fn from_plan(block: &BlockPlan, settings: &BlockConfig) -> Self {
        Self::new(block.in_channels, block.out_channels)
            .with_se_ratio(settings.se_ratio)
            .with_norm_epsilon(settings.norm_epsilon)
            .with_norm_momentum(settings.norm_momentum)
    }

    /// Initializes a new `ConvBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvBlock<B> {
        let conv = |in_channels: usize| {
            Conv2dConfig::new([in_channels, self.filters], [3, 3])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let bn = || {
            BatchNormConfig::new(self.filters)
                .with_epsilon(self.norm_epsilon)
                .with_momentum(self.norm_momentum)
                .init(device)
        };

        ConvBlock {
            conv1: conv(self.in_channels),
            bn1: bn(),
            conv2: conv(self.filters),
            bn2: bn(),
            relu: Relu::new(),
            se: SqueezeExciteConfig::new(self.filters)
                .with_ratio(self.se_ratio)
                .init(device),
        }
    }
}

/// Two `3x3 conv -> batch norm -> ReLU` stages followed by squeeze-excite.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, filters, height, width]`
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    relu: Relu,
    se: SqueezeExcite<B>,
}

impl<B: Backend> ConvBlock<B> {
    /// # Shapes
    ///   - input: `[batch_size, in_channels, height, width]`
    ///   - output: `[batch_size, filters, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let x = self.relu.forward(self.bn2.forward(self.conv2.forward(x)));

        self.se.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;
    use rstest::rstest;

    use super::*;
    use crate::tests::TestBackend;

    #[rstest]
    #[case(3, 32, 16, 24)]
    #[case(36, 64, 8, 8)]
    #[case(164, 32, 4, 6)]
    fn conv_block_maps_channels_and_keeps_resolution(
        #[case] in_channels: usize,
        #[case] filters: usize,
        #[case] height: usize,
        #[case] width: usize,
    ) {
        let device = Default::default();
        let block = ConvBlockConfig::new(in_channels, filters).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [2, in_channels, height, width],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(block.forward(input).dims(), [2, filters, height, width]);
    }

    #[test]
    fn output_is_non_negative() {
        // ReLU followed by a sigmoid gate cannot produce negative values.
        let device = Default::default();
        let block = ConvBlockConfig::new(3, 16).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert!(block.forward(input).min().into_scalar() >= 0.0);
    }
}
