use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Sigmoid,
    },
    prelude::*,
};

/// Configuration for the [`OutputBlock`].
#[derive(Config, Debug)]
pub struct OutputBlockConfig {
    in_channels: usize,
}

impl OutputBlockConfig {
    /// Initializes a new `OutputBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> OutputBlock<B> {
        OutputBlock {
            conv: Conv2dConfig::new([self.in_channels, 1], [1, 1]).init(device),
            sigmoid: Sigmoid::new(),
        }
    }
}

/// `1x1` projection to a single channel followed by a sigmoid.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, 1, height, width]`, values in `[0, 1]`
#[derive(Module, Debug)]
pub struct OutputBlock<B: Backend> {
    conv: Conv2d<B>,
    sigmoid: Sigmoid,
}

impl<B: Backend> OutputBlock<B> {
    /// Maps `[batch_size, in_channels, height, width]` to a `[batch_size, 1, height, width]` mask.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.sigmoid.forward(self.conv.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn output_block_emits_single_channel_probabilities() {
        let device = Default::default();
        let block = OutputBlockConfig::new(32).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [2, 32, 8, 8],
            Distribution::Normal(0.0, 10.0),
            &device,
        );
        let output = block.forward(input);

        assert_eq!(output.dims(), [2, 1, 8, 8]);
        assert!(output.clone().min().into_scalar() >= 0.0);
        assert!(output.max().into_scalar() <= 1.0);
    }
}
