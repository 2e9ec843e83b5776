use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Initializer, Linear, LinearConfig, Relu, Sigmoid,
    },
    prelude::*,
};

/// Configuration for the [`SqueezeExcite`] block.
#[derive(Config, Debug)]
pub struct SqueezeExciteConfig {
    /// Number of channels of the gated tensor.
    channels: usize,
    /// Channel reduction of the bottleneck.
    #[config(default = "8")]
    ratio: usize,
}

impl SqueezeExciteConfig {
    /// Initializes a new `SqueezeExcite` block.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> SqueezeExcite<B> {
        let reduced = self.channels / self.ratio;
        // He-normal, fan-in.
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: false,
        };

        SqueezeExcite {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            squeeze: LinearConfig::new(self.channels, reduced)
                .with_bias(false)
                .with_initializer(initializer.clone())
                .init(device),
            relu: Relu::new(),
            excite: LinearConfig::new(reduced, self.channels)
                .with_bias(false)
                .with_initializer(initializer)
                .init(device),
            sigmoid: Sigmoid::new(),
        }
    }
}

/// Channel attention: a per-channel gate computed from globally pooled features.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: `[batch_size, channels, height, width]`
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    squeeze: Linear<B>,
    relu: Relu,
    excite: Linear<B>,
    sigmoid: Sigmoid,
}

impl<B: Backend> SqueezeExcite<B> {
    /// Per-channel gate in `[0, 1]` with shape `[batch_size, channels]`.
    pub fn gate(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, _, _] = x.dims();
        let se = self.pool.forward(x).reshape([batch_size, channels]);
        let se = self.relu.forward(self.squeeze.forward(se));

        self.sigmoid.forward(self.excite.forward(se))
    }

    /// Rescales each channel of `x` by its gate; the shape is unchanged.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();
        let gate = self.gate(x.clone()).reshape([batch_size, channels, 1, 1]);

        x * gate
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn squeeze_excite_preserves_shape() {
        let device = Default::default();
        let se = SqueezeExciteConfig::new(32).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [2, 32, 8, 12],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(se.forward(input).dims(), [2, 32, 8, 12]);
    }

    #[test]
    fn gate_is_a_probability_per_channel() {
        let device = Default::default();
        let se = SqueezeExciteConfig::new(16)
            .with_ratio(4)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [3, 16, 4, 4],
            Distribution::Normal(0.0, 3.0),
            &device,
        );
        let gate = se.gate(input);

        assert_eq!(gate.dims(), [3, 16]);
        assert!(gate.clone().min().into_scalar() >= 0.0);
        assert!(gate.max().into_scalar() <= 1.0);
    }

    #[test]
    fn zero_input_stays_zero() {
        let device = Default::default();
        let se = SqueezeExciteConfig::new(8).init::<TestBackend>(&device);

        let output = se.forward(Tensor::<TestBackend, 4>::zeros([1, 8, 4, 4], &device));

        assert_eq!(output.abs().sum().into_scalar(), 0.0);
    }
}
