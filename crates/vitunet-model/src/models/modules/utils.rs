use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::config::InterpolationStrategy;

/// Resize `tensor` to `size` (`[height, width]`) with the configured strategy.
pub fn intelligent_interpolate<B: Backend>(
    tensor: Tensor<B, 4>,
    size: [usize; 2],
    strategy: &InterpolationStrategy,
) -> Tensor<B, 4> {
    let interpolate_mode = match strategy {
        InterpolationStrategy::Bilinear => InterpolateMode::Bilinear,
        InterpolationStrategy::Nearest => InterpolateMode::Nearest,
    };

    interpolate(tensor, size, InterpolateOptions::new(interpolate_mode))
}

/// Double the spatial resolution of `tensor`.
pub fn upsample2x<B: Backend>(tensor: Tensor<B, 4>, strategy: &InterpolationStrategy) -> Tensor<B, 4> {
    let [_, _, h, w] = tensor.dims();
    intelligent_interpolate(tensor, [h * 2, w * 2], strategy)
}
