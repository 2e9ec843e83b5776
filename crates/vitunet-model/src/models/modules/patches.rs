//! Patch tokenization and token folding.

use burn::{
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    prelude::*,
};

use crate::config::TokenPlan;

/// Splits an image into non-overlapping square patches.
///
/// Each patch is flattened in `[row, col, channel]` order.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: `[batch_size, (height / p) * (width / p), p * p * channels]`
#[derive(Module, Clone, Debug)]
pub struct Patches {
    patch_size: usize,
}

impl Patches {
    /// Square patches of side `patch_size`.
    pub const fn new(patch_size: usize) -> Self {
        Self { patch_size }
    }

    /// # Shapes
    ///   - input: `[batch_size, channels, height, width]`
    ///   - output: `[batch_size, num_patches, patch_size * patch_size * channels]`
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch_size, channels, height, width] = x.dims();
        let p = self.patch_size;
        let (rows, cols) = (height / p, width / p);

        let x: Tensor<B, 6> = x.reshape([batch_size, channels, rows, p, cols, p]);
        x.permute([0, 2, 4, 3, 5, 1])
            .reshape([batch_size, rows * cols, p * p * channels])
    }
}

/// Configuration for the [`PatchEncoder`] module.
#[derive(Config, Debug)]
pub struct PatchEncoderConfig {
    /// Number of patches per image.
    num_patches: usize,
    /// Flattened patch length.
    patch_dim: usize,
    /// Token width.
    projection_dim: usize,
}

impl PatchEncoderConfig {
    /// Sizes the encoder from the planned token geometry.
    pub fn from_plan(tokens: &TokenPlan) -> Self {
        Self::new(tokens.num_patches, tokens.patch_dim, tokens.projection_dim)
    }

    /// Initializes a new `PatchEncoder` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> PatchEncoder<B> {
        PatchEncoder {
            projection: LinearConfig::new(self.patch_dim, self.projection_dim).init(device),
            position_embedding: EmbeddingConfig::new(self.num_patches, self.projection_dim)
                .init(device),
            num_patches: self.num_patches,
        }
    }
}

/// Linear patch projection plus a learned embedding per patch position.
///
/// # Shapes
///   - input: `[batch_size, num_patches, patch_dim]`
///   - output: `[batch_size, num_patches, projection_dim]`
#[derive(Module, Debug)]
pub struct PatchEncoder<B: Backend> {
    projection: Linear<B>,
    position_embedding: Embedding<B>,
    num_patches: usize,
}

impl<B: Backend> PatchEncoder<B> {
    /// Projects flattened patches to `projection_dim` and adds position embeddings.
    pub fn forward(&self, patches: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = patches.device();
        let positions = Tensor::<B, 1, Int>::arange(0..self.num_patches as i64, &device)
            .reshape([1, self.num_patches]);

        self.projection.forward(patches) + self.position_embedding.forward(positions)
    }
}

/// Reinterpret a token sequence as a channels-first feature map on a `size` grid.
///
/// The token buffer is read as `[size[0], size[1], channels]` row-major, with
/// `channels = num_patches * projection_dim / (size[0] * size[1])`. The grid
/// must divide the element count, which the shape plan guarantees.
///
/// # Shapes
///   - input: `[batch_size, num_patches, projection_dim]`
///   - output: `[batch_size, channels, size[0], size[1]]`
pub fn fold_tokens<B: Backend>(tokens: Tensor<B, 3>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch_size, num_patches, projection_dim] = tokens.dims();
    let channels = num_patches * projection_dim / (size[0] * size[1]);

    tokens
        .reshape([batch_size, size[0], size[1], channels])
        .permute([0, 3, 1, 2])
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, TensorData};
    use rstest::rstest;

    use super::*;
    use crate::tests::TestBackend;

    #[rstest]
    #[case(32, 32, 3, 8, 16, 192)]
    #[case(192, 256, 3, 8, 768, 192)]
    #[case(32, 64, 1, 16, 8, 256)]
    fn patches_cover_non_square_images(
        #[case] height: usize,
        #[case] width: usize,
        #[case] channels: usize,
        #[case] patch_size: usize,
        #[case] num_patches: usize,
        #[case] patch_dim: usize,
    ) {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([2, channels, height, width], &device);

        let tokens = Patches::new(patch_size).forward(x);

        assert_eq!(tokens.dims(), [2, num_patches, patch_dim]);
    }

    #[test]
    fn patch_is_flattened_row_then_column_then_channel() {
        let device = Default::default();
        // Two channels on a 2x4 image: channel 0 holds 0..8, channel 1 holds 10..18.
        let values: Vec<f32> = (0..8).chain(10..18).map(|v| v as f32).collect();
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(values, [1, 2, 2, 4]), &device);

        let tokens = Patches::new(2).forward(x);

        let expected = TensorData::from([[
            [0.0f32, 10.0, 1.0, 11.0, 4.0, 14.0, 5.0, 15.0],
            [2.0, 12.0, 3.0, 13.0, 6.0, 16.0, 7.0, 17.0],
        ]]);
        tokens.into_data().assert_eq(&expected, false);
    }

    #[test]
    fn patch_encoder_projects_and_adds_positions() {
        let device = Default::default();
        let encoder = PatchEncoderConfig::new(16, 192, 64).init::<TestBackend>(&device);

        let patches = Tensor::<TestBackend, 3>::random(
            [3, 16, 192],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(encoder.forward(patches).dims(), [3, 16, 64]);
    }

    #[test]
    fn identical_patches_differ_by_position() {
        let device = Default::default();
        let encoder = PatchEncoderConfig::new(4, 12, 8).init::<TestBackend>(&device);

        let tokens = encoder.forward(Tensor::<TestBackend, 3>::ones([1, 4, 12], &device));
        let first = tokens.clone().slice([0..1, 0..1, 0..8]);
        let second = tokens.slice([0..1, 1..2, 0..8]);

        assert!((first - second).abs().sum().into_scalar() > 0.0);
    }

    #[rstest]
    #[case(16, 64, [16, 16], 4)]
    #[case(768, 64, [96, 128], 4)]
    #[case(768, 64, [12, 16], 256)]
    fn fold_channels_follow_token_budget(
        #[case] num_patches: usize,
        #[case] projection_dim: usize,
        #[case] size: [usize; 2],
        #[case] channels: usize,
    ) {
        let device = Default::default();
        let tokens = Tensor::<TestBackend, 3>::zeros([2, num_patches, projection_dim], &device);

        assert_eq!(
            fold_tokens(tokens, size).dims(),
            [2, channels, size[0], size[1]]
        );
    }

    #[test]
    fn fold_reads_tokens_as_channels_last_grid() {
        let device = Default::default();
        // Two tokens of width 4 folded onto 2x2 gives 2 channels.
        let tokens = Tensor::<TestBackend, 3>::from_data(
            TensorData::new((0..8).map(|v| v as f32).collect::<Vec<_>>(), [1, 2, 4]),
            &device,
        );

        let folded = fold_tokens(tokens, [2, 2]);

        let expected = TensorData::from([[[[0.0f32, 2.0], [4.0, 6.0]], [[1.0, 3.0], [5.0, 7.0]]]]);
        folded.into_data().assert_eq(&expected, false);
    }
}
