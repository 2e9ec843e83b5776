//! Core configuration structures for the Double ViT-UNet.
//!
//! `ModelConfig` aggregates one sub-configuration per architectural concern.
//! Every field has a default reproducing the reference architecture, so only
//! the input shape and the interpolation strategy are required.

use burn::prelude::*;
use vitunet_backbones::{VggConfig, VggVariant};

use super::enums::{InterpolationStrategy, RefineStage};
use crate::error::{VitUNetError, VitUNetResult};

/// Image shape the model is built for, in `(height, width, channels)` order.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub struct InputShape {
    /// Image height in pixels.
    pub height: usize,
    /// Image width in pixels.
    pub width: usize,
    /// Image channels.
    #[config(default = "3")]
    pub channels: usize,
}

impl From<(usize, usize, usize)> for InputShape {
    fn from((height, width, channels): (usize, usize, usize)) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

impl InputShape {
    /// Channels-first tensor dims `[channels, height, width]`.
    pub const fn chw(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

/// Main configuration for the Double ViT-UNet.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Shape of the images the model is built for.
    pub input: InputShape,
    /// Coarse-stage backbone configuration.
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    /// Conv block and squeeze-excite settings.
    #[config(default = "BlockConfig::new()")]
    pub block: BlockConfig,
    /// Bottleneck ASPP settings, shared by both stages.
    #[config(default = "AsppStageConfig::new()")]
    pub aspp: AsppStageConfig,
    /// Patch-token transformer settings.
    #[config(default = "VitConfig::new()")]
    pub vit: VitConfig,
    /// Decoder widths, shared by all decoders.
    #[config(default = "DecoderConfig::new()")]
    pub decoder: DecoderConfig,
    /// Second-stage network.
    #[config(default = "RefineStage::Vit")]
    pub refine: RefineStage,
    /// Interpolation strategy for tensor resizing operations.
    pub interpolation: InterpolationStrategy,
}

/// Backbone network configuration.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// VGG depth.
    #[config(default = "VggVariant::Vgg19")]
    pub variant: VggVariant,
    /// Insert batch normalization after every backbone convolution.
    #[config(default = "false")]
    pub batch_norm: bool,
    /// Layers tapped as skip connections. `None` selects the variant defaults.
    #[config(default = "None")]
    pub skip_layers: Option<Vec<String>>,
    /// Layer used as the encoder output. `None` selects the variant default.
    #[config(default = "None")]
    pub output_layer: Option<String>,
}

impl BackboneConfig {
    /// Backbone configuration for an image with `in_channels` channels.
    pub fn vgg(&self, in_channels: usize) -> VggConfig {
        VggConfig::new()
            .with_variant(self.variant.clone())
            .with_batch_norm(self.batch_norm)
            .with_in_channels(in_channels)
    }

    /// Effective skip layer names.
    pub fn skip_layers(&self) -> Vec<String> {
        self.skip_layers
            .clone()
            .unwrap_or_else(|| self.variant.default_skip_layers())
    }

    /// Effective output layer name.
    pub fn output_layer(&self) -> String {
        self.output_layer
            .clone()
            .unwrap_or_else(|| self.variant.default_output_layer())
    }
}

/// Conv block settings.
#[derive(Config, Debug)]
pub struct BlockConfig {
    /// Squeeze-excite channel reduction ratio.
    #[config(default = "8")]
    pub se_ratio: usize,
    /// Batch norm epsilon.
    #[config(default = "1e-3")]
    pub norm_epsilon: f64,
    /// Batch norm running-statistics momentum.
    #[config(default = "0.01")]
    pub norm_momentum: f64,
}

/// Bottleneck ASPP settings.
#[derive(Config, Debug)]
pub struct AsppStageConfig {
    /// Channels of every branch and of the projected output.
    #[config(default = "64")]
    pub filters: usize,
    /// Output stride of the encoder, selects the dilation rates.
    #[config(default = "16")]
    pub output_stride: usize,
}

impl AsppStageConfig {
    /// Dilation rates of the four convolutional branches.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for output strides other than 8 and 16.
    pub fn dilations(&self) -> VitUNetResult<[usize; 4]> {
        match self.output_stride {
            16 => Ok([1, 6, 12, 18]),
            8 => Ok([1, 12, 24, 36]),
            other => Err(VitUNetError::InvalidConfiguration {
                reason: format!("Unsupported ASPP output_stride: {other}. Only 8 and 16 are supported"),
            }),
        }
    }
}

/// Patch-token transformer settings.
#[derive(Config, Debug)]
pub struct VitConfig {
    /// Side of the square, non-overlapping patches.
    #[config(default = "8")]
    pub patch_size: usize,
    /// Token width.
    #[config(default = "64")]
    pub projection_dim: usize,
    /// Attention heads per transformer block.
    #[config(default = "16")]
    pub num_heads: usize,
    /// Hidden MLP width as a multiple of `projection_dim`.
    #[config(default = "2")]
    pub mlp_ratio: usize,
    /// Dropout used in attention and MLP layers.
    #[config(default = "0.1")]
    pub dropout: f64,
    /// Layer norm epsilon.
    #[config(default = "1e-6")]
    pub layer_norm_epsilon: f64,
    /// Conv block widths of the second-stage encoder.
    #[config(default = "[32, 64, 128, 256]")]
    pub encoder_filters: [usize; 4],
}

impl VitConfig {
    /// Hidden units of the transformer MLP, `[mlp_ratio * D, D]`.
    pub const fn transformer_units(&self) -> [usize; 2] {
        [self.projection_dim * self.mlp_ratio, self.projection_dim]
    }
}

/// Decoder widths.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Conv block widths from the deepest to the shallowest stage.
    #[config(default = "[256, 128, 64, 32]")]
    pub filters: [usize; 4],
}

impl ModelConfig {
    /// Validate scalar settings that do not depend on the input shape.
    ///
    /// # Errors
    ///
    /// Returns `Err(VitUNetError::InvalidConfiguration)` if any rule is violated.
    pub fn validate(&self) -> VitUNetResult<()> {
        let invalid = |reason: String| Err(VitUNetError::InvalidConfiguration { reason });

        if self.block.se_ratio == 0 {
            return invalid("Squeeze-excite ratio must be positive".to_owned());
        }

        let widths = self
            .vit
            .encoder_filters
            .iter()
            .chain(self.decoder.filters.iter());
        for &filters in widths {
            if filters / self.block.se_ratio == 0 {
                return invalid(format!(
                    "Conv block width {filters} is smaller than the squeeze-excite ratio {}",
                    self.block.se_ratio
                ));
            }
        }

        if self.aspp.filters == 0 {
            return invalid("ASPP filters must be positive".to_owned());
        }
        self.aspp.dilations()?;

        if self.vit.patch_size == 0 {
            return invalid("Patch size must be positive".to_owned());
        }
        if self.vit.num_heads == 0 || self.vit.projection_dim % self.vit.num_heads != 0 {
            return invalid(format!(
                "Projection dim {} must be divisible by the number of heads {}",
                self.vit.projection_dim, self.vit.num_heads
            ));
        }
        if self.vit.mlp_ratio == 0 {
            return invalid("MLP ratio must be positive".to_owned());
        }
        if !(0.0..1.0).contains(&self.vit.dropout) {
            return invalid(format!("Dropout must be in [0, 1), got {}", self.vit.dropout));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn config() -> ModelConfig {
        ModelConfig::new(InputShape::new(32, 32), InterpolationStrategy::Bilinear)
    }

    #[test]
    fn defaults_reproduce_reference_architecture() {
        let config = config();

        assert_eq!(config.input.channels, 3);
        assert_eq!(config.backbone.variant, VggVariant::Vgg19);
        assert_eq!(config.block.se_ratio, 8);
        assert_eq!(config.aspp.filters, 64);
        assert_eq!(config.vit.patch_size, 8);
        assert_eq!(config.vit.projection_dim, 64);
        assert_eq!(config.vit.num_heads, 16);
        assert_eq!(config.vit.transformer_units(), [128, 64]);
        assert_eq!(config.vit.encoder_filters, [32, 64, 128, 256]);
        assert_eq!(config.decoder.filters, [256, 128, 64, 32]);
        assert_eq!(config.refine, RefineStage::Vit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn input_shape_from_hwc_tuple() {
        let shape = InputShape::from((192, 256, 3));
        assert_eq!(shape.chw(), [3, 192, 256]);
    }

    #[test]
    fn backbone_defaults_follow_variant() {
        let backbone = BackboneConfig::new().with_variant(VggVariant::Vgg16);
        assert_eq!(backbone.output_layer(), "block5_conv3");
        assert_eq!(backbone.skip_layers()[2], "block3_conv3");
    }

    #[rstest]
    #[case(16, [1, 6, 12, 18])]
    #[case(8, [1, 12, 24, 36])]
    fn aspp_dilations_follow_output_stride(#[case] stride: usize, #[case] expected: [usize; 4]) {
        let aspp = AsppStageConfig::new().with_output_stride(stride);
        assert_eq!(aspp.dilations(), Ok(expected));
    }

    #[test]
    fn unsupported_output_stride_is_rejected() {
        let config = config().with_aspp(AsppStageConfig::new().with_output_stride(4));

        match config.validate() {
            Err(VitUNetError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("output_stride"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[test]
    fn heads_must_divide_projection_dim() {
        let config = config().with_vit(VitConfig::new().with_num_heads(12));

        match config.validate() {
            Err(VitUNetError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("divisible by the number of heads"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[test]
    fn narrow_block_is_rejected_by_se_ratio() {
        let config = config().with_decoder(DecoderConfig::new().with_filters([256, 128, 64, 4]));

        match config.validate() {
            Err(VitUNetError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("squeeze-excite ratio"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[rstest]
    #[case(1.0)]
    #[case(-0.1)]
    fn dropout_out_of_range_is_rejected(#[case] dropout: f64) {
        let config = config().with_vit(VitConfig::new().with_dropout(dropout));
        assert!(config.validate().is_err());
    }
}
