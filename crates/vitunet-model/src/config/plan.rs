//! Construction-time shape algebra.
//!
//! [`ShapePlan`] resolves every concatenation width, fold width and spatial size
//! of the network for one input shape. Modules are only built from a plan, so
//! a shape that would break a concatenation or a token fold is rejected before
//! any weight is allocated.

use core::fmt;

use vitunet_backbones::TapPlan;

use super::{
    core::{InputShape, ModelConfig},
    enums::RefineStage,
};
use crate::error::{VitUNetError, VitUNetResult};

/// Number of downsampling stages in every encoder and upsampling stages in every decoder.
pub const STAGES: usize = 4;

/// Total spatial reduction between the input and the bottleneck.
pub const BOTTLENECK_STRIDE: usize = 1 << STAGES;

/// Geometry of a single conv block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Spatial size `[height, width]` the block runs at.
    pub size: [usize; 2],
}

/// Geometry of an ASPP bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsppPlan {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Spatial size `[height, width]`.
    pub size: [usize; 2],
    /// Dilation rates of the convolutional branches.
    pub dilations: [usize; 4],
}

/// Patch and token geometry of the transformer branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPlan {
    /// Patch side length.
    pub patch_size: usize,
    /// Patch grid `[rows, cols]`.
    pub grid: [usize; 2],
    /// `rows * cols`.
    pub num_patches: usize,
    /// Flattened patch length `patch_size^2 * channels`.
    pub patch_dim: usize,
    /// Token width.
    pub projection_dim: usize,
}

impl TokenPlan {
    /// Channels obtained by folding the tokens onto a `size` grid.
    ///
    /// # Errors
    ///
    /// Returns `TokenReshape` when `size[0] * size[1]` does not divide the token
    /// element count.
    pub fn fold_channels(&self, size: [usize; 2], site: &str) -> VitUNetResult<usize> {
        let elements = self.num_patches * self.projection_dim;
        let cells = size[0] * size[1];

        if cells == 0 || elements % cells != 0 {
            return Err(VitUNetError::TokenReshape {
                site: site.to_owned(),
                num_patches: self.num_patches,
                projection_dim: self.projection_dim,
                height: size[0],
                width: size[1],
            });
        }

        Ok(elements / cells)
    }
}

/// One stage of the dual-branch transformer encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitEncoderStagePlan {
    /// Conv block before pooling. Its output is the conv skip.
    pub block: BlockPlan,
    /// Spatial size after pooling.
    pub pooled: [usize; 2],
    /// Channels contributed by the folded tokens.
    pub fold_channels: usize,
    /// Channels after concatenating the folded tokens.
    pub fused_channels: usize,
}

/// One stage of the dual-branch transformer decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitDecoderStagePlan {
    /// Grid the decoded tokens are folded onto (before upsampling).
    pub grid: [usize; 2],
    /// Channels contributed by the folded tokens.
    pub fold_channels: usize,
    /// Conv block after upsampling and skip concatenation.
    pub block: BlockPlan,
}

/// Stage B plan for the transformer refine stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VitRefinePlan {
    /// Patch/token geometry.
    pub tokens: TokenPlan,
    /// Encoder stages, shallow to deep.
    pub encoder: Vec<VitEncoderStagePlan>,
    /// Bottleneck.
    pub aspp: AsppPlan,
    /// Decoder stages, deep to shallow.
    pub decoder: Vec<VitDecoderStagePlan>,
}

/// Stage B plan for the convolutional refine stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvRefinePlan {
    /// Encoder conv blocks, shallow to deep.
    pub encoder: Vec<BlockPlan>,
    /// Bottleneck.
    pub aspp: AsppPlan,
    /// Decoder conv blocks, deep to shallow.
    pub decoder: Vec<BlockPlan>,
}

/// Stage B plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinePlan {
    /// Dual-branch transformer stage.
    Vit(VitRefinePlan),
    /// Convolutional stage.
    Conv(ConvRefinePlan),
}

impl RefinePlan {
    /// Channels fed into the output block.
    pub fn out_channels(&self) -> usize {
        let last = match self {
            Self::Vit(plan) => plan.decoder.last().map(|stage| stage.block),
            Self::Conv(plan) => plan.decoder.last().copied(),
        };
        last.map_or(0, |block| block.out_channels)
    }
}

/// Fully resolved geometry of the two-stage network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapePlan {
    /// Input image shape.
    pub input: InputShape,
    /// Backbone layers tapped by the coarse encoder.
    pub taps: TapPlan,
    /// Stage A bottleneck.
    pub aspp: AsppPlan,
    /// Stage A decoder conv blocks, deep to shallow.
    pub decoder: Vec<BlockPlan>,
    /// Stage B.
    pub refine: RefinePlan,
}

impl ShapePlan {
    /// Channels fed into the coarse output block.
    pub fn coarse_channels(&self) -> usize {
        self.decoder.last().map_or(0, |block| block.out_channels)
    }
}

const fn scaled(size: [usize; 2], stride: usize) -> [usize; 2] {
    [size[0] / stride, size[1] / stride]
}

impl ModelConfig {
    /// Resolve the shape plan for the configured input.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInputShape` when the input does not survive four
    /// halvings or patch extraction, `TokenReshape` when a fold is undefined,
    /// `SkipCountMismatch` when the backbone taps do not match the decoder depth,
    /// `Backbone` for unknown layer names and `InvalidConfiguration` for
    /// inconsistent settings.
    pub fn plan(&self) -> VitUNetResult<ShapePlan> {
        self.validate()?;

        let InputShape {
            height,
            width,
            channels,
        } = self.input;
        let invalid_shape = |reason: String| VitUNetError::InvalidInputShape {
            height,
            width,
            channels,
            reason,
        };

        if height == 0 || width == 0 || channels == 0 {
            return Err(invalid_shape("dimensions must be positive".to_owned()));
        }
        if height % BOTTLENECK_STRIDE != 0 || width % BOTTLENECK_STRIDE != 0 {
            return Err(invalid_shape(format!(
                "height and width must be multiples of {BOTTLENECK_STRIDE}"
            )));
        }

        let size = [height, width];
        let dilations = self.aspp.dilations()?;

        // ---------- Stage A ----------
        let taps = self
            .backbone
            .vgg(channels)
            .resolve_taps(&self.backbone.skip_layers(), &self.backbone.output_layer())?;
        if taps.skips.len() != STAGES {
            return Err(VitUNetError::SkipCountMismatch {
                list: "backbone skip layers".to_owned(),
                expected: STAGES,
                actual: taps.skips.len(),
            });
        }
        for (stage, tap) in taps.skips.iter().enumerate() {
            if tap.downsample != 1 << stage {
                return Err(VitUNetError::InvalidConfiguration {
                    reason: format!(
                        "Skip layer {} runs at 1/{} resolution, stage {stage} needs 1/{}",
                        tap.name,
                        tap.downsample,
                        1 << stage
                    ),
                });
            }
        }
        if taps.output.downsample != BOTTLENECK_STRIDE {
            return Err(VitUNetError::InvalidConfiguration {
                reason: format!(
                    "Output layer {} runs at 1/{} resolution, the bottleneck needs 1/{BOTTLENECK_STRIDE}",
                    taps.output.name, taps.output.downsample
                ),
            });
        }

        let bottleneck = scaled(size, BOTTLENECK_STRIDE);
        let aspp = AsppPlan {
            in_channels: taps.output.channels,
            out_channels: self.aspp.filters,
            size: bottleneck,
            dilations,
        };

        let skip1: Vec<usize> = taps.skips.iter().map(|tap| tap.channels).collect();
        let decoder = self.decoder_blocks(size, aspp.out_channels, &skip1, None);

        // ---------- Stage B ----------
        let refine = match self.refine {
            RefineStage::Vit => RefinePlan::Vit(self.plan_vit(size, &skip1, dilations)?),
            RefineStage::Conv => RefinePlan::Conv(self.plan_conv(size, &skip1, dilations)),
        };

        let plan = ShapePlan {
            input: self.input,
            taps,
            aspp,
            decoder,
            refine,
        };
        tracing::debug!(%plan, "resolved shape plan");

        Ok(plan)
    }

    /// Decoder conv blocks for skips given in capture order.
    fn decoder_blocks(
        &self,
        size: [usize; 2],
        bottleneck_channels: usize,
        skip_a: &[usize],
        skip_b: Option<&[usize]>,
    ) -> Vec<BlockPlan> {
        let mut x_channels = bottleneck_channels;
        self.decoder
            .filters
            .iter()
            .enumerate()
            .map(|(stage, &filters)| {
                let depth = STAGES - 1 - stage;
                let extra = skip_b.map_or(0, |skip| skip[depth]);
                let block = BlockPlan {
                    in_channels: x_channels + skip_a[depth] + extra,
                    out_channels: filters,
                    size: scaled(size, 1 << depth),
                };
                x_channels = filters;
                block
            })
            .collect()
    }

    fn plan_vit(
        &self,
        size: [usize; 2],
        skip1: &[usize],
        dilations: [usize; 4],
    ) -> VitUNetResult<VitRefinePlan> {
        let patch_size = self.vit.patch_size;
        if size[0] % patch_size != 0 || size[1] % patch_size != 0 {
            return Err(VitUNetError::InvalidInputShape {
                height: size[0],
                width: size[1],
                channels: self.input.channels,
                reason: format!("height and width must be multiples of the patch size {patch_size}"),
            });
        }

        let grid = scaled(size, patch_size);
        let tokens = TokenPlan {
            patch_size,
            grid,
            num_patches: grid[0] * grid[1],
            patch_dim: patch_size * patch_size * self.input.channels,
            projection_dim: self.vit.projection_dim,
        };

        let mut x_channels = self.input.channels;
        let mut encoder = Vec::with_capacity(STAGES);
        for (stage, &filters) in self.vit.encoder_filters.iter().enumerate() {
            let pooled = scaled(size, 2 << stage);
            let fold_channels =
                tokens.fold_channels(pooled, &format!("vit encoder stage {stage}"))?;
            let block = BlockPlan {
                in_channels: x_channels,
                out_channels: filters,
                size: scaled(size, 1 << stage),
            };
            x_channels = filters + fold_channels;
            encoder.push(VitEncoderStagePlan {
                block,
                pooled,
                fold_channels,
                fused_channels: x_channels,
            });
        }

        let aspp = AsppPlan {
            in_channels: x_channels,
            out_channels: self.aspp.filters,
            size: scaled(size, BOTTLENECK_STRIDE),
            dilations,
        };

        let mut x_channels = aspp.out_channels;
        let mut decoder = Vec::with_capacity(STAGES);
        for (stage, &filters) in self.decoder.filters.iter().enumerate() {
            let depth = STAGES - 1 - stage;
            let grid = scaled(size, 2 << depth);
            let fold_channels =
                tokens.fold_channels(grid, &format!("vit decoder stage {stage}"))?;
            let block = BlockPlan {
                in_channels: x_channels
                    + fold_channels
                    + skip1[depth]
                    + encoder[depth].block.out_channels,
                out_channels: filters,
                size: scaled(size, 1 << depth),
            };
            x_channels = filters;
            decoder.push(VitDecoderStagePlan {
                grid,
                fold_channels,
                block,
            });
        }

        Ok(VitRefinePlan {
            tokens,
            encoder,
            aspp,
            decoder,
        })
    }

    fn plan_conv(&self, size: [usize; 2], skip1: &[usize], dilations: [usize; 4]) -> ConvRefinePlan {
        let mut x_channels = self.input.channels;
        let encoder: Vec<BlockPlan> = self
            .vit
            .encoder_filters
            .iter()
            .enumerate()
            .map(|(stage, &filters)| {
                let block = BlockPlan {
                    in_channels: x_channels,
                    out_channels: filters,
                    size: scaled(size, 1 << stage),
                };
                x_channels = filters;
                block
            })
            .collect();

        let aspp = AsppPlan {
            in_channels: x_channels,
            out_channels: self.aspp.filters,
            size: scaled(size, BOTTLENECK_STRIDE),
            dilations,
        };

        let skip2: Vec<usize> = encoder.iter().map(|block| block.out_channels).collect();
        let decoder = self.decoder_blocks(size, aspp.out_channels, skip1, Some(&skip2));

        ConvRefinePlan {
            encoder,
            aspp,
            decoder,
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, label: &str, block: &BlockPlan) -> fmt::Result {
    writeln!(
        f,
        "  {label:<24} {:>5} -> {:<5} @ {}x{}",
        block.in_channels, block.out_channels, block.size[0], block.size[1]
    )
}

fn write_aspp(f: &mut fmt::Formatter<'_>, aspp: &AsppPlan) -> fmt::Result {
    writeln!(
        f,
        "  {:<24} {:>5} -> {:<5} @ {}x{} dilations {:?}",
        "aspp", aspp.in_channels, aspp.out_channels, aspp.size[0], aspp.size[1], aspp.dilations
    )
}

impl fmt::Display for ShapePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let InputShape {
            height,
            width,
            channels,
        } = self.input;
        writeln!(f, "input {height}x{width}x{channels}")?;

        writeln!(f, "stage A (coarse)")?;
        for tap in self.taps.skips.iter().chain(core::iter::once(&self.taps.output)) {
            writeln!(
                f,
                "  {:<24} {:>14} @ {}x{}",
                tap.name,
                tap.channels,
                height / tap.downsample,
                width / tap.downsample
            )?;
        }
        write_aspp(f, &self.aspp)?;
        for (stage, block) in self.decoder.iter().enumerate() {
            write_block(f, &format!("decoder{stage}"), block)?;
        }
        writeln!(f, "  {:<24} {:>5} -> 1", "output", self.coarse_channels())?;

        match &self.refine {
            RefinePlan::Vit(plan) => {
                let tokens = &plan.tokens;
                writeln!(f, "stage B (vit)")?;
                writeln!(
                    f,
                    "  {:<24} {}x{} patches of {} -> {} tokens x {}",
                    "patches",
                    tokens.grid[0],
                    tokens.grid[1],
                    tokens.patch_dim,
                    tokens.num_patches,
                    tokens.projection_dim
                )?;
                for (stage, enc) in plan.encoder.iter().enumerate() {
                    write_block(f, &format!("encoder{stage}"), &enc.block)?;
                    writeln!(
                        f,
                        "  {:<24} {:>5} + {:<5} @ {}x{}",
                        format!("fold{stage}"),
                        enc.block.out_channels,
                        enc.fold_channels,
                        enc.pooled[0],
                        enc.pooled[1]
                    )?;
                }
                write_aspp(f, &plan.aspp)?;
                for (stage, dec) in plan.decoder.iter().enumerate() {
                    writeln!(
                        f,
                        "  {:<24} {:>13} @ {}x{}",
                        format!("unfold{stage}"),
                        dec.fold_channels,
                        dec.grid[0],
                        dec.grid[1]
                    )?;
                    write_block(f, &format!("decoder{stage}"), &dec.block)?;
                }
            }
            RefinePlan::Conv(plan) => {
                writeln!(f, "stage B (conv)")?;
                for (stage, block) in plan.encoder.iter().enumerate() {
                    write_block(f, &format!("encoder{stage}"), block)?;
                }
                write_aspp(f, &plan.aspp)?;
                for (stage, block) in plan.decoder.iter().enumerate() {
                    write_block(f, &format!("decoder{stage}"), block)?;
                }
            }
        }
        write!(f, "  {:<24} {:>5} -> 1", "output", self.refine.out_channels())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use vitunet_backbones::BackboneError;

    use super::*;
    use crate::config::{BackboneConfig, InterpolationStrategy, VitConfig};

    fn config(height: usize, width: usize) -> ModelConfig {
        ModelConfig::new(InputShape::new(height, width), InterpolationStrategy::Bilinear)
    }

    fn vit(plan: &ShapePlan) -> &VitRefinePlan {
        match &plan.refine {
            RefinePlan::Vit(plan) => plan,
            RefinePlan::Conv(_) => panic!("Expected a ViT refine plan"),
        }
    }

    #[test]
    fn reference_shape_resolves_documented_widths() {
        let plan = config(192, 256).plan().unwrap();

        let coarse: Vec<_> = plan.decoder.iter().map(|b| b.in_channels).collect();
        assert_eq!(coarse, [576, 512, 256, 128]);
        assert_eq!(plan.decoder[3].size, [192, 256]);
        assert_eq!(plan.aspp.size, [12, 16]);

        let vit = vit(&plan);
        assert_eq!(vit.tokens.num_patches, 768);
        assert_eq!(vit.tokens.patch_dim, 192);

        let folds: Vec<_> = vit.encoder.iter().map(|s| s.fold_channels).collect();
        assert_eq!(folds, [4, 16, 64, 256]);
        let fused: Vec<_> = vit.encoder.iter().map(|s| s.fused_channels).collect();
        assert_eq!(fused, [36, 80, 192, 512]);
        assert_eq!(vit.aspp.in_channels, 512);

        let unfolds: Vec<_> = vit.decoder.iter().map(|s| s.fold_channels).collect();
        assert_eq!(unfolds, [256, 64, 16, 4]);
        let widths: Vec<_> = vit.decoder.iter().map(|s| s.block.in_channels).collect();
        assert_eq!(widths, [1088, 704, 336, 164]);
        assert_eq!(plan.refine.out_channels(), 32);
    }

    #[test]
    fn decoder_pairs_skips_in_reverse_capture_order() {
        let plan = config(64, 96).plan().unwrap();

        let captured: Vec<_> = plan
            .taps
            .skips
            .iter()
            .map(|tap| [64 / tap.downsample, 96 / tap.downsample])
            .collect();
        let consumed: Vec<_> = plan.decoder.iter().map(|block| block.size).collect();

        assert_eq!(captured, [[64, 96], [32, 48], [16, 24], [8, 12]]);
        assert_eq!(consumed, [[8, 12], [16, 24], [32, 48], [64, 96]]);
    }

    #[test]
    fn conv_refine_plan_concatenates_both_skip_lists() {
        let plan = config(32, 32)
            .with_refine(RefineStage::Conv)
            .plan()
            .unwrap();

        match &plan.refine {
            RefinePlan::Conv(conv) => {
                let widths: Vec<_> = conv.decoder.iter().map(|b| b.in_channels).collect();
                assert_eq!(widths, [64 + 512 + 256, 256 + 256 + 128, 128 + 128 + 64, 64 + 64 + 32]);
                assert_eq!(conv.aspp.in_channels, 256);
            }
            RefinePlan::Vit(_) => panic!("Expected a conv refine plan"),
        }
    }

    #[rstest]
    #[case(40, 32)]
    #[case(32, 24)]
    #[case(0, 32)]
    fn shapes_not_divisible_by_sixteen_fail(#[case] height: usize, #[case] width: usize) {
        match config(height, width).plan() {
            Err(VitUNetError::InvalidInputShape { .. }) => {}
            other => panic!("Expected InvalidInputShape error, got {other:?}"),
        }
    }

    #[test]
    fn shape_not_divisible_by_patch_size_fails() {
        let config = config(48, 48).with_vit(VitConfig::new().with_patch_size(32));

        match config.plan() {
            Err(VitUNetError::InvalidInputShape { reason, .. }) => {
                assert!(reason.contains("patch size"));
            }
            other => panic!("Expected InvalidInputShape error, got {other:?}"),
        }
    }

    #[test]
    fn indivisible_fold_fails_at_construction() {
        // One 32x32 patch gives 64 token elements, too few for the 16x16 grid.
        let config = config(32, 32).with_vit(VitConfig::new().with_patch_size(32));

        match config.plan() {
            Err(VitUNetError::TokenReshape {
                site,
                height,
                width,
                ..
            }) => {
                assert_eq!(site, "vit encoder stage 0");
                assert_eq!([height, width], [16, 16]);
            }
            other => panic!("Expected TokenReshape error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_backbone_layer_fails() {
        let config = config(32, 32).with_backbone(
            BackboneConfig::new().with_output_layer(Some("block6_conv1".to_owned())),
        );

        match config.plan() {
            Err(VitUNetError::Backbone(BackboneError::UnknownLayer { name, .. })) => {
                assert_eq!(name, "block6_conv1");
            }
            other => panic!("Expected UnknownLayer error, got {other:?}"),
        }
    }

    #[test]
    fn three_skip_layers_fail() {
        let skips = ["block1_conv2", "block2_conv2", "block3_conv4"]
            .map(str::to_owned)
            .to_vec();
        let config = config(32, 32).with_backbone(BackboneConfig::new().with_skip_layers(Some(skips)));

        assert_eq!(
            config.plan(),
            Err(VitUNetError::SkipCountMismatch {
                list: "backbone skip layers".to_owned(),
                expected: 4,
                actual: 3,
            })
        );
    }

    #[test]
    fn skip_at_wrong_resolution_fails() {
        let skips = ["block1_conv1", "block2_conv2", "block3_conv4", "block5_conv1"]
            .map(str::to_owned)
            .to_vec();
        let config = config(32, 32).with_backbone(BackboneConfig::new().with_skip_layers(Some(skips)));

        match config.plan() {
            Err(VitUNetError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("block5_conv1"));
            }
            other => panic!("Expected InvalidConfiguration error, got {other:?}"),
        }
    }

    #[test]
    fn plan_renders_every_stage() {
        let rendered = config(32, 32).plan().unwrap().to_string();

        assert!(rendered.starts_with("input 32x32x3"));
        assert!(rendered.contains("block5_conv4"));
        assert!(rendered.contains("fold3"));
        assert!(rendered.contains("unfold0"));
    }
}
