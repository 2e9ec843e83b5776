//! Encoders of the two stages.
//!
//! - [`Encoder1`]: pretrained-style VGG trunk tapped at named layers.
//! - [`VitEncoder`]: conv blocks fused with a parallel patch-token transformer.
//! - [`Encoder2`]: plain conv block encoder used by the convolutional refine stage.

use burn::{
    module::Ignored,
    nn::pool::{MaxPool2d, MaxPool2dConfig},
    prelude::*,
};
use vitunet_backbones::{Backbone, BackboneFeatures, TapPlan, VggBackbone, VggConfig};

use super::{
    modules::{
        fold_tokens, ConvBlock, ConvBlockConfig, PatchEncoder, PatchEncoderConfig, Patches,
        TransformerEncoderBlock, TransformerEncoderBlockConfig,
    },
    skip::SkipConnections,
};
use crate::config::{BlockConfig, BlockPlan, VitConfig, VitRefinePlan};

fn max_pool() -> MaxPool2d {
    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}

/// Coarse-stage encoder: a VGG trunk read at the planned taps.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: the tapped output layer at `1/16` resolution
#[derive(Module, Debug)]
pub struct Encoder1<B: Backend> {
    backbone: VggBackbone<B>,
    taps: Ignored<TapPlan>,
}

impl<B: Backend> Encoder1<B> {
    /// Builds the trunk and keeps the tap plan resolved for it.
    pub fn new(vgg: &VggConfig, taps: TapPlan, device: &Device<B>) -> Self {
        Self {
            backbone: vgg.init(device),
            taps: Ignored(taps),
        }
    }

    /// Run the trunk, returning the bottleneck input and the skips shallow to deep.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, SkipConnections<Tensor<B, 4>>) {
        let BackboneFeatures { skips, output } =
            Backbone::forward_taps(&self.backbone, x, &self.taps.0);

        (output, skips.into())
    }
}

/// Everything the transformer encoder hands to its decoder.
#[derive(Debug, Clone)]
pub struct VitEncoderOutput<B: Backend> {
    /// Bottleneck input at `1/16` resolution.
    pub features: Tensor<B, 4>,
    /// Tokens after the final transformer block.
    pub tokens: Tensor<B, 3>,
    /// Conv block outputs before pooling, shallow to deep.
    pub conv_skips: SkipConnections<Tensor<B, 4>>,
    /// Tokens after each stage's transformer block, shallow to deep.
    pub token_skips: SkipConnections<Tensor<B, 3>>,
}

/// One conv stage of the transformer encoder together with its token block.
#[derive(Module, Debug)]
pub struct VitEncoderStage<B: Backend> {
    block: ConvBlock<B>,
    pool: MaxPool2d,
    transformer: TransformerEncoderBlock<B>,
    pooled: [usize; 2],
}

/// Dual-branch encoder.
///
/// The image is split into patch tokens that run through one transformer block
/// per stage. After every pooled conv stage the current tokens are folded onto
/// the pooled grid and concatenated as extra channels.
#[derive(Module, Debug)]
pub struct VitEncoder<B: Backend> {
    patches: Patches,
    patch_encoder: PatchEncoder<B>,
    stages: Vec<VitEncoderStage<B>>,
    transformer: TransformerEncoderBlock<B>,
}

impl<B: Backend> VitEncoder<B> {
    pub fn new(
        plan: &VitRefinePlan,
        block: &BlockConfig,
        vit: &VitConfig,
        device: &Device<B>,
    ) -> Self {
        let transformer = TransformerEncoderBlockConfig::new().with_settings(vit.clone());

        let stages = plan
            .encoder
            .iter()
            .map(|stage| VitEncoderStage {
                block: ConvBlockConfig::from_plan(&stage.block, block).init(device),
                pool: max_pool(),
                transformer: transformer.init(device),
                pooled: stage.pooled,
            })
            .collect();

        Self {
            patches: Patches::new(plan.tokens.patch_size),
            patch_encoder: PatchEncoderConfig::from_plan(&plan.tokens).init(device),
            stages,
            transformer: transformer.init(device),
        }
    }

    /// # Shapes
    ///   - input: `[batch_size, channels, height, width]`, the gated image
    pub fn forward(&self, x: Tensor<B, 4>) -> VitEncoderOutput<B> {
        let mut tokens = self.patch_encoder.forward(self.patches.forward(x.clone()));
        let mut conv_skips = SkipConnections::with_capacity(self.stages.len());
        let mut token_skips = SkipConnections::with_capacity(self.stages.len());

        let mut x = x;
        for stage in &self.stages {
            x = stage.block.forward(x);
            conv_skips.capture(x.clone());
            x = stage.pool.forward(x);

            tokens = stage.transformer.forward(tokens);
            token_skips.capture(tokens.clone());

            let folded = fold_tokens(tokens.clone(), stage.pooled);
            x = Tensor::cat(vec![x, folded], 1);
        }

        VitEncoderOutput {
            features: x,
            tokens: self.transformer.forward(tokens),
            conv_skips,
            token_skips,
        }
    }
}

/// Conv block encoder of the convolutional refine stage.
#[derive(Module, Debug)]
pub struct Encoder2<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Encoder2<B> {
    pub fn new(plan: &[BlockPlan], settings: &BlockConfig, device: &Device<B>) -> Self {
        Self {
            blocks: plan
                .iter()
                .map(|block| ConvBlockConfig::from_plan(block, settings).init(device))
                .collect(),
            pool: max_pool(),
        }
    }

    /// Returns the pooled bottleneck input and the block outputs shallow to deep.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, SkipConnections<Tensor<B, 4>>) {
        let mut skips = SkipConnections::with_capacity(self.blocks.len());

        let x = self.blocks.iter().fold(x, |x, block| {
            let x = block.forward(x);
            skips.capture(x.clone());
            self.pool.forward(x)
        });

        (x, skips)
    }
}
