//! Decoders of the two stages.
//!
//! Every decoder runs four stages, deepest first, and pairs stage `i` with the
//! `i`-th skip of [`SkipConnections::decoder_order`].

use burn::{module::Ignored, prelude::*};

use super::{
    modules::{
        fold_tokens, utils::upsample2x, ConvBlock, ConvBlockConfig, TransformerDecoderBlock,
        TransformerDecoderBlockConfig,
    },
    skip::SkipConnections,
};
use crate::{
    config::{BlockConfig, BlockPlan, InterpolationStrategy, VitConfig, VitDecoderStagePlan},
    error::VitUNetResult,
};

fn conv_blocks<B: Backend>(
    plan: &[BlockPlan],
    settings: &BlockConfig,
    device: &Device<B>,
) -> Vec<ConvBlock<B>> {
    plan.iter()
        .map(|block| ConvBlockConfig::from_plan(block, settings).init(device))
        .collect()
}

/// Coarse-stage decoder: upsample, concatenate the backbone skip, conv block.
#[derive(Module, Debug)]
pub struct Decoder1<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    interpolation: Ignored<InterpolationStrategy>,
}

impl<B: Backend> Decoder1<B> {
    pub fn new(
        plan: &[BlockPlan],
        settings: &BlockConfig,
        interpolation: &InterpolationStrategy,
        device: &Device<B>,
    ) -> Self {
        Self {
            blocks: conv_blocks(plan, settings, device),
            interpolation: Ignored(interpolation.clone()),
        }
    }

    /// # Errors
    ///
    /// Returns `SkipCountMismatch` if `skips` does not have one entry per stage.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        skips: &SkipConnections<Tensor<B, 4>>,
    ) -> VitUNetResult<Tensor<B, 4>> {
        skips.ensure_len("encoder1 skips", self.blocks.len())?;

        let x = self
            .blocks
            .iter()
            .zip(skips.decoder_order())
            .fold(x, |x, (block, skip)| {
                let x = upsample2x(x, &self.interpolation.0);
                block.forward(Tensor::cat(vec![x, skip.clone()], 1))
            });

        Ok(x)
    }
}

/// One stage of the transformer decoder.
#[derive(Module, Debug)]
pub struct VitDecoderStage<B: Backend> {
    transformer: TransformerDecoderBlock<B>,
    block: ConvBlock<B>,
}

/// Dual-branch decoder.
///
/// At every stage the tokens are decoded against the matching encoder token
/// skip, folded onto the current grid and concatenated before upsampling.
/// The upsampled map is then joined with the backbone skip and the conv skip
/// of the transformer encoder.
#[derive(Module, Debug)]
pub struct VitDecoder<B: Backend> {
    stages: Vec<VitDecoderStage<B>>,
    interpolation: Ignored<InterpolationStrategy>,
}

/// Skip lists consumed by [`VitDecoder::forward`], all in capture order.
#[derive(Debug)]
pub struct VitDecoderSkips<'a, B: Backend> {
    /// Backbone taps of the coarse encoder.
    pub backbone: &'a SkipConnections<Tensor<B, 4>>,
    /// Conv block outputs of the transformer encoder.
    pub conv: &'a SkipConnections<Tensor<B, 4>>,
    /// Token snapshots of the transformer encoder.
    pub tokens: &'a SkipConnections<Tensor<B, 3>>,
}

impl<B: Backend> VitDecoder<B> {
    pub fn new(
        plan: &[VitDecoderStagePlan],
        block: &BlockConfig,
        vit: &VitConfig,
        interpolation: &InterpolationStrategy,
        device: &Device<B>,
    ) -> Self {
        let transformer = TransformerDecoderBlockConfig::new().with_settings(vit.clone());

        Self {
            stages: plan
                .iter()
                .map(|stage| VitDecoderStage {
                    transformer: transformer.init(device),
                    block: ConvBlockConfig::from_plan(&stage.block, block).init(device),
                })
                .collect(),
            interpolation: Ignored(interpolation.clone()),
        }
    }

    /// # Errors
    ///
    /// Returns `SkipCountMismatch` if any skip list does not have one entry per stage.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        tokens: Tensor<B, 3>,
        skips: VitDecoderSkips<'_, B>,
    ) -> VitUNetResult<Tensor<B, 4>> {
        let stages = self.stages.len();
        skips.backbone.ensure_len("encoder1 skips", stages)?;
        skips.conv.ensure_len("vit encoder conv skips", stages)?;
        skips.tokens.ensure_len("vit encoder token skips", stages)?;

        let mut x = x;
        let mut tokens = tokens;
        let paired = skips
            .backbone
            .decoder_order()
            .zip(skips.conv.decoder_order())
            .zip(skips.tokens.decoder_order());

        for (stage, ((backbone, conv), token_skip)) in self.stages.iter().zip(paired) {
            tokens = stage.transformer.forward(tokens, token_skip.clone());

            let [_, _, height, width] = x.dims();
            let folded = fold_tokens(tokens.clone(), [height, width]);
            x = Tensor::cat(vec![x, folded], 1);

            x = upsample2x(x, &self.interpolation.0);
            x = Tensor::cat(vec![x, backbone.clone(), conv.clone()], 1);
            x = stage.block.forward(x);
        }

        Ok(x)
    }
}

/// Decoder of the convolutional refine stage, joining both encoders' skips.
#[derive(Module, Debug)]
pub struct Decoder2<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    interpolation: Ignored<InterpolationStrategy>,
}

impl<B: Backend> Decoder2<B> {
    pub fn new(
        plan: &[BlockPlan],
        settings: &BlockConfig,
        interpolation: &InterpolationStrategy,
        device: &Device<B>,
    ) -> Self {
        Self {
            blocks: conv_blocks(plan, settings, device),
            interpolation: Ignored(interpolation.clone()),
        }
    }

    /// # Errors
    ///
    /// Returns `SkipCountMismatch` if either list does not have one entry per stage.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        skip1: &SkipConnections<Tensor<B, 4>>,
        skip2: &SkipConnections<Tensor<B, 4>>,
    ) -> VitUNetResult<Tensor<B, 4>> {
        skip1.ensure_len("encoder1 skips", self.blocks.len())?;
        skip2.ensure_len("encoder2 skips", self.blocks.len())?;

        let x = self
            .blocks
            .iter()
            .zip(skip1.decoder_order().zip(skip2.decoder_order()))
            .fold(x, |x, (block, (a, b))| {
                let x = upsample2x(x, &self.interpolation.0);
                block.forward(Tensor::cat(vec![x, a.clone(), b.clone()], 1))
            });

        Ok(x)
    }
}
