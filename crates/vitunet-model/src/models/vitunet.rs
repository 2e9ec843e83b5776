//! # Double ViT-UNet
//!
//! Two segmentation networks run back to back:
//!
//! 1. **Stage A** (coarse): a VGG trunk, an ASPP bottleneck and a conv decoder
//!    predict a first mask.
//! 2. **Stage B** (refine): the input image, gated by that mask, runs through a
//!    dual conv/transformer encoder, a second ASPP and a transformer decoder
//!    that also reuses the stage A skips. Its mask is the model output.
//!
//! [`RefineStage::Conv`] swaps stage B for a plain conv U-Net.

use burn::prelude::*;

use super::{
    decoder::{Decoder1, Decoder2, VitDecoder, VitDecoderSkips},
    encoder::{Encoder1, Encoder2, VitEncoder, VitEncoderOutput},
    modules::{Aspp, AsppConfig, OutputBlock, OutputBlockConfig},
    skip::SkipConnections,
};
use crate::{
    config::{
        ConvRefinePlan, InputShape, ModelConfig, RefinePlan, RefineStage, ShapePlan,
        VitRefinePlan,
    },
    error::{VitUNetError, VitUNetResult},
};

/// Multiply every channel of `input` by a single-channel `mask`.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - mask: `[batch_size, 1, height, width]`
///   - output: `[batch_size, channels, height, width]`
pub fn gate<B: Backend>(input: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
    input * mask
}

/// Transformer refine stage.
#[derive(Module, Debug)]
pub struct VitRefine<B: Backend> {
    encoder: VitEncoder<B>,
    aspp: Aspp<B>,
    decoder: VitDecoder<B>,
}

impl<B: Backend> VitRefine<B> {
    fn new(plan: &VitRefinePlan, config: &ModelConfig, device: &Device<B>) -> Self {
        Self {
            encoder: VitEncoder::new(plan, &config.block, &config.vit, device),
            aspp: AsppConfig::from_plan(&plan.aspp, &config.block, &config.interpolation)
                .init(device),
            decoder: VitDecoder::new(
                &plan.decoder,
                &config.block,
                &config.vit,
                &config.interpolation,
                device,
            ),
        }
    }

    fn forward(
        &self,
        gated: Tensor<B, 4>,
        skip1: &SkipConnections<Tensor<B, 4>>,
    ) -> VitUNetResult<Tensor<B, 4>> {
        let VitEncoderOutput {
            features,
            tokens,
            conv_skips,
            token_skips,
        } = self.encoder.forward(gated);

        let x = self.aspp.forward(features);
        self.decoder.forward(
            x,
            tokens,
            VitDecoderSkips {
                backbone: skip1,
                conv: &conv_skips,
                tokens: &token_skips,
            },
        )
    }
}

/// Convolutional refine stage.
#[derive(Module, Debug)]
pub struct ConvRefine<B: Backend> {
    encoder: Encoder2<B>,
    aspp: Aspp<B>,
    decoder: Decoder2<B>,
}

impl<B: Backend> ConvRefine<B> {
    fn new(plan: &ConvRefinePlan, config: &ModelConfig, device: &Device<B>) -> Self {
        Self {
            encoder: Encoder2::new(&plan.encoder, &config.block, device),
            aspp: AsppConfig::from_plan(&plan.aspp, &config.block, &config.interpolation)
                .init(device),
            decoder: Decoder2::new(&plan.decoder, &config.block, &config.interpolation, device),
        }
    }

    fn forward(
        &self,
        gated: Tensor<B, 4>,
        skip1: &SkipConnections<Tensor<B, 4>>,
    ) -> VitUNetResult<Tensor<B, 4>> {
        let (x, skip2) = self.encoder.forward(gated);
        let x = self.aspp.forward(x);
        self.decoder.forward(x, skip1, &skip2)
    }
}

/// An enum to wrap the second-stage networks.
#[derive(Module, Debug)]
pub enum RefineModule<B: Backend> {
    Vit(VitRefine<B>),
    Conv(ConvRefine<B>),
}

/// Both masks produced by a forward pass.
#[derive(Debug, Clone)]
pub struct StageOutputs<B: Backend> {
    /// Stage A mask, `[batch_size, 1, height, width]`.
    pub coarse: Tensor<B, 4>,
    /// Stage B mask, `[batch_size, 1, height, width]`.
    pub refined: Tensor<B, 4>,
}

/// Configuration for the `DoubleViTUNet` model.
#[derive(Config, Debug)]
pub struct DoubleViTUNetConfig {
    /// The detailed model configuration.
    pub config: ModelConfig,
}

impl DoubleViTUNetConfig {
    /// Initializes a `DoubleViTUNet` model with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`ModelConfig::plan`] error when the configured input shape
    /// cannot flow through the network. No weights are allocated in that case.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> VitUNetResult<DoubleViTUNet<B>> {
        let plan = self.config.plan()?;
        Ok(DoubleViTUNet::from_plan(&self.config, plan, device))
    }
}

/// Build the reference model for `(height, width, channels)` images.
///
/// # Errors
///
/// See [`DoubleViTUNetConfig::init`].
pub fn build_model<B: Backend>(
    shape: impl Into<InputShape>,
    device: &Device<B>,
) -> VitUNetResult<DoubleViTUNet<B>> {
    let config = ModelConfig::new(shape.into(), Default::default());
    DoubleViTUNetConfig::new(config).init(device)
}

/// Two-stage segmentation network.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]` for the configured shape
///   - output: `[batch_size, 1, height, width]`, values in `[0, 1]`
#[derive(Module, Debug)]
pub struct DoubleViTUNet<B: Backend> {
    input_shape: [usize; 3],
    encoder: Encoder1<B>,
    aspp: Aspp<B>,
    decoder: Decoder1<B>,
    coarse_head: OutputBlock<B>,
    refine: RefineModule<B>,
    refined_head: OutputBlock<B>,
}

impl<B: Backend> DoubleViTUNet<B> {
    fn from_plan(config: &ModelConfig, plan: ShapePlan, device: &Device<B>) -> Self {
        let refine_kind = match plan.refine {
            RefinePlan::Vit(_) => RefineStage::Vit,
            RefinePlan::Conv(_) => RefineStage::Conv,
        };
        tracing::info!(
            height = plan.input.height,
            width = plan.input.width,
            channels = plan.input.channels,
            backbone = ?config.backbone.variant,
            refine = ?refine_kind,
            "building Double ViT-UNet"
        );

        let coarse_head = OutputBlockConfig::new(plan.coarse_channels()).init(device);
        let refined_head = OutputBlockConfig::new(plan.refine.out_channels()).init(device);
        let refine = match &plan.refine {
            RefinePlan::Vit(vit) => RefineModule::Vit(VitRefine::new(vit, config, device)),
            RefinePlan::Conv(conv) => RefineModule::Conv(ConvRefine::new(conv, config, device)),
        };

        let ShapePlan {
            input,
            taps,
            aspp,
            decoder,
            ..
        } = plan;

        Self {
            input_shape: input.chw(),
            encoder: Encoder1::new(&config.backbone.vgg(input.channels), taps, device),
            aspp: AsppConfig::from_plan(&aspp, &config.block, &config.interpolation).init(device),
            decoder: Decoder1::new(&decoder, &config.block, &config.interpolation, device),
            coarse_head,
            refine,
            refined_head,
        }
    }

    /// Configured `[channels, height, width]`.
    pub const fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    fn check_input(&self, x: &Tensor<B, 4>) -> VitUNetResult<()> {
        let [batch_size, channels, height, width] = x.dims();
        if [channels, height, width] == self.input_shape {
            return Ok(());
        }

        let [c, h, w] = self.input_shape;
        Err(VitUNetError::InvalidTensorShape {
            expected: format!("[{batch_size}, {c}, {h}, {w}]"),
            actual: format!("{:?}", x.dims()),
        })
    }

    /// Run both stages and return both masks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensorShape` if `x` does not match the configured shape.
    pub fn forward_stages(&self, x: Tensor<B, 4>) -> VitUNetResult<StageOutputs<B>> {
        self.check_input(&x)?;

        // ---------- Stage A ----------
        let (features, skip1) = self.encoder.forward(x.clone());
        let features = self.aspp.forward(features);
        let features = self.decoder.forward(features, &skip1)?;
        let coarse = self.coarse_head.forward(features);

        // ---------- Stage B ----------
        let gated = gate(x, coarse.clone());
        let features = match &self.refine {
            RefineModule::Vit(refine) => refine.forward(gated, &skip1)?,
            RefineModule::Conv(refine) => refine.forward(gated, &skip1)?,
        };
        let refined = self.refined_head.forward(features);

        Ok(StageOutputs { coarse, refined })
    }

    /// Predict the refined mask.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensorShape` if `x` does not match the configured shape.
    pub fn forward(&self, x: Tensor<B, 4>) -> VitUNetResult<Tensor<B, 4>> {
        self.forward_stages(x).map(|outputs| outputs.refined)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;
    use rstest::rstest;

    use super::*;
    use crate::{config::InterpolationStrategy, tests::TestBackend};

    fn image(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Uniform(0.0, 1.0), &Default::default())
    }

    fn assert_probabilities(mask: Tensor<TestBackend, 4>) {
        assert!(mask.clone().min().into_scalar() >= 0.0);
        assert!(mask.max().into_scalar() <= 1.0);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn forward_yields_single_channel_mask(#[case] batch_size: usize) {
        let device = Default::default();
        let model = build_model::<TestBackend>((32, 32, 3), &device).unwrap();

        let mask = model.forward(image([batch_size, 3, 32, 32])).unwrap();

        assert_eq!(mask.dims(), [batch_size, 1, 32, 32]);
        assert_probabilities(mask);
    }

    #[test]
    fn both_stages_predict_masks() {
        let device = Default::default();
        let model = build_model::<TestBackend>((32, 48, 3), &device).unwrap();

        let StageOutputs { coarse, refined } = model.forward_stages(image([1, 3, 32, 48])).unwrap();

        assert_eq!(coarse.dims(), [1, 1, 32, 48]);
        assert_eq!(refined.dims(), [1, 1, 32, 48]);
        assert_probabilities(coarse);
        assert_probabilities(refined);
    }

    #[test]
    fn conv_refine_stage_runs() {
        let device = Default::default();
        let config = ModelConfig::new(InputShape::new(32, 32), InterpolationStrategy::Nearest)
            .with_refine(RefineStage::Conv);
        let model = DoubleViTUNetConfig::new(config)
            .init::<TestBackend>(&device)
            .unwrap();

        let mask = model.forward(image([1, 3, 32, 32])).unwrap();

        assert_eq!(mask.dims(), [1, 1, 32, 32]);
        assert_probabilities(mask);
    }

    #[test]
    fn gating_preserves_input_shape() {
        let x = image([2, 3, 16, 24]);
        let mask = image([2, 1, 16, 24]);

        let gated = gate(x.clone(), mask);

        assert_eq!(gated.dims(), x.dims());
        // A mask in [0, 1] can only shrink non-negative inputs.
        assert!((x - gated).min().into_scalar() >= 0.0);
    }

    #[test]
    fn zero_mask_blanks_the_image() {
        let device = Default::default();
        let x = image([1, 3, 8, 8]);

        let gated = gate(x, Tensor::zeros([1, 1, 8, 8], &device));

        assert_eq!(gated.abs().sum().into_scalar(), 0.0);
    }

    #[rstest]
    #[case([1, 3, 64, 32])]
    #[case([1, 1, 32, 32])]
    fn forward_rejects_unconfigured_shape(#[case] shape: [usize; 4]) {
        let device = Default::default();
        let model = build_model::<TestBackend>((32, 32, 3), &device).unwrap();

        match model.forward(image(shape)) {
            Err(VitUNetError::InvalidTensorShape { expected, .. }) => {
                assert_eq!(expected, "[1, 3, 32, 32]");
            }
            other => panic!("Expected InvalidTensorShape error, got {:?}", other.map(|t| t.dims())),
        }
    }

    #[test]
    fn invalid_shape_fails_before_allocation() {
        let device = Default::default();

        match build_model::<TestBackend>((40, 32, 3), &device) {
            Err(VitUNetError::InvalidInputShape { height, width, .. }) => {
                assert_eq!([height, width], [40, 32]);
            }
            Err(other) => panic!("Expected InvalidInputShape error, got {other:?}"),
            Ok(_) => panic!("Expected InvalidInputShape error"),
        }
    }

    #[test]
    fn single_channel_images_are_supported() {
        let device = Default::default();
        let model = build_model::<TestBackend>((32, 32, 1), &device).unwrap();

        assert_eq!(model.input_shape(), [1, 32, 32]);
        assert_eq!(model.forward(image([1, 1, 32, 32])).unwrap().dims(), [1, 1, 32, 32]);
    }
}
