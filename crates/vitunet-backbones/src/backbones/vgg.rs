//! VGG feature extractor with named layers.
//!
//! The layer naming scheme follows the common `block{b}_conv{i}` / `block{b}_pool`
//! convention so that skip connections can be selected by name. Only the
//! convolutional trunk is built; there is no classification head.

use core::f64::consts::SQRT_2;

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::{BackboneError, BackboneFeatures, BackboneResult, LayerTap, TapPlan};

/// Output widths of the five VGG blocks.
const BLOCK_WIDTHS: [usize; 5] = [64, 128, 256, 512, 512];

/// VGG variant enumeration
#[derive(Config, Debug, PartialEq, Eq)]
pub enum VggVariant {
    /// VGG16: `[2, 2, 3, 3, 3]` convolutions per block.
    Vgg16,
    /// VGG19: `[2, 2, 4, 4, 4]` convolutions per block.
    Vgg19,
}

impl VggVariant {
    /// Number of 3x3 convolutions in each of the five blocks.
    pub const fn convs_per_block(&self) -> [usize; 5] {
        match self {
            Self::Vgg16 => [2, 2, 3, 3, 3],
            Self::Vgg19 => [2, 2, 4, 4, 4],
        }
    }

    /// Layer table in execution order.
    pub fn layer_specs(&self) -> Vec<VggLayerSpec> {
        let mut specs = Vec::new();
        let mut downsample = 1;

        for (block, (&convs, &width)) in self
            .convs_per_block()
            .iter()
            .zip(BLOCK_WIDTHS.iter())
            .enumerate()
        {
            let block = block + 1;
            for conv in 1..=convs {
                specs.push(VggLayerSpec {
                    name: format!("block{block}_conv{conv}"),
                    kind: VggLayerKind::Conv,
                    channels: width,
                    downsample,
                });
            }
            downsample *= 2;
            specs.push(VggLayerSpec {
                name: format!("block{block}_pool"),
                kind: VggLayerKind::MaxPool,
                channels: width,
                downsample,
            });
        }

        specs
    }

    /// Default skip layers: the last convolution of blocks 1 to 4.
    pub fn default_skip_layers(&self) -> Vec<String> {
        let convs = self.convs_per_block();
        (0..4)
            .map(|block| format!("block{}_conv{}", block + 1, convs[block]))
            .collect()
    }

    /// Default output layer: the last convolution of block 5.
    pub fn default_output_layer(&self) -> String {
        format!("block5_conv{}", self.convs_per_block()[4])
    }
}

/// Kind of a VGG layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggLayerKind {
    /// 3x3 convolution (+ optional batch norm) + ReLU.
    Conv,
    /// 2x2 max pooling with stride 2.
    MaxPool,
}

/// Static description of one VGG layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VggLayerSpec {
    /// Layer name.
    pub name: String,
    /// Layer kind.
    pub kind: VggLayerKind,
    /// Output channels.
    pub channels: usize,
    /// Spatial reduction of the layer output relative to the input image.
    pub downsample: usize,
}

/// VGG configuration
#[derive(Config, Debug)]
pub struct VggConfig {
    /// VGG variant (16 or 19)
    #[config(default = "VggVariant::Vgg19")]
    pub variant: VggVariant,
    /// Use batch normalization
    #[config(default = "false")]
    pub batch_norm: bool,
    /// Channels of the input image
    #[config(default = "3")]
    pub in_channels: usize,
}

impl VggConfig {
    /// Resolves layer names into a [`TapPlan`] without allocating any weights.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::UnknownLayer`] for names not present in the
    /// variant and [`BackboneError::TapOrder`] when the skips are not strictly
    /// ascending or do not precede the output layer.
    pub fn resolve_taps(
        &self,
        skip_layers: &[String],
        output_layer: &str,
    ) -> BackboneResult<TapPlan> {
        let specs = self.variant.layer_specs();
        let lookup = |name: &str| -> BackboneResult<LayerTap> {
            specs
                .iter()
                .position(|spec| spec.name == name)
                .map(|index| LayerTap {
                    name: name.to_owned(),
                    index,
                    channels: specs[index].channels,
                    downsample: specs[index].downsample,
                })
                .ok_or_else(|| BackboneError::UnknownLayer {
                    name: name.to_owned(),
                    available: specs
                        .iter()
                        .map(|spec| spec.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
        };

        let output = lookup(output_layer)?;
        let skips = skip_layers
            .iter()
            .map(|name| lookup(name))
            .collect::<BackboneResult<Vec<_>>>()?;

        let mut chain = skips.iter().chain(core::iter::once(&output)).peekable();
        while let Some(tap) = chain.next() {
            if let Some(next) = chain.peek() {
                if tap.index >= next.index {
                    return Err(BackboneError::TapOrder {
                        layer: tap.name.clone(),
                        next: next.name.clone(),
                    });
                }
            }
        }

        Ok(TapPlan { skips, output })
    }

    /// Initialize VGG model
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggBackbone<B> {
        let specs = self.variant.layer_specs();
        let mut layers = Vec::with_capacity(specs.len());
        let mut current_channels = self.in_channels;

        for spec in &specs {
            match spec.kind {
                VggLayerKind::Conv => {
                    layers.push(VggBlockLayer::Conv(VggConvLayer::new(
                        current_channels,
                        spec.channels,
                        self.batch_norm,
                        device,
                    )));
                    current_channels = spec.channels;
                }
                VggLayerKind::MaxPool => {
                    let maxpool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
                    layers.push(VggBlockLayer::MaxPool(maxpool));
                }
            }
        }

        VggBackbone {
            layers,
            names: Ignored(specs.into_iter().map(|spec| spec.name).collect()),
        }
    }
}

/// VGG convolutional trunk whose layers can be tapped by name.
#[derive(Module, Debug)]
pub struct VggBackbone<B: Backend> {
    layers: Vec<VggBlockLayer<B>>,
    names: Ignored<Vec<String>>,
}

impl<B: Backend> VggBackbone<B> {
    /// Runs the layers up to and including `taps.output`.
    ///
    /// # Shapes
    /// * `input` - `[batch_size, in_channels, height, width]`
    /// * skips - `[batch_size, tap.channels, height / tap.downsample, width / tap.downsample]`
    pub fn forward_taps(&self, mut input: Tensor<B, 4>, taps: &TapPlan) -> BackboneFeatures<B> {
        let mut skips = Vec::with_capacity(taps.skips.len());
        let mut pending = taps.skips.iter().peekable();

        for (index, layer) in self.layers.iter().enumerate().take(taps.output.index + 1) {
            input = layer.forward(input);
            if pending.next_if(|tap| tap.index == index).is_some() {
                skips.push(input.clone());
            }
        }

        BackboneFeatures {
            skips,
            output: input,
        }
    }

    /// Forward pass through every layer.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(input, |input, layer| layer.forward(input))
    }

    /// Layer names in execution order.
    pub fn layer_names(&self) -> Vec<String> {
        self.names.0.clone()
    }
}

/// Individual layer types in VGG feature blocks.
#[derive(Module, Debug)]
pub enum VggBlockLayer<B: Backend> {
    /// Convolution layer with optional batch normalization.
    Conv(VggConvLayer<B>),
    /// Max pooling layer.
    MaxPool(MaxPool2d),
}

impl<B: Backend> VggBlockLayer<B> {
    /// Forward pass through the layer.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(input),
            Self::MaxPool(pool) => pool.forward(input),
        }
    }
}

/// VGG convolution layer with optional batch normalization.
#[derive(Module, Debug)]
pub struct VggConvLayer<B: Backend> {
    conv: Conv2d<B>,
    batch_norm: Option<BatchNorm<B, 2>>,
    relu: Relu,
}

impl<B: Backend> VggConvLayer<B> {
    /// Forward pass through the convolution layer.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        let out = if let Some(bn) = &self.batch_norm {
            bn.forward(out)
        } else {
            out
        };
        self.relu.forward(out)
    }

    /// Create a new VGG convolution layer.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        batch_norm: bool,
        device: &Device<B>,
    ) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        // 3x3 conv, stride=1, padding=1
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([1, 1])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(!batch_norm)
            .with_initializer(initializer)
            .init(device);

        let batch_norm = batch_norm.then(|| BatchNormConfig::new(out_channels).init(device));

        Self {
            conv,
            batch_norm,
            relu: Relu::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;
    use rstest::rstest;

    use super::*;
    use crate::tests::TestBackend;

    fn names(layers: &[&str]) -> Vec<String> {
        layers.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn vgg19_default_taps_match_keras_names() {
        let variant = VggVariant::Vgg19;
        assert_eq!(
            variant.default_skip_layers(),
            names(&["block1_conv2", "block2_conv2", "block3_conv4", "block4_conv4"])
        );
        assert_eq!(variant.default_output_layer(), "block5_conv4");
    }

    #[rstest]
    #[case(VggVariant::Vgg16, 18)]
    #[case(VggVariant::Vgg19, 21)]
    fn layer_table_counts_convs_and_pools(#[case] variant: VggVariant, #[case] expected: usize) {
        assert_eq!(variant.layer_specs().len(), expected);
    }

    #[test]
    fn resolve_taps_reports_channels_and_downsample() {
        let config = VggConfig::new();
        let variant = VggVariant::Vgg19;
        let plan = config
            .resolve_taps(
                &variant.default_skip_layers(),
                &variant.default_output_layer(),
            )
            .unwrap();

        let channels: Vec<_> = plan.skips.iter().map(|tap| tap.channels).collect();
        let downsample: Vec<_> = plan.skips.iter().map(|tap| tap.downsample).collect();
        assert_eq!(channels, [64, 128, 256, 512]);
        assert_eq!(downsample, [1, 2, 4, 8]);
        assert_eq!(plan.output.channels, 512);
        assert_eq!(plan.output.downsample, 16);
    }

    #[test]
    fn resolve_taps_rejects_unknown_layer() {
        // block3_conv4 does not exist in VGG16.
        let config = VggConfig::new().with_variant(VggVariant::Vgg16);
        let result = config.resolve_taps(&names(&["block1_conv2", "block3_conv4"]), "block5_conv3");

        match result {
            Err(BackboneError::UnknownLayer { name, available }) => {
                assert_eq!(name, "block3_conv4");
                assert!(available.contains("block3_conv3"));
            }
            other => panic!("Expected UnknownLayer error, got {other:?}"),
        }
    }

    #[test]
    fn resolve_taps_rejects_skip_after_output() {
        let config = VggConfig::new();
        let result = config.resolve_taps(&names(&["block5_conv4"]), "block4_conv4");

        assert_eq!(
            result,
            Err(BackboneError::TapOrder {
                layer: "block5_conv4".to_owned(),
                next: "block4_conv4".to_owned(),
            })
        );
    }

    #[test]
    fn vgg19_forward_taps_returns_correct_feature_shapes() {
        let device = Default::default();
        let config = VggConfig::new();
        let variant = VggVariant::Vgg19;
        let taps = config
            .resolve_taps(
                &variant.default_skip_layers(),
                &variant.default_output_layer(),
            )
            .unwrap();
        let model = config.init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 48],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward_taps(input, &taps);

        assert_eq!(features.skips.len(), 4);
        assert_eq!(features.skips[0].dims(), [1, 64, 32, 48]);
        assert_eq!(features.skips[1].dims(), [1, 128, 16, 24]);
        assert_eq!(features.skips[2].dims(), [1, 256, 8, 12]);
        assert_eq!(features.skips[3].dims(), [1, 512, 4, 6]);
        assert_eq!(features.output.dims(), [1, 512, 2, 3]);
    }

    #[test]
    fn vgg16_bn_full_forward_reduces_by_32() {
        let device = Default::default();
        let model = VggConfig::new()
            .with_variant(VggVariant::Vgg16)
            .with_batch_norm(true)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(model.forward(input).dims(), [1, 512, 1, 1]);
        assert_eq!(model.layer_names().len(), 18);
    }
}
