//! Backbone implementations for the Double ViT-UNet
//!
//! This crate provides the convolutional feature extractors used by the coarse
//! segmentation stage. Backbones expose their layers by name so that callers can
//! tap intermediate activations as skip connections.

mod backbones;
mod error;

pub use backbones::vgg::{
    VggBackbone, VggBlockLayer, VggConfig, VggConvLayer, VggLayerKind, VggLayerSpec, VggVariant,
};
use burn::prelude::*;
pub use error::{BackboneError, BackboneResult};

/// A named layer selected as an output of the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerTap {
    /// Layer name, e.g. `block3_conv4`.
    pub name: String,
    /// Position of the layer in execution order.
    pub index: usize,
    /// Channels produced by the layer.
    pub channels: usize,
    /// Spatial reduction relative to the backbone input.
    pub downsample: usize,
}

/// Resolved set of layers to read during a forward pass.
///
/// Skip taps are strictly ascending in execution order and all precede the
/// output tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapPlan {
    /// Intermediate activations, shallow to deep.
    pub skips: Vec<LayerTap>,
    /// The deepest activation returned as the backbone output.
    pub output: LayerTap,
}

/// Activations captured by [`Backbone::forward_taps`].
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    /// One tensor per skip tap, in the order of [`TapPlan::skips`].
    pub skips: Vec<Tensor<B, 4>>,
    /// Activation of the output tap.
    pub output: Tensor<B, 4>,
}

/// Unified backbone trait for the coarse encoder
pub trait Backbone<B: Backend> {
    /// Runs the backbone up to `taps.output`, capturing the skip activations.
    ///
    /// # Arguments
    /// * `input` - Input tensor of shape `[batch_size, channels, height, width]`
    fn forward_taps(&self, input: Tensor<B, 4>, taps: &TapPlan) -> BackboneFeatures<B>;

    /// Names of all layers, in execution order.
    fn layer_names(&self) -> Vec<String>;
}

impl<B: Backend> Backbone<B> for VggBackbone<B> {
    fn forward_taps(&self, input: Tensor<B, 4>, taps: &TapPlan) -> BackboneFeatures<B> {
        self.forward_taps(input, taps)
    }

    fn layer_names(&self) -> Vec<String> {
        self.layer_names()
    }
}
