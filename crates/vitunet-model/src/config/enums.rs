//! Enumeration types used in the model configuration.

use burn::prelude::*;

/// Defines the interpolation strategy for tensor resizing operations.
///
/// Burn's autodiff backends only support nearest-neighbour interpolation in the
/// backward pass, so differentiable runs should pick `Nearest`.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum InterpolationStrategy {
    /// Bilinear upsampling (inference only).
    Bilinear,
    /// Nearest-neighbour upsampling (works in both training and inference).
    Nearest,
}

impl Default for InterpolationStrategy {
    fn default() -> Self {
        Self::Bilinear
    }
}

/// Which network refines the gated input in the second stage.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum RefineStage {
    /// Dual-branch convolution + patch-token transformer encoder/decoder.
    Vit,
    /// Plain convolutional U-Net encoder/decoder.
    Conv,
}

impl Default for RefineStage {
    fn default() -> Self {
        Self::Vit
    }
}
