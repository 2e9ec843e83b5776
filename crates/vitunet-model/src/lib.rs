//! # Double ViT-UNet
//!
//! A two-stage image segmentation network built with the Burn deep learning
//! framework. A VGG U-Net predicts a coarse mask, the input is gated by that
//! mask, and a U-Net whose encoder and decoder carry a parallel stream of
//! patch tokens refines it.
//!
//! ## Modules
//!
//! - `config`: configuration structures and the construction-time shape plan.
//! - `error`: the error type shared by construction and forward passes.
//! - `models`: encoders, decoders, bottlenecks and the full model.
//!
//! ## Key Components
//!
//! - [`build_model`]: builds the reference model for an input shape.
//! - [`DoubleViTUNet`]: the model.
//! - [`ModelConfig`]: drives the construction.
//! - [`ShapePlan`]: every channel count and spatial size, resolved before any
//!   weight is allocated.

mod config;
mod error;
pub mod models;

#[doc(inline)]
pub use config::{
    AsppPlan, AsppStageConfig, BackboneConfig, BlockConfig, BlockPlan, ConvRefinePlan,
    DecoderConfig, InputShape, InterpolationStrategy, ModelConfig, RefinePlan, RefineStage,
    ShapePlan, TokenPlan, VitConfig, VitDecoderStagePlan, VitEncoderStagePlan, VitRefinePlan,
    BOTTLENECK_STRIDE, STAGES,
};
#[doc(inline)]
pub use error::{VitUNetError, VitUNetResult};
#[doc(inline)]
pub use models::vitunet::{
    build_model, gate, DoubleViTUNet, DoubleViTUNetConfig, DoubleViTUNetRecord, RefineModule,
    StageOutputs,
};
pub use vitunet_backbones::{BackboneError, VggVariant};

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
