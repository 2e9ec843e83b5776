//! Configuration module for the Double ViT-UNet.
//!
//! - `core`: the configuration structures
//! - `enums`: enumeration types used in configurations
//! - `plan`: the validated shape plan derived from a configuration

mod core;
mod enums;
mod plan;

pub use core::{
    AsppStageConfig, BackboneConfig, BlockConfig, DecoderConfig, InputShape, ModelConfig, VitConfig,
};

pub use enums::{InterpolationStrategy, RefineStage};
pub use plan::{
    AsppPlan, BlockPlan, ConvRefinePlan, RefinePlan, ShapePlan, TokenPlan, VitDecoderStagePlan,
    VitEncoderStagePlan, VitRefinePlan, BOTTLENECK_STRIDE, STAGES,
};
