//! Building blocks shared by the encoders, decoders and bottlenecks.

mod aspp;
mod conv_block;
mod output_block;
mod patches;
mod squeeze_excite;
mod transformer;
pub mod utils;

pub use aspp::{Aspp, AsppBranch, AsppBranchConfig, AsppConfig, GlobalAvgPool};
pub use conv_block::{ConvBlock, ConvBlockConfig};
pub use output_block::{OutputBlock, OutputBlockConfig};
pub use patches::{fold_tokens, PatchEncoder, PatchEncoderConfig, Patches};
pub use squeeze_excite::{SqueezeExcite, SqueezeExciteConfig};
pub use transformer::{
    Mlp, MlpConfig, TransformerDecoderBlock, TransformerDecoderBlockConfig,
    TransformerEncoderBlock, TransformerEncoderBlockConfig,
};
