//! Double ViT-UNet: a two-stage segmentation network.
//!
//! This crate bundles the model with backend selection and the reports used
//! by the `vitunet` command line tool.

pub mod backend;
pub mod report;

#[doc(inline)]
pub use vitunet_model as model;

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
