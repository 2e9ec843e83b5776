use thiserror::Error;
use vitunet_backbones::BackboneError;

/// The error type for Double ViT-UNet operations.
///
/// Every variant except [`VitUNetError::InvalidTensorShape`] is raised while the
/// model is being constructed, before any weights are allocated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VitUNetError {
    /// Configuration parameters are logically inconsistent.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// The configured input shape cannot flow through the network.
    #[error("Invalid input shape {height}x{width}x{channels}: {reason}")]
    InvalidInputShape {
        /// Configured height.
        height: usize,
        /// Configured width.
        width: usize,
        /// Configured channels.
        channels: usize,
        /// Which constraint was violated.
        reason: String,
    },

    /// Patch tokens cannot be folded onto a spatial grid of the given size.
    #[error(
        "Cannot fold {num_patches}x{projection_dim} tokens onto a {height}x{width} grid at {site}"
    )]
    TokenReshape {
        /// Where in the network the fold happens.
        site: String,
        /// Number of patch tokens.
        num_patches: usize,
        /// Token width.
        projection_dim: usize,
        /// Target grid height.
        height: usize,
        /// Target grid width.
        width: usize,
    },

    /// A skip connection list does not match the decoder depth.
    #[error("Expected {expected} skip connections for {list}, got {actual}")]
    SkipCountMismatch {
        /// Which list was wrong.
        list: String,
        /// Number of decoder stages.
        expected: usize,
        /// Number of captured entries.
        actual: usize,
    },

    /// An input tensor has an invalid shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },

    /// The backbone could not be resolved.
    #[error(transparent)]
    Backbone(#[from] BackboneError),
}

/// A specialized `Result` type for Double ViT-UNet operations.
pub type VitUNetResult<T> = Result<T, VitUNetError>;
