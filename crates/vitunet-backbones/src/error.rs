use thiserror::Error;

/// Errors raised while resolving or building a backbone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackboneError {
    /// The requested layer name is not part of the backbone.
    #[error("Unknown backbone layer `{name}` (available: {available})")]
    UnknownLayer {
        /// The name that failed to resolve.
        name: String,
        /// Comma separated list of valid layer names.
        available: String,
    },

    /// A skip tap does not run strictly before the next tap.
    #[error("Layer `{layer}` must run before `{next}`")]
    TapOrder {
        /// The misplaced layer.
        layer: String,
        /// The layer it must precede.
        next: String,
    },
}

/// A specialized `Result` type for backbone operations.
pub type BackboneResult<T> = Result<T, BackboneError>;
