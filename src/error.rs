//! Error types for the vision transformer encoder.

use burn::record::RecorderError;
use thiserror::Error;

/// Result type alias for encoder operations.
pub type Result<T> = std::result::Result<T, VitError>;

/// Errors raised while building, running, or checking an encoder.
#[derive(Error, Debug)]
pub enum VitError {
    /// Image dimensions are not an integer multiple of the patch dimensions.
    #[error(
        "image dimensions {image_height}x{image_width} must be divisible by the patch size {patch_height}x{patch_width}"
    )]
    IndivisibleImage {
        image_height: usize,
        image_width: usize,
        patch_height: usize,
        patch_width: usize,
    },

    /// Pooling mode outside of `cls` / `mean`.
    #[error("pool type must be either cls (cls token) or mean (mean pooling), got `{0}`")]
    UnknownPool(String),

    /// Any other rejected construction parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Forward input does not match the construction-time image shape.
    #[error("shape mismatch: expected [_, {expected:?}], got [_, {actual:?}]")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("tensor `{0}` missing from reference")]
    MissingTensor(&'static str),

    #[error("tensor `{tensor}` rank mismatch: expected {expected}, got {actual}")]
    UnexpectedRank {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("tensor `{tensor}` has dtype {actual}, expected F32")]
    UnexpectedDtype {
        tensor: &'static str,
        actual: String,
    },

    #[error("tensor `{tensor}` length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("tensor serialization error: {0}")]
    TensorData(String),
}

impl VitError {
    /// Whether this error belongs to the construction-time configuration family.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::IndivisibleImage { .. } | Self::UnknownPool(_) | Self::InvalidConfig(_)
        )
    }
}
