use candle_core::DType;
use thiserror::Error;

/// Errors raised by the CRF layer and the tagger built on top of it.
#[derive(Debug, Error)]
pub enum Error {
    /// Any failure reported by candle while running tensor ops.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// The model configuration is inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The requested floating point type is not supported on this build.
    #[error("unsupported dtype {0:?}")]
    UnsupportedDType(DType),

    /// A caller passed tensors whose shape or dtype breaks the call contract.
    #[error("{0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, Error>;
