use thiserror::Error;

use crate::context::Mode;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while setting up or running a layer.
///
/// None of these are retried. A failed `set_up`, `forward` or `backward`
/// leaves no partial output the caller should trust.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rank or size doesn't fit the layer's configuration.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An accelerator view or kernel was requested, but the context has no
    /// accelerator.
    #[error("no accelerator is configured in this context")]
    DeviceUnavailable,

    /// The layer has no implementation of `op` for this device mode.
    #[error("layer {layer:?} has no {mode:?} implementation of {op}")]
    UnsupportedMode {
        layer: String,
        op: &'static str,
        mode: Mode,
    },

    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to start accelerator: {0}")]
    DeviceInit(#[from] rayon::ThreadPoolBuildError),
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::ShapeMismatch(err.to_string())
    }
}
