//! Error type shared by every build-time and per-call check in the crate.
//!
//! Configuration and parameter errors are raised while the model is being
//! built, before any training step runs. Only `Shape` can surface per call.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PixelDpError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("non-finite value {value} in parameter '{name}'")]
    NonFinite { name: String, value: f64 },
    #[error("shape error: {0}")]
    Shape(String),
    #[error("config load failed: {0}")]
    Load(#[from] config::ConfigError),
    #[error("architecture parse failed: {0}")]
    Architecture(#[from] serde_yaml::Error),
    #[error("telemetry init failed: {0}")]
    Telemetry(String),
}

impl PixelDpError {
    pub(crate) fn config(msg: impl Into<String>) -> Self { Self::Configuration(msg.into()) }
    pub(crate) fn shape(msg: impl Into<String>) -> Self { Self::Shape(msg.into()) }
}

impl From<ndarray::ShapeError> for PixelDpError {
    fn from(e: ndarray::ShapeError) -> Self { Self::Shape(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, PixelDpError>;
