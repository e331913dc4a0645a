//! Error types for ncalab-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! problems surface as [`NcaError::Config`] when a trainer, pool or cascade is
//! constructed; failures inside a training step propagate unchanged and abort
//! the whole `train` call.
//!
//! # Example
//!
//! ```rust
//! use ncalab_rs::{NcaError, TrainerConfig};
//!
//! let config = TrainerConfig {
//!     batch_repeat: 0,
//!     ..Default::default()
//! };
//! match config.validate() {
//!     Err(NcaError::Config(msg)) => assert!(msg.contains("batch_repeat")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for ncalab-rs operations.
pub type Result<T> = std::result::Result<T, NcaError>;

/// Errors that can occur in ncalab-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NcaError {
    /// Invalid constructor or call argument.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Loss became NaN or infinite.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Tensor shapes do not fit together.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Shape that was required.
        expected: String,
        /// Shape that was provided.
        got: String,
    },

    /// Checkpoint read or write failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Figure could not be drawn or encoded.
    #[error("plot error: {0}")]
    Plot(String),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl NcaError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a plotting backend error.
    pub fn plot(err: impl std::fmt::Display) -> Self {
        Self::Plot(err.to_string())
    }

    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for NcaError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        NcaError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = NcaError::config("batch_repeat must be >= 1");
        assert_eq!(
            error.to_string(),
            "configuration error: batch_repeat must be >= 1"
        );
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = NcaError::shape_mismatch("[8, 16, 32, 32]", "[8, 12, 32, 32]");
        assert_eq!(
            error.to_string(),
            "shape mismatch: expected [8, 16, 32, 32], got [8, 12, 32, 32]"
        );
    }

    #[test]
    fn test_numeric_instability_display() {
        let error = NcaError::NumericInstability("total loss is NaN".into());
        assert!(error.to_string().starts_with("numeric instability"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "model.safetensors");
        let error: NcaError = io_error.into();
        assert!(matches!(error, NcaError::Io(_)));
        assert!(error.to_string().contains("model.safetensors"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: NcaError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let error: NcaError = a.broadcast_add(&b).unwrap_err().into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: NcaError = io::Error::new(io::ErrorKind::Other, "disk full").into();
        assert!(error.source().is_some());
    }
}
