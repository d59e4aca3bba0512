//! Error types for the hand X-ray segmentation pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shape mismatch at {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Annotation error in {path}: {reason}")]
    Annotation { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Channel-count mismatch at a named fusion point.
    pub fn channels(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::ShapeMismatch {
            context: context.into(),
            expected: format!("{expected} channels"),
            actual: format!("{actual} channels"),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mismatch_message() {
        let err = Error::channels("hd4 fusion", 320, 256);
        assert_eq!(
            err.to_string(),
            "Shape mismatch at hd4 fusion: expected 320 channels, got 256 channels"
        );
    }

    #[test]
    fn test_yaml_error_is_config() {
        let yaml: std::result::Result<Vec<u32>, _> = serde_yaml::from_str("{not: [a list");
        let err: Error = yaml.unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
