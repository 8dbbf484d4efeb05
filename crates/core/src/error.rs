//! Error taxonomy for a slow-motion run.
//!
//! Every variant is fatal for the run it occurs in. The controller guarantees
//! that source and sink are released before one of these reaches the caller.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlowmoError {
    /// Invalid multiplier, missing or unreadable source, unusable device request.
    /// Always reported before any output frame is written.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A frame could not be decoded from the source mid-stream.
    #[error("decode error: {0}")]
    Decode(String),

    /// The flow estimator or its device runtime failed during a call.
    #[error("inference error: {0}")]
    Inference(String),

    /// Two images handed to the flow estimator had different dimensions.
    #[error("shape mismatch: {first_width}x{first_height} vs {second_width}x{second_height}")]
    ShapeMismatch {
        first_width: u32,
        first_height: u32,
        second_width: u32,
        second_height: u32,
    },

    /// Device memory could not be allocated. Never retried.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A frame could not be written, or the sink failed to flush on close.
    #[error("encode error: {0}")]
    Encode(String),

    /// The blocking streaming worker did not finish normally.
    #[error("streaming worker failed: {0}")]
    Worker(String),
}

/// Class of a [`SlowmoError`], independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Decode,
    Inference,
    ShapeMismatch,
    ResourceExhausted,
    Encode,
    Worker,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "ConfigurationError",
            Self::Decode => "DecodeError",
            Self::Inference => "InferenceError",
            Self::ShapeMismatch => "ShapeMismatch",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Encode => "EncodeError",
            Self::Worker => "WorkerError",
        };
        f.write_str(name)
    }
}

impl SlowmoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Inference(_) => ErrorKind::Inference,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Encode(_) => ErrorKind::Encode,
            Self::Worker(_) => ErrorKind::Worker,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference(message.into())
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// Classify a failure reported by the inference runtime.
    ///
    /// Allocation failures become [`SlowmoError::ResourceExhausted`]; everything
    /// else is an [`SlowmoError::Inference`] error. The full anyhow chain is kept
    /// in the message.
    pub fn from_runtime(error: &anyhow::Error) -> Self {
        let message = format!("{error:#}");
        if is_allocation_failure(&message) {
            Self::ResourceExhausted(message)
        } else {
            Self::Inference(message)
        }
    }
}

fn is_allocation_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("cudaerrormemoryallocation")
        || lower.contains("bad_alloc")
}

pub type Result<T> = std::result::Result<T, SlowmoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            SlowmoError::configuration("x").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(SlowmoError::decode("x").kind(), ErrorKind::Decode);
        assert_eq!(SlowmoError::inference("x").kind(), ErrorKind::Inference);
        assert_eq!(SlowmoError::encode("x").kind(), ErrorKind::Encode);
        let mismatch = SlowmoError::ShapeMismatch {
            first_width: 64,
            first_height: 32,
            second_width: 32,
            second_height: 32,
        };
        assert_eq!(mismatch.kind(), ErrorKind::ShapeMismatch);
        assert_eq!(mismatch.to_string(), "shape mismatch: 64x32 vs 32x32");
    }

    #[test]
    fn runtime_allocation_failures_are_resource_exhausted() {
        let err = anyhow::anyhow!("CUDA failure 2: out of memory")
            .context("session run failed");
        assert_eq!(
            SlowmoError::from_runtime(&err).kind(),
            ErrorKind::ResourceExhausted
        );

        let err = anyhow::anyhow!("Failed to allocate memory for requested buffer of size 1024");
        assert_eq!(
            SlowmoError::from_runtime(&err).kind(),
            ErrorKind::ResourceExhausted
        );
    }

    #[test]
    fn other_runtime_failures_are_inference_errors() {
        let err = anyhow::anyhow!("Non-zero status code returned while running Conv node");
        let classified = SlowmoError::from_runtime(&err);
        assert_eq!(classified.kind(), ErrorKind::Inference);
        assert!(classified.to_string().contains("Conv node"));
    }

    #[test]
    fn error_kind_display_names_the_class() {
        assert_eq!(ErrorKind::Inference.to_string(), "InferenceError");
        assert_eq!(ErrorKind::Configuration.to_string(), "ConfigurationError");
    }
}
