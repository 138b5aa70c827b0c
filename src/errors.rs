use std::path::PathBuf;
use thiserror::Error;

use crate::model::Delegate;

/// Structured error types for mask decoding, buffer marshaling and the
/// segmentation request lifecycle.
///
/// Construction-time failures (`ModelLoad`) leave the segmenter unusable until
/// it is rebuilt. Per-request failures (`InvalidBufferSize`, `Model`, ...) end
/// the request in the error state. `Cancelled` is not a real failure and is
/// expected to be discarded by callers.
#[derive(Error, Debug)]
pub enum SegmenterError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Model load error: {path:?}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Delegate {requested} is not available on this device")]
    UnsupportedAccelerator { requested: Delegate },

    #[error("Invalid buffer size for {buffer}: expected {expected} bytes, got {actual}")]
    InvalidBufferSize {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid image: {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("Segmentation request was cancelled")]
    Cancelled,

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

impl SegmenterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn model<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Model {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, SegmenterError>;

/// Convert anyhow errors to configuration errors.
///
/// Only the binary's argument checks produce anyhow errors, so they land in the
/// configuration bucket.
impl From<anyhow::Error> for SegmenterError {
    fn from(err: anyhow::Error) -> Self {
        SegmenterError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `SegmenterError::FileSystem` directly.
impl From<std::io::Error> for SegmenterError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for SegmenterError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for SegmenterError {
    fn from(err: ort::Error) -> Self {
        Self::model("ort operation", err)
    }
}

/// Shape errors come out of tensor reshaping around the inference call, so
/// they are reported as model errors.
impl From<ndarray::ShapeError> for SegmenterError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model("tensor shape conversion", err)
    }
}
