//! Error taxonomy shared by every modelport crate.
//!
//! Loading, inference and serialization failures each have their own enum so
//! callers can tell which pipeline step failed; [`Error`] wraps all of them for
//! the model-level API.

use std::path::PathBuf;

use thiserror::Error;

use crate::{DType, Device};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for model-level operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported model format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("malformed model representation: {0}")]
    Malformed(String),

    #[error("device {device} is not available for the {backend} backend")]
    DeviceUnavailable { device: Device, backend: &'static str },

    #[error("required tensor `{name}` is absent from the model")]
    MissingTensor { name: String },

    #[error("invalid metadata value for `{key}`: {message}")]
    InvalidMetadata { key: String, message: String },

    #[error("backend failed to load the model")]
    Backend(#[source] BoxError),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("missing input tensor `{0}`")]
    MissingInput(String),

    #[error("missing output tensor `{0}`")]
    MissingOutput(String),

    #[error("shape mismatch for `{name}`: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("dtype mismatch for `{name}`: expected {expected}, got {actual}")]
    DTypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },

    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("backend execution failed")]
    Backend(#[source] BoxError),
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model state is incomplete: {0}")]
    Incomplete(String),

    #[error("refusing to overwrite existing file {}", .0.display())]
    AlreadyExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] ModelLoadError),

    #[error("unsupported architecture `{tag}`")]
    UnsupportedArchitecture { tag: String },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("results diverged after save/load: {0}")]
    RoundTripMismatch(String),
}
