use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::{ModelLoadError, SerializationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// JSON graph document with an optional `.bin` weights sidecar.
    Graph,
    /// Self-contained ONNX protobuf.
    Onnx,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Result<Self, ModelLoadError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Self::Graph),
            Some(ext) if ext.eq_ignore_ascii_case("onnx") => Ok(Self::Onnx),
            _ => Err(ModelLoadError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Graph => "json",
            Self::Onnx => "onnx",
        }
    }
}

/// Sidecar weights file for a structure file: same stem, `.bin` extension.
pub fn weights_path(structure: &Path) -> PathBuf {
    structure.with_extension("bin")
}

/// Serialized model: the structural document plus optional binary weights.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelArtifact {
    pub format: ArtifactFormat,
    pub structure: Bytes,
    pub weights: Option<Bytes>,
}

/// Where a backend should load a model from.
#[derive(Clone, Debug)]
pub enum ModelSource {
    Path(PathBuf),
    Prebuilt(ModelArtifact),
}

impl ModelSource {
    pub fn into_artifact(self) -> Result<ModelArtifact, ModelLoadError> {
        match self {
            ModelSource::Path(path) => ModelArtifact::read(&path),
            ModelSource::Prebuilt(artifact) => Ok(artifact),
        }
    }
}

impl ModelArtifact {
    pub fn new(format: ArtifactFormat, structure: impl Into<Bytes>) -> Self {
        Self {
            format,
            structure: structure.into(),
            weights: None,
        }
    }

    pub fn with_weights(mut self, weights: impl Into<Bytes>) -> Self {
        self.weights = Some(weights.into());
        self
    }

    pub fn read(path: &Path) -> Result<Self, ModelLoadError> {
        let format = ArtifactFormat::from_path(path)?;
        let structure = read_file(path)?.ok_or_else(|| ModelLoadError::NotFound(path.to_path_buf()))?;

        let weights = match format {
            ArtifactFormat::Graph => read_file(&weights_path(path))?,
            ArtifactFormat::Onnx => None,
        };

        debug!(
            path = %path.display(),
            structure_bytes = structure.len(),
            weights_bytes = weights.as_ref().map_or(0, Bytes::len),
            "read model artifact"
        );

        Ok(Self {
            format,
            structure,
            weights,
        })
    }

    /// Writes the structure to `destination` and weights, if any, to the sidecar.
    pub fn write(&self, destination: &Path) -> Result<(), SerializationError> {
        if self.structure.is_empty() {
            return Err(SerializationError::Incomplete(
                "structure document is empty".to_string(),
            ));
        }

        write_file(destination, &self.structure)?;
        if let Some(weights) = &self.weights {
            write_file(&weights_path(destination), weights)?;
        }

        debug!(path = %destination.display(), "wrote model artifact");
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Option<Bytes>, ModelLoadError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), SerializationError> {
    fs::write(path, data).map_err(|source| SerializationError::Io {
        path: path.to_path_buf(),
        source,
    })
}
