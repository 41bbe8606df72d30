use std::path::{Path, PathBuf};

use modelport_core::{
    Device, InferenceAdapter, InferenceError, ModelArtifact, ModelLoadError, ModelMetadata, ModelSource,
    ModelSpec, SerializationError, TensorMap,
};
use tracing::info;

use crate::backends::load_adapter;

/// Adapter rebuilt from a serialized model.
///
/// The artifact is read into memory first and then compiled through the
/// prebuilt-model path, so nothing on disk is touched after `open` returns.
pub struct ReloadedAdapter {
    inner: Box<dyn InferenceAdapter>,
    source: PathBuf,
}

impl ReloadedAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        Self::open_on(path, Device::Cpu)
    }

    pub fn open_on(path: impl AsRef<Path>, device: Device) -> Result<Self, ModelLoadError> {
        let path = path.as_ref();
        let artifact = ModelArtifact::read(path)?;
        let inner = load_adapter(ModelSource::Prebuilt(artifact), device)?;
        info!(path = %path.display(), backend = inner.name(), device = %inner.device(), "reloaded model");
        Ok(Self {
            inner,
            source: path.to_path_buf(),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl InferenceAdapter for ReloadedAdapter {
    fn name(&self) -> &'static str {
        "reloaded"
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn spec(&self) -> &ModelSpec {
        self.inner.spec()
    }

    fn metadata(&self) -> &ModelMetadata {
        self.inner.metadata()
    }

    fn infer(&mut self, inputs: TensorMap) -> Result<TensorMap, InferenceError> {
        self.inner.infer(inputs)
    }

    fn model(&self) -> Result<ModelArtifact, SerializationError> {
        self.inner.model()
    }
}
