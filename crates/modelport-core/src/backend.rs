use std::path::Path;

use crate::{
    ArtifactFormat, Device, InferenceError, ModelArtifact, ModelLoadError, ModelMetadata,
    ModelSource, ModelSpec, SerializationError, TensorMap,
};

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub format: ArtifactFormat,
    pub supports_dynamic_shapes: bool,
    pub supports_cuda: bool,
}

/// Compiles model representations into adapters bound to a device.
pub trait Backend: Send + Sync + 'static {
    type Adapter: InferenceAdapter;

    fn name(&self) -> &'static str;
    fn load(&self, source: ModelSource, device: Device) -> Result<Self::Adapter, ModelLoadError>;
    fn capabilities(&self) -> BackendCapabilities;
}

/// A model bound to an execution device.
///
/// This is the only thing a `Model` sees of a backend: any implementation can
/// be swapped in, including one reconstructed from a serialized artifact.
pub trait InferenceAdapter: Send {
    fn name(&self) -> &'static str;
    fn device(&self) -> &Device;
    fn spec(&self) -> &ModelSpec;
    fn metadata(&self) -> &ModelMetadata;

    /// Synchronous forward pass over named tensors.
    fn infer(&mut self, inputs: TensorMap) -> Result<TensorMap, InferenceError>;

    /// Structural representation of the bound model.
    fn model(&self) -> Result<ModelArtifact, SerializationError>;

    fn serialize(&self, destination: &Path) -> Result<(), SerializationError> {
        self.model()?.write(destination)
    }
}

impl<A: InferenceAdapter + ?Sized> InferenceAdapter for Box<A> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn device(&self) -> &Device {
        (**self).device()
    }
    fn spec(&self) -> &ModelSpec {
        (**self).spec()
    }
    fn metadata(&self) -> &ModelMetadata {
        (**self).metadata()
    }
    fn infer(&mut self, inputs: TensorMap) -> Result<TensorMap, InferenceError> {
        (**self).infer(inputs)
    }
    fn model(&self) -> Result<ModelArtifact, SerializationError> {
        (**self).model()
    }
    fn serialize(&self, destination: &Path) -> Result<(), SerializationError> {
        (**self).serialize(destination)
    }
}
