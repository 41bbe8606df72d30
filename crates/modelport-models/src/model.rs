use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use image::RgbImage;
use modelport_core::metadata::MODEL_TYPE;
use modelport_core::{
    Device, Error, InferenceAdapter, InferenceError, ModelArtifact, ModelLoadError, ModelMetadata, ModelSource,
    ModelSpec, Result, TensorMap,
};
use tracing::{debug, info};

use crate::backends::load_adapter;
use crate::postprocess::{self, Postprocessor};
use crate::preprocess::Preprocessor;
use crate::InferenceResult;

/// Adapter handle the caller keeps a clone of.
pub type SharedAdapter = Arc<Mutex<dyn InferenceAdapter>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Classification,
    Detection,
    InstanceSegmentation,
}

impl ModelKind {
    /// Resolves a `model_type` tag. Case-insensitive.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "classification" => Some(Self::Classification),
            "ssd" | "detection" => Some(Self::Detection),
            "maskrcnn" | "mask_rcnn" | "instance_segmentation" => Some(Self::InstanceSegmentation),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Detection => "ssd",
            Self::InstanceSegmentation => "maskrcnn",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| format!("unknown model kind `{s}`"))
    }
}

/// Construction-time overrides.
#[derive(Clone, Debug, Default)]
pub struct ModelOptions {
    /// Variant to build instead of the one named by `model_type`.
    pub kind: Option<ModelKind>,
    pub device: Device,
    /// Replaces the labels embedded in the metadata.
    pub labels: Option<Vec<String>>,
}

impl ModelOptions {
    pub fn kind(mut self, kind: ModelKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

enum AdapterSlot {
    Owned(Box<dyn InferenceAdapter>),
    Shared(SharedAdapter),
}

impl AdapterSlot {
    fn infer(&mut self, inputs: TensorMap) -> std::result::Result<TensorMap, InferenceError> {
        match self {
            Self::Owned(adapter) => adapter.infer(inputs),
            Self::Shared(adapter) => lock(adapter)?.infer(inputs),
        }
    }

    fn model(&self) -> Result<ModelArtifact> {
        match self {
            Self::Owned(adapter) => Ok(adapter.model()?),
            Self::Shared(adapter) => Ok(lock(adapter)?.model()?),
        }
    }

    fn serialize(&self, destination: &Path) -> Result<()> {
        match self {
            Self::Owned(adapter) => Ok(adapter.serialize(destination)?),
            Self::Shared(adapter) => Ok(lock(adapter)?.serialize(destination)?),
        }
    }
}

fn lock(adapter: &SharedAdapter) -> std::result::Result<MutexGuard<'_, dyn InferenceAdapter + 'static>, InferenceError> {
    adapter
        .lock()
        .map_err(|_| InferenceError::Execution("shared adapter lock poisoned".to_string()))
}

/// A loaded model: one adapter, the metadata snapshot taken at construction,
/// and the pre/post-processing for its variant.
pub struct Model {
    kind: ModelKind,
    device: Device,
    adapter: AdapterSlot,
    metadata: ModelMetadata,
    labels: Vec<String>,
    preprocessor: Preprocessor,
    postprocessor: Box<dyn Postprocessor>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("labels", &self.labels.len())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Loads the model at `path` with default options.
    pub fn create_model(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_model_with(path, ModelOptions::default())
    }

    pub fn create_model_with(path: impl AsRef<Path>, options: ModelOptions) -> Result<Self> {
        let path = path.as_ref();
        let adapter = load_adapter(ModelSource::Path(path.to_path_buf()), options.device.clone())?;
        info!(path = %path.display(), backend = adapter.name(), "loaded model");
        Self::from_adapter_with(adapter, options)
    }

    pub fn from_adapter(adapter: Box<dyn InferenceAdapter>) -> Result<Self> {
        Self::from_adapter_with(adapter, ModelOptions::default())
    }

    /// `options.device` is ignored; the adapter is already bound.
    pub fn from_adapter_with(adapter: Box<dyn InferenceAdapter>, options: ModelOptions) -> Result<Self> {
        let spec = adapter.spec().clone();
        let metadata = adapter.metadata().clone();
        let device = adapter.device().clone();
        Self::assemble(AdapterSlot::Owned(adapter), device, &spec, metadata, &options)
    }

    pub fn from_shared_adapter(adapter: SharedAdapter) -> Result<Self> {
        Self::from_shared_adapter_with(adapter, ModelOptions::default())
    }

    pub fn from_shared_adapter_with(adapter: SharedAdapter, options: ModelOptions) -> Result<Self> {
        let (spec, metadata, device) = {
            let guard = adapter
                .lock()
                .map_err(|_| ModelLoadError::Backend("shared adapter lock poisoned".into()))?;
            (guard.spec().clone(), guard.metadata().clone(), guard.device().clone())
        };
        Self::assemble(AdapterSlot::Shared(adapter), device, &spec, metadata, &options)
    }

    fn assemble(
        adapter: AdapterSlot,
        device: Device,
        spec: &ModelSpec,
        metadata: ModelMetadata,
        options: &ModelOptions,
    ) -> Result<Self> {
        let kind = match options.kind {
            Some(kind) => kind,
            None => {
                let tag = metadata.get(MODEL_TYPE).unwrap_or_default();
                ModelKind::from_tag(tag).ok_or_else(|| Error::UnsupportedArchitecture {
                    tag: tag.to_string(),
                })?
            }
        };

        let input = spec
            .inputs
            .iter()
            .find(|t| t.rank() == 4)
            .ok_or_else(|| ModelLoadError::MissingTensor {
                name: "image input (NCHW)".to_string(),
            })?;
        let preprocessor = Preprocessor::new(input, &metadata)?;
        let labels = options.labels.clone().unwrap_or_else(|| metadata.labels());
        let postprocessor = postprocess::for_kind(kind, spec, &metadata, labels.clone())?;

        info!(kind = %kind, device = %device, labels = labels.len(), "model ready");
        Ok(Self {
            kind,
            device,
            adapter,
            metadata,
            labels,
            preprocessor,
            postprocessor,
        })
    }

    /// Preprocess, run the adapter, decode.
    pub fn infer(&mut self, image: &RgbImage) -> Result<InferenceResult> {
        let (tensor, geometry) = self.preprocessor.run(image)?;
        let inputs = TensorMap::from([(self.preprocessor.input_name().clone(), tensor)]);
        let outputs = self.adapter.infer(inputs)?;
        let result = self.postprocessor.decode(&outputs, &geometry)?;
        debug!(kind = %self.kind, objects = result.len(), "inference done");
        Ok(result)
    }

    /// Structural representation of the bound model.
    pub fn model(&self) -> Result<ModelArtifact> {
        self.adapter.model()
    }

    pub fn serialize(&self, destination: impl AsRef<Path>) -> Result<()> {
        let destination = destination.as_ref();
        self.adapter.serialize(destination)?;
        info!(path = %destination.display(), "serialized model");
        Ok(())
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}
