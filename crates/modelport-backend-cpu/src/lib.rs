//! Reference CPU backend for the modelport graph format.
//!
//! Models are a JSON structure document plus an optional `.bin` sidecar with
//! f32 constants. The interpreter is small and deterministic: the
//! same graph and inputs always produce the same output bits.

mod builder;
mod graph;
mod ops;

use modelport_core::{
    ArtifactFormat, Backend, BackendCapabilities, Device, InferenceAdapter, InferenceError,
    ModelArtifact, ModelLoadError, ModelMetadata, ModelSource, ModelSpec, SerializationError,
    TensorMap,
};
use tracing::{debug, info};

pub use builder::GraphBuilder;
pub use graph::{ConstantDecl, ElementType, Graph, GraphDocument, Node, ValueDecl, FORMAT_VERSION};

pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpuAdapter {
    graph: Graph,
    device: Device,
}

impl CpuAdapter {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Backend for CpuBackend {
    type Adapter = CpuAdapter;

    fn name(&self) -> &'static str {
        "cpu-graph"
    }

    fn load(&self, source: ModelSource, device: Device) -> Result<Self::Adapter, ModelLoadError> {
        if device != Device::Cpu {
            return Err(ModelLoadError::DeviceUnavailable {
                device,
                backend: self.name(),
            });
        }

        let artifact = source.into_artifact()?;
        let graph = Graph::from_artifact(&artifact)?;

        info!(
            model = graph.name(),
            inputs = graph.spec().inputs.len(),
            outputs = graph.spec().outputs.len(),
            "loaded graph model"
        );

        Ok(CpuAdapter { graph, device })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            format: ArtifactFormat::Graph,
            supports_dynamic_shapes: true,
            supports_cuda: false,
        }
    }
}

impl InferenceAdapter for CpuAdapter {
    fn name(&self) -> &'static str {
        "cpu-graph"
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn spec(&self) -> &ModelSpec {
        self.graph.spec()
    }

    fn metadata(&self) -> &ModelMetadata {
        self.graph.metadata()
    }

    fn infer(&mut self, inputs: TensorMap) -> Result<TensorMap, InferenceError> {
        debug!(model = self.graph.name(), inputs = inputs.len(), "running graph");
        self.graph.run(&inputs)
    }

    fn model(&self) -> Result<ModelArtifact, SerializationError> {
        self.graph.to_artifact()
    }
}
