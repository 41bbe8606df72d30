use modelport_backend_cpu::CpuBackend;
use modelport_core::{ArtifactFormat, Backend, Device, InferenceAdapter, ModelLoadError, ModelSource};

/// Builds a live adapter for `source`, choosing the backend from its format.
pub fn load_adapter(source: ModelSource, device: Device) -> Result<Box<dyn InferenceAdapter>, ModelLoadError> {
    let format = match &source {
        ModelSource::Path(path) => ArtifactFormat::from_path(path)?,
        ModelSource::Prebuilt(artifact) => artifact.format,
    };
    match format {
        ArtifactFormat::Graph => Ok(Box::new(CpuBackend::new().load(source, device)?)),
        ArtifactFormat::Onnx => load_onnx(source, device),
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(source: ModelSource, device: Device) -> Result<Box<dyn InferenceAdapter>, ModelLoadError> {
    Ok(Box::new(modelport_backend_ort::OrtBackend::new().load(source, device)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(_source: ModelSource, _device: Device) -> Result<Box<dyn InferenceAdapter>, ModelLoadError> {
    Err(ModelLoadError::Backend(
        "ONNX models need modelport-models built with the `onnx` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn unknown_extensions_are_rejected() {
        let err = load_adapter(ModelSource::Path(PathBuf::from("model.xml")), Device::Cpu).err();
        assert!(matches!(err, Some(ModelLoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_graph_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_adapter(ModelSource::Path(dir.path().join("absent.json")), Device::Cpu).err();
        assert!(matches!(err, Some(ModelLoadError::NotFound(_))));
    }
}
