use bytes::Bytes;
use modelport_core::{
    ArtifactFormat, Backend, BackendCapabilities, DType, Device, IOName, InferenceAdapter,
    InferenceError, ModelArtifact, ModelLoadError, ModelMetadata, ModelSource, ModelSpec,
    SerializationError, Shape, Tensor, TensorMap, TensorSpec,
};
use ort::{
    session::{builder::SessionBuilder, Session, SessionInputValue},
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::{debug, info};

pub struct OrtBackend;

impl OrtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OrtAdapter {
    spec: ModelSpec,
    metadata: ModelMetadata,
    session: Session,
    device: Device,
    /// ONNX bytes the session was committed from; written back by `serialize`.
    onnx: Bytes,
}

impl Backend for OrtBackend {
    type Adapter = OrtAdapter;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn load(&self, source: ModelSource, device: Device) -> Result<Self::Adapter, ModelLoadError> {
        let artifact = source.into_artifact()?;
        if artifact.format != ArtifactFormat::Onnx {
            return Err(ModelLoadError::Malformed(
                "onnxruntime backend expects an ONNX model".to_string(),
            ));
        }

        let builder = Session::builder()
            .map_err(backend_err)?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(backend_err)?;

        let builder = configure_session_builder(builder, &device)?;

        let session = builder
            .commit_from_memory(&artifact.structure)
            .map_err(backend_err)?;

        let spec = build_model_spec(&session)?;
        let metadata = read_metadata(&session)?;

        info!(
            device = %device,
            inputs = spec.inputs.len(),
            outputs = spec.outputs.len(),
            "loaded ONNX model"
        );

        Ok(OrtAdapter {
            spec,
            metadata,
            session,
            device,
            onnx: artifact.structure,
        })
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            format: ArtifactFormat::Onnx,
            supports_dynamic_shapes: true,
            supports_cuda: cfg!(feature = "cuda"),
        }
    }
}

impl InferenceAdapter for OrtAdapter {
    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn infer(&mut self, mut inputs: TensorMap) -> Result<TensorMap, InferenceError> {
        let mut ort_inputs = Vec::with_capacity(self.spec.inputs.len());
        for spec in &self.spec.inputs {
            let tensor = inputs
                .remove(spec.name.as_str())
                .ok_or_else(|| InferenceError::MissingInput(spec.name.to_string()))?;
            if tensor.dtype != spec.dtype {
                return Err(InferenceError::DTypeMismatch {
                    name: spec.name.to_string(),
                    expected: spec.dtype,
                    actual: tensor.dtype,
                });
            }
            let value = tensor_to_ort_value(tensor)?;
            ort_inputs.push((spec.name.to_string(), SessionInputValue::from(value)));
        }

        debug!(inputs = ort_inputs.len(), "running onnxruntime session");
        let outputs = self
            .session
            .run(ort_inputs)
            .map_err(|e| InferenceError::Backend(Box::new(e)))?;

        let mut out_tensors = TensorMap::new();
        for (name, value) in outputs.iter() {
            out_tensors.insert(IOName::new(name), ort_value_to_tensor(&value)?);
        }

        Ok(out_tensors)
    }

    fn model(&self) -> Result<ModelArtifact, SerializationError> {
        if self.onnx.is_empty() {
            return Err(SerializationError::Incomplete(
                "ONNX bytes were not retained".to_string(),
            ));
        }
        Ok(ModelArtifact::new(ArtifactFormat::Onnx, self.onnx.clone()))
    }
}

fn backend_err(e: ort::Error) -> ModelLoadError {
    ModelLoadError::Backend(Box::new(e))
}

fn build_model_spec(session: &Session) -> Result<ModelSpec, ModelLoadError> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>, _>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ModelSpec { inputs, outputs })
}

/// Custom metadata properties become model metadata verbatim.
fn read_metadata(session: &Session) -> Result<ModelMetadata, ModelLoadError> {
    let meta = session.metadata().map_err(backend_err)?;
    let mut entries = Vec::new();
    for key in meta.custom_keys().map_err(backend_err)? {
        if let Some(value) = meta.custom(&key).map_err(backend_err)? {
            entries.push((key, value));
        }
    }
    Ok(entries.into_iter().collect())
}

fn configure_session_builder(
    builder: SessionBuilder,
    device: &Device,
) -> Result<SessionBuilder, ModelLoadError> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder, ModelLoadError> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder.with_execution_providers([ep]).map_err(backend_err)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = builder;
        Err(ModelLoadError::DeviceUnavailable {
            device: Device::Cuda { device_id },
            backend: "onnxruntime",
        })
    }
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec, ModelLoadError> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(ModelLoadError::Malformed(format!(
            "non-tensor IO value `{name}` is not supported"
        )));
    };

    let dtype = ort_tensor_element_to_dtype(*ty).ok_or_else(|| {
        ModelLoadError::Malformed(format!("unsupported element type {ty} for `{name}`"))
    })?;
    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName::new(name),
        dtype,
        dims,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Option<DType> {
    match ty {
        TensorElementType::Float32 => Some(DType::F32),
        TensorElementType::Float16 => Some(DType::F16),
        TensorElementType::Int64 => Some(DType::I64),
        TensorElementType::Int32 => Some(DType::I32),
        TensorElementType::Uint8 => Some(DType::U8),
        _ => None,
    }
}

fn ort_err(e: ort::Error) -> InferenceError {
    InferenceError::Backend(Box::new(e))
}

fn tensor_to_ort_value(tensor: Tensor) -> Result<DynValue, InferenceError> {
    let shape: Vec<usize> = tensor.shape.dims().to_vec();

    let value = match tensor.dtype {
        DType::F32 => {
            let data = tensor.to_f32_vec()?;
            ort::value::Tensor::from_array((shape, data))
                .map_err(ort_err)?
                .into_dyn()
        }
        DType::I64 => {
            let data: Vec<i64> = tensor
                .data
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))
                .map_err(ort_err)?
                .into_dyn()
        }
        DType::I32 => {
            let data: Vec<i32> = tensor
                .data
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            ort::value::Tensor::from_array((shape, data))
                .map_err(ort_err)?
                .into_dyn()
        }
        DType::U8 => {
            let data = tensor.data.to_vec();
            ort::value::Tensor::from_array((shape, data))
                .map_err(ort_err)?
                .into_dyn()
        }
        DType::F16 => {
            return Err(InferenceError::InvalidTensor(
                "f16 inputs are not supported yet".to_string(),
            ))
        }
    };

    Ok(value)
}

fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<Tensor, InferenceError> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        return Err(InferenceError::InvalidTensor(
            "non-tensor outputs are not supported".to_string(),
        ));
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let shape = Shape::from_slice(&dims);

    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>().map_err(ort_err)?;
            let bytes: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
            Tensor::from_cpu_bytes(DType::F32, shape, Bytes::from(bytes))
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>().map_err(ort_err)?;
            let bytes: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
            Tensor::from_cpu_bytes(DType::I64, shape, Bytes::from(bytes))
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>().map_err(ort_err)?;
            let bytes: Vec<u8> = array.iter().flat_map(|v| v.to_le_bytes()).collect();
            Tensor::from_cpu_bytes(DType::I32, shape, Bytes::from(bytes))
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>().map_err(ort_err)?;
            Tensor::from_cpu_bytes(DType::U8, shape, Bytes::from(array.iter().copied().collect::<Vec<u8>>()))
        }
        other => Err(InferenceError::InvalidTensor(format!(
            "unsupported output tensor element type: {other}"
        ))),
    }
}
