//! The native graph format: a JSON document describing IO, metadata, constants
//! and an ordered node list, with f32 constants stored little-endian in a
//! `.bin` sidecar.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use modelport_core::{
    ArtifactFormat, DType, IOName, InferenceError, ModelArtifact, ModelLoadError, ModelMetadata,
    ModelSpec, SerializationError, Shape, Tensor, TensorMap, TensorSpec,
};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::ops::{self, Env};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueDecl {
    pub name: String,
    pub dtype: ElementType,
    /// `null` marks a dynamic dimension.
    pub shape: Vec<Option<usize>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantDecl {
    pub name: String,
    pub shape: Vec<usize>,
    /// Byte offset into the weights sidecar.
    pub offset: usize,
    /// Byte length in the weights sidecar.
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Node {
    Identity {
        input: String,
        output: String,
    },
    /// NCHW -> NC
    GlobalAveragePool {
        input: String,
        output: String,
    },
    /// `input [N, K] x weight [K, M] + bias [M]`
    Gemm {
        input: String,
        weight: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bias: Option<String>,
        output: String,
    },
    Reshape {
        input: String,
        shape: Vec<usize>,
        output: String,
    },
    /// Along the last axis.
    Softmax {
        input: String,
        output: String,
    },
    Sigmoid {
        input: String,
        output: String,
    },
    Add {
        lhs: String,
        rhs: String,
        output: String,
    },
    Mul {
        lhs: String,
        rhs: String,
        output: String,
    },
}

impl Node {
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Node::Identity { input, .. }
            | Node::GlobalAveragePool { input, .. }
            | Node::Reshape { input, .. }
            | Node::Softmax { input, .. }
            | Node::Sigmoid { input, .. } => vec![input.as_str()],
            Node::Gemm {
                input,
                weight,
                bias,
                ..
            } => {
                let mut refs = vec![input.as_str(), weight.as_str()];
                refs.extend(bias.as_deref());
                refs
            }
            Node::Add { lhs, rhs, .. } | Node::Mul { lhs, rhs, .. } => {
                vec![lhs.as_str(), rhs.as_str()]
            }
        }
    }

    pub fn output(&self) -> &str {
        match self {
            Node::Identity { output, .. }
            | Node::GlobalAveragePool { output, .. }
            | Node::Gemm { output, .. }
            | Node::Reshape { output, .. }
            | Node::Softmax { output, .. }
            | Node::Sigmoid { output, .. }
            | Node::Add { output, .. }
            | Node::Mul { output, .. } => output,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub format_version: u32,
    pub name: String,
    pub inputs: Vec<ValueDecl>,
    pub outputs: Vec<ValueDecl>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub constants: Vec<ConstantDecl>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// A validated graph with its constants decoded.
#[derive(Debug)]
pub struct Graph {
    doc: GraphDocument,
    constants: HashMap<String, ArrayD<f32>>,
    spec: ModelSpec,
    metadata: ModelMetadata,
}

impl Graph {
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, ModelLoadError> {
        if artifact.format != ArtifactFormat::Graph {
            return Err(malformed(format!(
                "expected a graph document, got {:?}",
                artifact.format
            )));
        }

        let doc: GraphDocument = serde_json::from_slice(&artifact.structure)
            .map_err(|e| malformed(format!("invalid graph document: {e}")))?;
        if doc.format_version != FORMAT_VERSION {
            return Err(malformed(format!(
                "unsupported format_version {} (expected {FORMAT_VERSION})",
                doc.format_version
            )));
        }

        let constants = decode_constants(&doc.constants, artifact.weights.as_ref())?;
        validate_topology(&doc)?;

        let spec = ModelSpec {
            inputs: doc.inputs.iter().map(tensor_spec).collect(),
            outputs: doc.outputs.iter().map(tensor_spec).collect(),
        };
        let metadata = ModelMetadata::from(doc.metadata.clone());

        Ok(Self {
            doc,
            constants,
            spec,
            metadata,
        })
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Re-encodes the graph; constants are laid out again in declaration order.
    pub fn to_artifact(&self) -> Result<ModelArtifact, SerializationError> {
        let mut doc = self.doc.clone();
        let mut weights = Vec::new();

        for decl in &mut doc.constants {
            let array = self.constants.get(&decl.name).ok_or_else(|| {
                SerializationError::Incomplete(format!("constant `{}` was not decoded", decl.name))
            })?;
            decl.offset = weights.len();
            for v in array.iter() {
                weights.extend_from_slice(&v.to_le_bytes());
            }
            decl.length = weights.len() - decl.offset;
        }

        let structure = serde_json::to_vec_pretty(&doc)
            .map_err(|e| SerializationError::Incomplete(format!("graph encoding failed: {e}")))?;

        let artifact = ModelArtifact::new(ArtifactFormat::Graph, structure);
        Ok(if doc.constants.is_empty() {
            artifact
        } else {
            artifact.with_weights(weights)
        })
    }

    pub fn run(&self, inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        let mut values: HashMap<&str, ArrayD<f32>> = HashMap::new();

        for decl in &self.doc.inputs {
            let tensor = inputs
                .get(decl.name.as_str())
                .ok_or_else(|| InferenceError::MissingInput(decl.name.clone()))?;
            values.insert(decl.name.as_str(), input_array(decl, tensor)?);
        }

        for node in &self.doc.nodes {
            let out = ops::eval(
                node,
                &Env {
                    values: &values,
                    constants: &self.constants,
                },
            )?;
            values.insert(node.output(), out);
        }

        let mut outputs = TensorMap::new();
        for decl in &self.doc.outputs {
            let array = values
                .get(decl.name.as_str())
                .or_else(|| self.constants.get(&decl.name))
                .ok_or_else(|| InferenceError::MissingOutput(decl.name.clone()))?;
            if !tensor_spec(decl).accepts(array.shape()) {
                return Err(shape_mismatch(decl, array.shape()));
            }
            let data: Vec<f32> = array.iter().copied().collect();
            let tensor = Tensor::from_f32(Shape::from_slice(array.shape()), &data)?;
            outputs.insert(IOName::new(decl.name.clone()), tensor);
        }

        Ok(outputs)
    }
}

fn tensor_spec(decl: &ValueDecl) -> TensorSpec {
    TensorSpec {
        name: IOName::new(decl.name.clone()),
        dtype: DType::F32,
        dims: decl.shape.clone(),
    }
}

fn input_array(decl: &ValueDecl, tensor: &Tensor) -> Result<ArrayD<f32>, InferenceError> {
    if tensor.dtype != DType::F32 {
        return Err(InferenceError::DTypeMismatch {
            name: decl.name.clone(),
            expected: DType::F32,
            actual: tensor.dtype,
        });
    }
    if !tensor_spec(decl).accepts(tensor.shape.dims()) {
        return Err(shape_mismatch(decl, tensor.shape.dims()));
    }
    ArrayD::from_shape_vec(IxDyn(tensor.shape.dims()), tensor.to_f32_vec()?)
        .map_err(|e| InferenceError::InvalidTensor(format!("input `{}`: {e}", decl.name)))
}

fn shape_mismatch(decl: &ValueDecl, actual: &[usize]) -> InferenceError {
    let expected = decl
        .shape
        .iter()
        .map(|d| d.map_or_else(|| "?".to_string(), |d| d.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    InferenceError::ShapeMismatch {
        name: decl.name.clone(),
        expected: format!("[{expected}]"),
        actual: actual.to_vec(),
    }
}

fn decode_constants(
    decls: &[ConstantDecl],
    weights: Option<&Bytes>,
) -> Result<HashMap<String, ArrayD<f32>>, ModelLoadError> {
    let mut constants = HashMap::with_capacity(decls.len());
    if decls.is_empty() {
        return Ok(constants);
    }

    let weights = weights.ok_or_else(|| {
        malformed("graph declares constants but the weights sidecar is missing".to_string())
    })?;

    for decl in decls {
        let needed = checked_numel(&decl.shape)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| {
                malformed(format!(
                    "constant `{}` has shape {:?}, which overflows",
                    decl.name, decl.shape
                ))
            })?;
        if decl.length != needed {
            return Err(malformed(format!(
                "constant `{}` has {} bytes, shape {:?} needs {needed}",
                decl.name, decl.length, decl.shape
            )));
        }
        let end = decl
            .offset
            .checked_add(decl.length)
            .filter(|end| *end <= weights.len())
            .ok_or_else(|| {
                malformed(format!(
                    "constant `{}` lies outside the {}-byte weights file",
                    decl.name,
                    weights.len()
                ))
            })?;

        let values: Vec<f32> = weights[decl.offset..end]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let array = ArrayD::from_shape_vec(IxDyn(&decl.shape), values)
            .map_err(|e| malformed(format!("constant `{}`: {e}", decl.name)))?;

        if constants.insert(decl.name.clone(), array).is_some() {
            return Err(malformed(format!("duplicate constant `{}`", decl.name)));
        }
    }

    Ok(constants)
}

fn validate_topology(doc: &GraphDocument) -> Result<(), ModelLoadError> {
    let mut defined: HashSet<&str> = HashSet::new();

    let declared = doc
        .inputs
        .iter()
        .map(|d| d.name.as_str())
        .chain(doc.constants.iter().map(|c| c.name.as_str()));
    for name in declared {
        if !defined.insert(name) {
            return Err(malformed(format!("value `{name}` is defined twice")));
        }
    }

    for node in &doc.nodes {
        if let Some(missing) = node.inputs().into_iter().find(|i| !defined.contains(i)) {
            return Err(malformed(format!(
                "node producing `{}` reads undefined value `{missing}`",
                node.output()
            )));
        }
        if !defined.insert(node.output()) {
            return Err(malformed(format!(
                "value `{}` is defined twice",
                node.output()
            )));
        }
    }

    if let Some(missing) = doc.outputs.iter().find(|o| !defined.contains(o.name.as_str())) {
        return Err(malformed(format!(
            "declared output `{}` is never produced",
            missing.name
        )));
    }

    Ok(())
}

/// Element count, or `None` when it does not fit in `usize`.
pub(crate) fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn malformed(message: String) -> ModelLoadError {
    ModelLoadError::Malformed(message)
}
