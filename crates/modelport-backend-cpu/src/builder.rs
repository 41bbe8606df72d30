use std::collections::BTreeMap;

use modelport_core::{ArtifactFormat, ModelArtifact, ModelLoadError};

use crate::graph::{ConstantDecl, ElementType, Graph, GraphDocument, Node, ValueDecl, FORMAT_VERSION};

/// Assembles a graph document and its weights in memory.
///
/// ```
/// use modelport_backend_cpu::{GraphBuilder, Node};
///
/// let artifact = GraphBuilder::new("scale")
///     .input("x", &[Some(1), Some(2)])
///     .constant("k", &[2], &[2.0, 3.0])
///     .node(Node::Mul { lhs: "x".into(), rhs: "k".into(), output: "y".into() })
///     .output("y", &[Some(1), Some(2)])
///     .build()
///     .unwrap();
/// assert!(artifact.weights.is_some());
/// ```
#[derive(Debug)]
pub struct GraphBuilder {
    doc: GraphDocument,
    weights: Vec<u8>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            doc: GraphDocument {
                format_version: FORMAT_VERSION,
                name: name.into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                metadata: BTreeMap::new(),
                constants: Vec::new(),
                nodes: Vec::new(),
            },
            weights: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, shape: &[Option<usize>]) -> Self {
        self.doc.inputs.push(value_decl(name, shape));
        self
    }

    pub fn output(mut self, name: impl Into<String>, shape: &[Option<usize>]) -> Self {
        self.doc.outputs.push(value_decl(name, shape));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.doc.metadata.insert(key.into(), value.into());
        self
    }

    pub fn constant(mut self, name: impl Into<String>, shape: &[usize], values: &[f32]) -> Self {
        let offset = self.weights.len();
        for v in values {
            self.weights.extend_from_slice(&v.to_le_bytes());
        }
        self.doc.constants.push(ConstantDecl {
            name: name.into(),
            shape: shape.to_vec(),
            offset,
            length: self.weights.len() - offset,
        });
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.doc.nodes.push(node);
        self
    }

    /// Encodes the artifact and checks that it compiles.
    pub fn build(self) -> Result<ModelArtifact, ModelLoadError> {
        let structure = serde_json::to_vec_pretty(&self.doc)
            .map_err(|e| ModelLoadError::Malformed(format!("graph encoding failed: {e}")))?;
        let mut artifact = ModelArtifact::new(ArtifactFormat::Graph, structure);
        if !self.doc.constants.is_empty() {
            artifact = artifact.with_weights(self.weights);
        }
        Graph::from_artifact(&artifact)?;
        Ok(artifact)
    }
}

fn value_decl(name: impl Into<String>, shape: &[Option<usize>]) -> ValueDecl {
    ValueDecl {
        name: name.into(),
        dtype: ElementType::F32,
        shape: shape.to_vec(),
    }
}
