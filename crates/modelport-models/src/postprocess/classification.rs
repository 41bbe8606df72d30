use modelport_core::metadata::{APPLY_SOFTMAX, TOPK};
use modelport_core::{IOName, InferenceError, ModelLoadError, ModelMetadata, ModelSpec, TensorMap};
use tracing::debug;

use super::{fetch, label_name, Postprocessor};
use crate::preprocess::ImageGeometry;
use crate::utils::{descending, softmax};
use crate::{Classification, InferenceResult, ModelKind};

/// Top-k over a `[1, C]` score vector.
#[derive(Debug)]
pub struct ClassificationDecoder {
    output: IOName,
    topk: usize,
    apply_softmax: bool,
    labels: Vec<String>,
}

impl ClassificationDecoder {
    pub fn new(spec: &ModelSpec, meta: &ModelMetadata, labels: Vec<String>) -> Result<Self, ModelLoadError> {
        let output = match spec.outputs.as_slice() {
            [only] => only.name.clone(),
            _ => super::require_output(spec, "logits")?.name.clone(),
        };
        let topk = meta.parse_or(TOPK, 1usize)?;
        if topk == 0 {
            return Err(ModelLoadError::InvalidMetadata {
                key: TOPK.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            output,
            topk,
            apply_softmax: meta.flag(APPLY_SOFTMAX, true)?,
            labels,
        })
    }
}

impl Postprocessor for ClassificationDecoder {
    fn kind(&self) -> ModelKind {
        ModelKind::Classification
    }

    fn decode(&self, outputs: &TensorMap, _geometry: &ImageGeometry) -> Result<InferenceResult, InferenceError> {
        let out = fetch(outputs, self.output.as_str())?;
        let batch: usize = out.dims.iter().rev().skip(1).product();
        if batch != 1 || out.values.is_empty() {
            return Err(InferenceError::ShapeMismatch {
                name: self.output.to_string(),
                expected: "[1, C]".to_string(),
                actual: out.dims,
            });
        }

        let scores = if self.apply_softmax {
            softmax(&out.values)
        } else {
            // already probabilities
            if let Some(bad) = out.values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                return Err(InferenceError::InvalidTensor(format!(
                    "`{}` holds score {bad} outside [0, 1]; raw logits need {APPLY_SOFTMAX}=true",
                    self.output
                )));
            }
            out.values
        };
        let top: Vec<Classification> = descending(&scores)
            .into_iter()
            .take(self.topk)
            .map(|label| Classification {
                label,
                label_name: label_name(&self.labels, label),
                score: scores[label],
            })
            .collect();

        debug!(classes = scores.len(), kept = top.len(), "decoded classification");
        Ok(InferenceResult::Classification(top))
    }
}

#[cfg(test)]
mod tests {
    use modelport_core::{DType, Shape, Tensor, TensorSpec};

    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            inputs: vec![],
            outputs: vec![TensorSpec {
                name: IOName::from("prob"),
                dtype: DType::F32,
                dims: vec![Some(1), Some(4)],
            }],
        }
    }

    fn geometry() -> ImageGeometry {
        ImageGeometry {
            original: (1, 1),
            input: (1, 1),
            scale: (1.0, 1.0),
            pad: (0.0, 0.0),
            offset: (0.0, 0.0),
        }
    }

    fn outputs(values: &[f32]) -> TensorMap {
        let t = Tensor::from_f32(Shape::from_slice(&[1, values.len()]), values).unwrap();
        TensorMap::from([(IOName::from("prob"), t)])
    }

    #[test]
    fn top_two_with_labels() {
        let meta = ModelMetadata::new().with(TOPK, "2").with(APPLY_SOFTMAX, "false");
        let labels = vec!["cat".to_string(), "dog".to_string()];
        let decoder = ClassificationDecoder::new(&spec(), &meta, labels).unwrap();

        let result = decoder.decode(&outputs(&[0.1, 0.6, 0.05, 0.25]), &geometry()).unwrap();
        let InferenceResult::Classification(top) = result else {
            panic!("expected classification");
        };
        assert_eq!(top.len(), 2);
        assert_eq!((top[0].label, top[0].label_name.as_deref(), top[0].score), (1, Some("dog"), 0.6));
        assert_eq!((top[1].label, top[1].label_name.as_deref()), (3, None));
    }

    #[test]
    fn unnormalized_scores_need_softmax() {
        let meta = ModelMetadata::new().with(APPLY_SOFTMAX, "false");
        let decoder = ClassificationDecoder::new(&spec(), &meta, vec![]).unwrap();
        for values in [[2.5f32, -1.0, 0.0, 0.0], [f32::NAN, 0.2, 0.3, 0.5]] {
            assert!(matches!(
                decoder.decode(&outputs(&values), &geometry()),
                Err(InferenceError::InvalidTensor(_))
            ));
        }

        let decoder = ClassificationDecoder::new(&spec(), &ModelMetadata::new(), vec![]).unwrap();
        let InferenceResult::Classification(top) = decoder.decode(&outputs(&[2.5, -1.0, 0.0, 0.0]), &geometry()).unwrap()
        else {
            panic!("expected classification");
        };
        assert!(top.iter().all(|c| (0.0..=1.0).contains(&c.score)));
    }

    #[test]
    fn softmax_by_default() {
        let decoder = ClassificationDecoder::new(&spec(), &ModelMetadata::new(), vec![]).unwrap();
        let result = decoder.decode(&outputs(&[0.0, 0.0, 0.0, 0.0]), &geometry()).unwrap();
        let InferenceResult::Classification(top) = result else {
            panic!("expected classification");
        };
        assert_eq!(top[0].label, 0);
        assert!((top[0].score - 0.25).abs() < 1e-6);
    }

    #[test]
    fn multi_output_models_need_logits() {
        let mut spec = spec();
        spec.outputs.push(spec.outputs[0].clone());
        spec.outputs[1].name = IOName::from("features");
        let err = ClassificationDecoder::new(&spec, &ModelMetadata::new(), vec![]).unwrap_err();
        assert!(matches!(err, ModelLoadError::MissingTensor { name } if name == "logits"));
    }
}
