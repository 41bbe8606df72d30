use modelport_core::metadata::{BOX_VARIANCES, IOU_THRESHOLD};
use modelport_core::{IOName, InferenceError, ModelLoadError, ModelMetadata, ModelSpec, TensorMap};
use ndarray::ArrayView2;
use tracing::{debug, warn};

use super::{confidence, detection, fetch, place_box, Postprocessor};
use crate::preprocess::ImageGeometry;
use crate::utils::{descending, nms, BoxF};
use crate::{Detection, InferenceResult, ModelKind};

const DETECTION_OUT: &str = "detection_out";
const BOXES: &str = "boxes";
const SCORES: &str = "scores";
const PRIORS: &str = "priors";
const DETECTION_WIDTH: usize = 7;

/// Which outputs an SSD network exposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SsdLayout {
    /// `[1, 1, N, 7]` rows of `(image_id, label, conf, xmin, ymin, xmax, ymax)`,
    /// coordinates normalized to the input.
    DetectionOut(IOName),
    /// Undecoded heads: box deltas `[1, N, 4]`, class scores `[1, N, C]` and
    /// priors `[1, N, 4]` as normalized `(cx, cy, w, h)`.
    RawHeads,
}

#[derive(Debug)]
pub struct SsdDecoder {
    layout: SsdLayout,
    confidence_threshold: f32,
    iou_threshold: f32,
    variances: [f32; 4],
    labels: Vec<String>,
}

impl SsdDecoder {
    pub fn new(spec: &ModelSpec, meta: &ModelMetadata, labels: Vec<String>) -> Result<Self, ModelLoadError> {
        let layout = if let Some(out) = spec.output(DETECTION_OUT) {
            SsdLayout::DetectionOut(out.name.clone())
        } else if let [only] = spec.outputs.as_slice() {
            if only.dims.last() != Some(&Some(DETECTION_WIDTH)) {
                return Err(ModelLoadError::MissingTensor {
                    name: DETECTION_OUT.to_string(),
                });
            }
            SsdLayout::DetectionOut(only.name.clone())
        } else if spec.output(BOXES).is_some() || spec.output(SCORES).is_some() {
            for name in [BOXES, SCORES, PRIORS] {
                super::require_output(spec, name)?;
            }
            SsdLayout::RawHeads
        } else {
            return Err(ModelLoadError::MissingTensor {
                name: DETECTION_OUT.to_string(),
            });
        };

        let variances = match meta.floats(BOX_VARIANCES)?.as_deref() {
            None => [0.1, 0.1, 0.2, 0.2],
            Some(&[a, b, c, d]) => [a, b, c, d],
            Some(other) => {
                return Err(ModelLoadError::InvalidMetadata {
                    key: BOX_VARIANCES.to_string(),
                    message: format!("expected 4 values, got {}", other.len()),
                })
            }
        };

        Ok(Self {
            layout,
            confidence_threshold: confidence(meta, 0.5)?,
            iou_threshold: meta.parse_or(IOU_THRESHOLD, 0.5)?,
            variances,
            labels,
        })
    }

    pub fn layout(&self) -> &SsdLayout {
        &self.layout
    }

    fn decode_detection_out(
        &self,
        name: &IOName,
        outputs: &TensorMap,
        geometry: &ImageGeometry,
    ) -> Result<Vec<Detection>, InferenceError> {
        let out = fetch(outputs, name.as_str())?;
        let rows = out.rows(name.as_str(), DETECTION_WIDTH)?;
        let table = ArrayView2::from_shape((rows, DETECTION_WIDTH), &out.values)
            .map_err(|e| InferenceError::InvalidTensor(e.to_string()))?;

        let (iw, ih) = (geometry.input.0 as f32, geometry.input.1 as f32);
        let mut detections = Vec::new();
        for row in table.rows() {
            if row[0] < 0.0 {
                break;
            }
            let score = row[2];
            if score <= self.confidence_threshold {
                continue;
            }
            if row[1] < 0.0 {
                warn!(label = row[1], "skipping detection with negative label");
                continue;
            }
            let corners = [row[3] * iw, row[4] * ih, row[5] * iw, row[6] * ih];
            if let Some(rect) = place_box(geometry, corners) {
                detections.push(detection(rect, score, row[1].round() as usize, &self.labels));
            }
        }
        Ok(detections)
    }

    fn decode_raw_heads(&self, outputs: &TensorMap, geometry: &ImageGeometry) -> Result<Vec<Detection>, InferenceError> {
        let deltas = fetch(outputs, BOXES)?;
        let priors = fetch(outputs, PRIORS)?;
        let scores = fetch(outputs, SCORES)?;

        let anchors = deltas.rows(BOXES, 4)?;
        if priors.rows(PRIORS, 4)? != anchors {
            return Err(InferenceError::ShapeMismatch {
                name: PRIORS.to_string(),
                expected: format!("[1, {anchors}, 4]"),
                actual: priors.dims,
            });
        }
        let classes = scores.dims.last().copied().unwrap_or(0);
        if classes == 0 || scores.rows(SCORES, classes)? != anchors {
            return Err(InferenceError::ShapeMismatch {
                name: SCORES.to_string(),
                expected: format!("[1, {anchors}, C]"),
                actual: scores.dims,
            });
        }

        let shape_err = |e: ndarray::ShapeError| InferenceError::InvalidTensor(e.to_string());
        let deltas = ArrayView2::from_shape((anchors, 4), &deltas.values).map_err(shape_err)?;
        let priors = ArrayView2::from_shape((anchors, 4), &priors.values).map_err(shape_err)?;
        let scores = ArrayView2::from_shape((anchors, classes), &scores.values).map_err(shape_err)?;

        let [v0, v1, v2, v3] = self.variances;
        let boxes: Vec<BoxF> = deltas
            .rows()
            .into_iter()
            .zip(priors.rows())
            .map(|(d, p)| {
                let cx = p[0] + d[0] * v0 * p[2];
                let cy = p[1] + d[1] * v1 * p[3];
                let w = p[2] * (d[2] * v2).exp();
                let h = p[3] * (d[3] * v3).exp();
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
            })
            .collect();

        // (anchor, class, score) survivors of per-class NMS
        let mut kept: Vec<(usize, usize, f32)> = Vec::new();
        for class in 1..classes {
            let candidates: Vec<usize> = (0..anchors)
                .filter(|&a| scores[[a, class]] > self.confidence_threshold)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let class_boxes: Vec<BoxF> = candidates.iter().map(|&a| boxes[a]).collect();
            let class_scores: Vec<f32> = candidates.iter().map(|&a| scores[[a, class]]).collect();
            for i in nms(&class_boxes, &class_scores, self.iou_threshold, false, None) {
                kept.push((candidates[i], class, class_scores[i]));
            }
        }

        let order = descending(&kept.iter().map(|k| k.2).collect::<Vec<_>>());
        let (iw, ih) = (geometry.input.0 as f32, geometry.input.1 as f32);
        Ok(order
            .into_iter()
            .filter_map(|i| {
                let (anchor, class, score) = kept[i];
                let b = boxes[anchor];
                place_box(geometry, [b[0] * iw, b[1] * ih, b[2] * iw, b[3] * ih])
                    .map(|rect| detection(rect, score, class, &self.labels))
            })
            .collect())
    }
}

impl Postprocessor for SsdDecoder {
    fn kind(&self) -> ModelKind {
        ModelKind::Detection
    }

    fn decode(&self, outputs: &TensorMap, geometry: &ImageGeometry) -> Result<InferenceResult, InferenceError> {
        let detections = match &self.layout {
            SsdLayout::DetectionOut(name) => self.decode_detection_out(name, outputs, geometry)?,
            SsdLayout::RawHeads => self.decode_raw_heads(outputs, geometry)?,
        };
        debug!(detections = detections.len(), "decoded ssd outputs");
        Ok(InferenceResult::Detection(detections))
    }
}

#[cfg(test)]
mod tests {
    use modelport_core::{DType, Shape, Tensor, TensorSpec};

    use super::*;

    fn out_spec(name: &str, dims: &[usize]) -> TensorSpec {
        TensorSpec {
            name: IOName::from(name),
            dtype: DType::F32,
            dims: dims.iter().copied().map(Some).collect(),
        }
    }

    fn tensor(dims: &[usize], values: &[f32]) -> Tensor {
        Tensor::from_f32(Shape::from_slice(dims), values).unwrap()
    }

    fn geometry() -> ImageGeometry {
        ImageGeometry {
            original: (200, 100),
            input: (100, 100),
            scale: (0.5, 1.0),
            pad: (0.0, 0.0),
            offset: (0.0, 0.0),
        }
    }

    #[test]
    fn detection_out_stops_at_terminator() {
        let spec = ModelSpec {
            inputs: vec![],
            outputs: vec![out_spec("detection_out", &[1, 1, 4, 7])],
        };
        let decoder = SsdDecoder::new(&spec, &ModelMetadata::new(), vec!["bg".into(), "car".into()]).unwrap();
        #[rustfmt::skip]
        let rows = [
            0.0f32, 1.0, 0.9, 0.1, 0.1, 0.2, 0.3,
            0.0, 1.0, 0.3, 0.1, 0.1, 0.2, 0.3, // below threshold
            -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.9, 0.5, 0.5, 0.6, 0.6, // after terminator
        ];
        let outputs = TensorMap::from([(IOName::from("detection_out"), tensor(&[1, 1, 4, 7], &rows))]);

        let InferenceResult::Detection(d) = decoder.decode(&outputs, &geometry()).unwrap() else {
            panic!("expected detections");
        };
        assert_eq!(d.len(), 1);
        assert_eq!((d[0].x, d[0].y, d[0].width, d[0].height), (20, 10, 20, 20));
        assert_eq!(d[0].label_name.as_deref(), Some("car"));
    }

    #[test]
    fn raw_heads_decode_with_per_class_nms() {
        let spec = ModelSpec {
            inputs: vec![],
            outputs: vec![
                out_spec("boxes", &[1, 3, 4]),
                out_spec("scores", &[1, 3, 3]),
                out_spec("priors", &[1, 3, 4]),
            ],
        };
        let decoder = SsdDecoder::new(&spec, &ModelMetadata::new(), vec![]).unwrap();
        assert_eq!(decoder.layout(), &SsdLayout::RawHeads);

        #[rustfmt::skip]
        let priors = [
            0.25f32, 0.25, 0.2, 0.2,
            0.26, 0.25, 0.2, 0.2,
            0.75, 0.75, 0.2, 0.2,
        ];
        #[rustfmt::skip]
        let scores = [
            0.1f32, 0.7, 0.0,
            0.1, 0.8, 0.0,
            0.1, 0.0, 0.6,
        ];
        let outputs = TensorMap::from([
            (IOName::from("boxes"), tensor(&[1, 3, 4], &[0.0; 12])),
            (IOName::from("scores"), tensor(&[1, 3, 3], &scores)),
            (IOName::from("priors"), tensor(&[1, 3, 4], &priors)),
        ]);

        let InferenceResult::Detection(d) = decoder.decode(&outputs, &geometry()).unwrap() else {
            panic!("expected detections");
        };
        // anchors 0 and 1 overlap; only the stronger survives
        assert_eq!(d.len(), 2);
        assert_eq!((d[0].label, d[0].score), (1, 0.8));
        assert_eq!((d[1].label, d[1].score), (2, 0.6));
        assert_eq!((d[1].x, d[1].y, d[1].width, d[1].height), (130, 65, 40, 20));
    }

    #[test]
    fn missing_outputs_fail_construction() {
        let spec = ModelSpec {
            inputs: vec![],
            outputs: vec![out_spec("boxes", &[1, 3, 4]), out_spec("scores", &[1, 3, 3])],
        };
        let err = SsdDecoder::new(&spec, &ModelMetadata::new(), vec![]).unwrap_err();
        assert!(matches!(err, ModelLoadError::MissingTensor { name } if name == "priors"));

        let spec = ModelSpec {
            inputs: vec![],
            outputs: vec![out_spec("features", &[1, 16])],
        };
        assert!(SsdDecoder::new(&spec, &ModelMetadata::new(), vec![]).is_err());
    }
}
