use modelport_core::{InferenceError, ModelLoadError, ModelMetadata, ModelSpec, TensorMap};
use ndarray::{ArrayView2, ArrayView3, Axis};
use tracing::{debug, warn};

use super::{confidence, detection, fetch, place_box, require_output, Postprocessor};
use crate::preprocess::ImageGeometry;
use crate::{InferenceResult, Mask, ModelKind, SegmentedObject};

const BOXES: &str = "boxes";
const LABELS: &str = "labels";
const MASKS: &str = "masks";
const MASK_THRESHOLD: f32 = 0.5;

/// Mask R-CNN style outputs: `boxes [N, 5]` as `(x1, y1, x2, y2, score)` in
/// input pixels, `labels [N]` and per-box probability maps `masks [N, mh, mw]`.
#[derive(Debug)]
pub struct MaskRcnnDecoder {
    confidence_threshold: f32,
    labels: Vec<String>,
}

impl MaskRcnnDecoder {
    pub fn new(spec: &ModelSpec, meta: &ModelMetadata, labels: Vec<String>) -> Result<Self, ModelLoadError> {
        for name in [BOXES, LABELS, MASKS] {
            require_output(spec, name)?;
        }
        Ok(Self {
            confidence_threshold: confidence(meta, 0.5)?,
            labels,
        })
    }
}

impl Postprocessor for MaskRcnnDecoder {
    fn kind(&self) -> ModelKind {
        ModelKind::InstanceSegmentation
    }

    fn decode(&self, outputs: &TensorMap, geometry: &ImageGeometry) -> Result<InferenceResult, InferenceError> {
        let boxes = fetch(outputs, BOXES)?;
        let labels = fetch(outputs, LABELS)?;
        let masks = fetch(outputs, MASKS)?;

        let n = boxes.rows(BOXES, 5)?;
        let (mh, mw) = match masks.dims.as_slice() {
            [.., count, mh, mw] if *count == n && *mh > 0 && *mw > 0 => (*mh, *mw),
            _ => {
                return Err(InferenceError::ShapeMismatch {
                    name: MASKS.to_string(),
                    expected: format!("[{n}, mh, mw]"),
                    actual: masks.dims.clone(),
                })
            }
        };
        if labels.values.len() != n {
            return Err(InferenceError::ShapeMismatch {
                name: LABELS.to_string(),
                expected: format!("[{n}]"),
                actual: labels.dims,
            });
        }

        let shape_err = |e: ndarray::ShapeError| InferenceError::InvalidTensor(e.to_string());
        let boxes = ArrayView2::from_shape((n, 5), &boxes.values).map_err(shape_err)?;
        let masks = ArrayView3::from_shape((n, mh, mw), &masks.values).map_err(shape_err)?;

        let mut objects = Vec::new();
        for (i, row) in boxes.rows().into_iter().enumerate() {
            let score = row[4];
            if score <= self.confidence_threshold {
                continue;
            }
            let label = labels.values[i];
            if label < 0.0 {
                warn!(index = i, label, "skipping object with negative label");
                continue;
            }
            let Some(rect) = place_box(geometry, [row[0], row[1], row[2], row[3]]) else {
                continue;
            };

            let (x1, y1) = geometry.to_original(row[0], row[1]);
            let (x2, y2) = geometry.to_original(row[2], row[3]);
            let mask = paste_mask(masks.index_axis(Axis(0), i), rect, [x1, y1, x2, y2]);

            objects.push(SegmentedObject {
                detection: detection(rect, score, label.round() as usize, &self.labels),
                mask,
            });
        }

        debug!(objects = objects.len(), "decoded instance masks");
        Ok(InferenceResult::InstanceSegmentation(objects))
    }
}

/// Samples a box-relative probability map onto the clipped pixel box
/// (nearest neighbour) and binarizes it.
fn paste_mask(probs: ArrayView2<'_, f32>, rect: [u32; 4], bounds: [f32; 4]) -> Mask {
    let (mh, mw) = probs.dim();
    let [x, y, width, height] = rect;
    let span_x = (bounds[2] - bounds[0]).max(f32::EPSILON);
    let span_y = (bounds[3] - bounds[1]).max(f32::EPSILON);

    let mut data = Vec::with_capacity((width * height) as usize);
    for py in y..y + height {
        let v = ((py as f32 + 0.5 - bounds[1]) / span_y * mh as f32).floor();
        let row = (v.max(0.0) as usize).min(mh - 1);
        for px in x..x + width {
            let u = ((px as f32 + 0.5 - bounds[0]) / span_x * mw as f32).floor();
            let col = (u.max(0.0) as usize).min(mw - 1);
            data.push(u8::from(probs[[row, col]] > MASK_THRESHOLD));
        }
    }
    Mask { width, height, data }
}
