//! Output decoding, one strategy per model kind.

mod classification;
mod segmentation;
mod ssd;

use modelport_core::{InferenceError, ModelLoadError, ModelMetadata, ModelSpec, TensorMap, TensorSpec};

pub use classification::ClassificationDecoder;
pub use segmentation::MaskRcnnDecoder;
pub use ssd::{SsdDecoder, SsdLayout};

use crate::preprocess::ImageGeometry;
use crate::{Detection, InferenceResult, ModelKind};

/// Turns raw adapter outputs into a typed result.
pub trait Postprocessor: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn decode(&self, outputs: &TensorMap, geometry: &ImageGeometry) -> Result<InferenceResult, InferenceError>;
}

/// Picks and configures the decoder for `kind`, checking that the outputs it
/// needs are declared.
pub(crate) fn for_kind(
    kind: ModelKind,
    spec: &ModelSpec,
    meta: &ModelMetadata,
    labels: Vec<String>,
) -> Result<Box<dyn Postprocessor>, ModelLoadError> {
    Ok(match kind {
        ModelKind::Classification => Box::new(ClassificationDecoder::new(spec, meta, labels)?),
        ModelKind::Detection => Box::new(SsdDecoder::new(spec, meta, labels)?),
        ModelKind::InstanceSegmentation => Box::new(MaskRcnnDecoder::new(spec, meta, labels)?),
    })
}

pub(crate) fn require_output<'a>(spec: &'a ModelSpec, name: &str) -> Result<&'a TensorSpec, ModelLoadError> {
    spec.output(name).ok_or_else(|| ModelLoadError::MissingTensor {
        name: name.to_string(),
    })
}

/// Output tensor widened to f32, with its dims.
pub(crate) struct Output {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

pub(crate) fn fetch(outputs: &TensorMap, name: &str) -> Result<Output, InferenceError> {
    let tensor = outputs
        .get(name)
        .ok_or_else(|| InferenceError::MissingOutput(name.to_string()))?;
    Ok(Output {
        dims: tensor.shape.dims().to_vec(),
        values: tensor.to_f32_vec()?,
    })
}

impl Output {
    /// Reads the tensor as `rows x width`, folding leading unit dims.
    pub fn rows(&self, name: &str, width: usize) -> Result<usize, InferenceError> {
        if width == 0 || self.dims.last() != Some(&width) || self.values.len() % width != 0 {
            return Err(InferenceError::ShapeMismatch {
                name: name.to_string(),
                expected: format!("[.., {width}]"),
                actual: self.dims.clone(),
            });
        }
        Ok(self.values.len() / width)
    }
}

pub(crate) fn label_name(labels: &[String], label: usize) -> Option<String> {
    labels.get(label).cloned()
}

/// Maps a network-input box into the original image, rounds and clips it.
/// Returns `None` for boxes that end up with no area.
pub(crate) fn place_box(geometry: &ImageGeometry, corners: [f32; 4]) -> Option<[u32; 4]> {
    let (x1, y1) = geometry.to_original(corners[0], corners[1]);
    let (x2, y2) = geometry.to_original(corners[2], corners[3]);
    let (w, h) = geometry.original;

    let clip = |v: f32, max: u32| -> u32 {
        let v = v.round();
        if v.is_nan() || v <= 0.0 {
            0
        } else {
            (v as u32).min(max)
        }
    };
    let (xmin, xmax) = (clip(x1, w), clip(x2, w));
    let (ymin, ymax) = (clip(y1, h), clip(y2, h));

    (xmax > xmin && ymax > ymin).then(|| [xmin, ymin, xmax - xmin, ymax - ymin])
}

pub(crate) fn detection(rect: [u32; 4], score: f32, label: usize, labels: &[String]) -> Detection {
    Detection {
        x: rect[0],
        y: rect[1],
        width: rect[2],
        height: rect[3],
        score,
        label,
        label_name: label_name(labels, label),
    }
}

pub(crate) fn confidence(meta: &ModelMetadata, default: f32) -> Result<f32, ModelLoadError> {
    use modelport_core::metadata::CONFIDENCE_THRESHOLD;

    let value = meta.parse_or(CONFIDENCE_THRESHOLD, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ModelLoadError::InvalidMetadata {
            key: CONFIDENCE_THRESHOLD.to_string(),
            message: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(value)
}
