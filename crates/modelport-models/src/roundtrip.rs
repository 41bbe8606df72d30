//! Save/reload equivalence check.
//!
//! A model is serialized, rebuilt through [`ReloadedAdapter`] and both copies
//! are run on the same image; their results must match element for element.

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use modelport_core::{weights_path, Error, Result, SerializationError};
use tracing::{debug, info};

use crate::reload::ReloadedAdapter;
use crate::{Detection, InferenceResult, Model, ModelOptions};

#[derive(Clone, Debug, PartialEq)]
pub struct RoundTripReport {
    pub original: InferenceResult,
    pub restored: InferenceResult,
}

/// Serializes `model` next to `scratch`, reloads it on the same device and
/// compares both results on `image`.
///
/// The scratch extension is replaced by the model's format. Existing files at
/// the scratch structure or sidecar path are never touched: the check fails
/// with [`SerializationError::AlreadyExists`] instead. Files it writes are
/// removed on every exit path.
pub fn verify_round_trip(model: &mut Model, image: &RgbImage, scratch: &Path) -> Result<RoundTripReport> {
    let artifact = model.model()?;
    let path = scratch.with_extension(artifact.format.extension());
    if let Some(taken) = [path.clone(), weights_path(&path)].into_iter().find(|p| p.exists()) {
        return Err(SerializationError::AlreadyExists(taken).into());
    }
    let _cleanup = ScratchFiles(path.clone());

    artifact.write(&path)?;
    let original = model.infer(image)?;

    let adapter = ReloadedAdapter::open_on(&path, model.device().clone())?;
    let options = ModelOptions::default()
        .kind(model.kind())
        .labels(model.labels().to_vec());
    let mut restored_model = Model::from_adapter_with(Box::new(adapter), options)?;
    let restored = restored_model.infer(image)?;

    compare_results(&original, &restored).map_err(Error::RoundTripMismatch)?;
    info!(path = %path.display(), objects = original.len(), "round trip matched");
    Ok(RoundTripReport { original, restored })
}

/// Describes the first difference between two results.
pub fn compare_results(a: &InferenceResult, b: &InferenceResult) -> std::result::Result<(), String> {
    if a.kind() != b.kind() {
        return Err(format!("result kinds differ: {} vs {}", a.kind(), b.kind()));
    }
    if a.len() != b.len() {
        return Err(format!("object counts differ: {} vs {}", a.len(), b.len()));
    }

    match (a, b) {
        (InferenceResult::Classification(x), InferenceResult::Classification(y)) => {
            for (i, (p, q)) in x.iter().zip(y).enumerate() {
                if p.label != q.label || p.score.to_bits() != q.score.to_bits() {
                    return Err(format!("class {i} differs: {p} vs {q}"));
                }
            }
        }
        (InferenceResult::Detection(x), InferenceResult::Detection(y)) => {
            for (i, (p, q)) in x.iter().zip(y).enumerate() {
                same_detection(i, p, q)?;
            }
        }
        (InferenceResult::InstanceSegmentation(x), InferenceResult::InstanceSegmentation(y)) => {
            for (i, (p, q)) in x.iter().zip(y).enumerate() {
                same_detection(i, &p.detection, &q.detection)?;
                if p.mask != q.mask {
                    return Err(format!("mask {i} differs"));
                }
            }
        }
        _ => return Err("result kinds differ".to_string()),
    }
    Ok(())
}

fn same_detection(i: usize, p: &Detection, q: &Detection) -> std::result::Result<(), String> {
    let geometry = |d: &Detection| (d.x, d.y, d.width, d.height, d.label);
    if geometry(p) != geometry(q) || p.score.to_bits() != q.score.to_bits() {
        return Err(format!("detection {i} differs: {p} vs {q}"));
    }
    Ok(())
}

/// Removes a structure file and its weights sidecar on drop.
struct ScratchFiles(PathBuf);

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [self.0.clone(), weights_path(&self.0)] {
            if fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed scratch file");
            }
        }
    }
}
