use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use modelport_core::ModelLoadError;

/// Axis-aligned box as `[xmin, ymin, xmax, ymax]`.
pub type BoxF = [f32; 4];

/// Intersection over union. With `include_boundaries` the edges count as
/// pixels, so a box from 0 to 9 is 10 wide.
pub fn iou(a: &BoxF, b: &BoxF, include_boundaries: bool) -> f32 {
    let edge = if include_boundaries { 1.0 } else { 0.0 };
    let area = |r: &BoxF| (r[2] - r[0] + edge) * (r[3] - r[1] + edge);

    let w = (a[2].min(b[2]) - a[0].max(b[0]) + edge).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1]) + edge).max(0.0);
    let intersection = w * h;
    let union = area(a) + area(b) - intersection;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy non-maximum suppression.
///
/// Returns the indices of the kept boxes, highest score first. Candidates
/// overlapping a kept box by more than `threshold` are dropped. With
/// `keep_top_k`, only that many of the best-scoring candidates are considered.
pub fn nms(
    boxes: &[BoxF],
    scores: &[f32],
    threshold: f32,
    include_boundaries: bool,
    keep_top_k: Option<usize>,
) -> Vec<usize> {
    let mut order = descending(scores);
    if let Some(k) = keep_top_k.filter(|&k| k > 0) {
        order.truncate(k);
    }

    let mut keep = Vec::new();
    while let Some((&best, rest)) = order.split_first() {
        keep.push(best);
        order = rest
            .iter()
            .copied()
            .filter(|&i| iou(&boxes[best], &boxes[i], include_boundaries) <= threshold)
            .collect();
    }
    keep
}

/// Indices sorted by descending score; equal scores keep their original order.
pub fn descending(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return exps;
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// One label per line, surrounding whitespace trimmed.
pub fn load_labels(path: &Path) -> Result<Vec<String>, ModelLoadError> {
    let text = fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().map(|l| l.trim().to_string()).collect())
}
