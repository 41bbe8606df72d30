#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use modelport_backend_cpu::{GraphBuilder, Node};
use modelport_core::metadata::{
    CONFIDENCE_THRESHOLD, LABELS, MEAN_VALUES, MODEL_TYPE, RESIZE_TYPE, SCALE_VALUES, TOPK,
};
use modelport_core::ModelArtifact;
use tempfile::TempDir;

/// Where fixture models are written. `MODELPORT_DATA_DIR` pins it; otherwise a
/// temporary directory lives as long as the config.
pub struct FixtureConfig {
    pub data_dir: PathBuf,
    _scratch: Option<TempDir>,
}

impl FixtureConfig {
    pub fn from_env() -> Result<Self> {
        match std::env::var_os("MODELPORT_DATA_DIR") {
            Some(dir) => {
                let data_dir = PathBuf::from(dir);
                fs::create_dir_all(&data_dir)
                    .with_context(|| format!("creating {}", data_dir.display()))?;
                Ok(Self {
                    data_dir,
                    _scratch: None,
                })
            }
            None => {
                let scratch = tempfile::tempdir()?;
                Ok(Self {
                    data_dir: scratch.path().to_path_buf(),
                    _scratch: Some(scratch),
                })
            }
        }
    }

    /// `<data_dir>/public/<name>/FP32/<name>.json`
    pub fn model_path(&self, name: &str) -> PathBuf {
        self.data_dir
            .join("public")
            .join(name)
            .join("FP32")
            .join(format!("{name}.json"))
    }

    pub fn install(&self, name: &str, artifact: &ModelArtifact) -> Result<PathBuf> {
        let path = self.model_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        artifact.write(&path)?;
        Ok(path)
    }

    /// Scratch path for serialized copies; unique per test name.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("tmp_{name}.json"))
    }
}

pub const IMAGE_WIDTH: u32 = 640;
pub const IMAGE_HEIGHT: u32 = 480;

/// Boxes the SSD fixture reports on a bright frame, as `(x, y, w, h)`.
pub const EXPECTED_BOXES: [(u32, u32, u32, u32); 3] = [(10, 20, 30, 40), (100, 120, 15, 15), (300, 200, 50, 60)];

pub const SSD_LABELS: &str = "background person car bicycle";

/// Bright 640x480 frame with a mild diagonal pattern.
pub fn bright_image() -> RgbImage {
    RgbImage::from_fn(IMAGE_WIDTH, IMAGE_HEIGHT, |x, y| {
        let v = 200 + ((x + y) % 56) as u8;
        Rgb([v, v.saturating_sub(10), v.saturating_sub(20)])
    })
}

pub fn dark_image() -> RgbImage {
    RgbImage::new(IMAGE_WIDTH, IMAGE_HEIGHT)
}

pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

/// SSD with a `detection_out [1, 1, 5, 7]` head.
///
/// Row confidences rise with image brightness: a black frame scores below the
/// threshold everywhere, a bright one keeps the three boxes in
/// [`EXPECTED_BOXES`]. Row 4 follows the terminator and must be ignored.
pub fn ssd_detection_out() -> Result<ModelArtifact> {
    const ROWS: usize = 5;
    const WIDTH: usize = 7;
    let (w, h) = (IMAGE_WIDTH as f32, IMAGE_HEIGHT as f32);

    let mut bias = Vec::with_capacity(ROWS * WIDTH);
    let base_scores = [0.3f32, 0.25, 0.2];
    for (i, (x, y, bw, bh)) in EXPECTED_BOXES.into_iter().enumerate() {
        let (x, y, bw, bh) = (x as f32, y as f32, bw as f32, bh as f32);
        bias.extend_from_slice(&[
            0.0,
            (i + 1) as f32,
            base_scores[i],
            x / w,
            y / h,
            (x + bw) / w,
            (y + bh) / h,
        ]);
    }
    bias.extend_from_slice(&[-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    bias.extend_from_slice(&[0.0, 1.0, 0.99, 0.5, 0.5, 0.9, 0.9]);

    // confidence columns of the first three rows pick up 0.2 per channel mean
    let mut weight = vec![0.0f32; 3 * ROWS * WIDTH];
    for channel in 0..3 {
        for row in 0..3 {
            weight[channel * ROWS * WIDTH + row * WIDTH + 2] = 0.2;
        }
    }

    let artifact = GraphBuilder::new("ssd_fixture")
        .input("image", &[Some(1), Some(3), Some(300), Some(300)])
        .constant("head.weight", &[3, ROWS * WIDTH], &weight)
        .constant("head.bias", &[ROWS * WIDTH], &bias)
        .node(Node::GlobalAveragePool {
            input: "image".into(),
            output: "pooled".into(),
        })
        .node(Node::Gemm {
            input: "pooled".into(),
            weight: "head.weight".into(),
            bias: Some("head.bias".into()),
            output: "head".into(),
        })
        .node(Node::Reshape {
            input: "head".into(),
            shape: vec![1, 1, ROWS, WIDTH],
            output: "detection_out".into(),
        })
        .output("detection_out", &[Some(1), Some(1), Some(ROWS), Some(WIDTH)])
        .metadata(MODEL_TYPE, "ssd")
        .metadata(LABELS, SSD_LABELS)
        .metadata(MEAN_VALUES, "0 0 0")
        .metadata(SCALE_VALUES, "255 255 255")
        .metadata(CONFIDENCE_THRESHOLD, "0.5")
        .build()?;
    Ok(artifact)
}

/// SSD exposing undecoded `boxes`/`scores`/`priors` heads. The two
/// class-1 anchors overlap, so NMS keeps one of them.
pub fn ssd_raw_heads() -> Result<ModelArtifact> {
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
    #[rustfmt::skip]
    let deltas = [
        0.0f32, 0.0, 0.0, 0.0,
        0.5, 0.0, 0.0, 0.0,
        0.0, 0.0, 1.0, 1.0,
    ];

    let artifact = GraphBuilder::new("ssd_heads_fixture")
        .input("image", &[Some(1), Some(3), Some(64), Some(64)])
        .constant("boxes", &[1, 3, 4], &deltas)
        .constant("scores", &[1, 3, 3], &scores)
        .constant("priors", &[1, 3, 4], &priors)
        .output("boxes", &[Some(1), Some(3), Some(4)])
        .output("scores", &[Some(1), Some(3), Some(3)])
        .output("priors", &[Some(1), Some(3), Some(4)])
        .metadata(MODEL_TYPE, "SSD")
        .metadata(RESIZE_TYPE, "fit_to_window_letterbox")
        .build()?;
    Ok(artifact)
}

pub const CLASS_LABELS: &str = "red green blue gray";

/// Pooled RGB through a linear layer; the dominant channel wins.
pub fn classifier() -> Result<ModelArtifact> {
    #[rustfmt::skip]
    let weight = [
        4.0f32, 0.0, 0.0, 0.0,
        0.0, 4.0, 0.0, 0.0,
        0.0, 0.0, 4.0, 0.0,
    ];
    let artifact = GraphBuilder::new("classifier_fixture")
        .input("image", &[Some(1), Some(3), Some(32), Some(32)])
        .constant("fc.weight", &[3, 4], &weight)
        .constant("fc.bias", &[4], &[0.0, 0.0, 0.0, 1.0])
        .node(Node::GlobalAveragePool {
            input: "image".into(),
            output: "pooled".into(),
        })
        .node(Node::Gemm {
            input: "pooled".into(),
            weight: "fc.weight".into(),
            bias: Some("fc.bias".into()),
            output: "logits".into(),
        })
        .output("logits", &[Some(1), Some(4)])
        .metadata(MODEL_TYPE, "Classification")
        .metadata(LABELS, CLASS_LABELS)
        .metadata(SCALE_VALUES, "255")
        .metadata(TOPK, "2")
        .metadata(RESIZE_TYPE, "crop")
        .build()?;
    Ok(artifact)
}

/// Mask R-CNN style heads with two confident objects and one weak one.
/// The score column is a sigmoid over fixed logits.
pub fn mask_rcnn() -> Result<ModelArtifact> {
    #[rustfmt::skip]
    let boxes = [
        10.0f32, 10.0, 40.0, 30.0, 0.0,
        50.0, 40.0, 90.0, 95.0, 0.0,
        0.0, 0.0, 5.0, 5.0, 0.0,
    ];
    // logits for the score column: strong, strong, weak
    #[rustfmt::skip]
    let score_bias = [
        0.0f32, 0.0, 0.0, 0.0, 3.0,
        0.0, 0.0, 0.0, 0.0, 2.0,
        0.0, 0.0, 0.0, 0.0, -3.0,
    ];
    #[rustfmt::skip]
    let masks = [
        0.9f32, 0.9, 0.1, 0.1,
        0.9, 0.9, 0.1, 0.1,
        0.9, 0.9, 0.9, 0.9,
        0.1, 0.1, 0.9, 0.9,

        0.6, 0.2, 0.2, 0.6,
        0.2, 0.7, 0.7, 0.2,
        0.2, 0.7, 0.7, 0.2,
        0.6, 0.2, 0.2, 0.6,

        1.0, 1.0, 1.0, 1.0,
        1.0, 1.0, 1.0, 1.0,
        1.0, 1.0, 1.0, 1.0,
        1.0, 1.0, 1.0, 1.0,
    ];
    // keep coordinates, squash the score column
    let coord_mask = [1.0f32, 1.0, 1.0, 1.0, 0.0].repeat(3);
    let score_mask = [0.0f32, 0.0, 0.0, 0.0, 1.0].repeat(3);

    let artifact = GraphBuilder::new("maskrcnn_fixture")
        .input("image", &[Some(1), Some(3), Some(100), Some(100)])
        .constant("raw_boxes", &[3, 5], &boxes)
        .constant("score_logits", &[3, 5], &score_bias)
        .constant("coord_mask", &[3, 5], &coord_mask)
        .constant("score_mask", &[3, 5], &score_mask)
        .constant("labels", &[3], &[1.0, 2.0, 1.0])
        .constant("masks", &[3, 4, 4], &masks)
        .node(Node::Sigmoid {
            input: "score_logits".into(),
            output: "scores".into(),
        })
        .node(Node::Mul {
            lhs: "scores".into(),
            rhs: "score_mask".into(),
            output: "score_column".into(),
        })
        .node(Node::Mul {
            lhs: "raw_boxes".into(),
            rhs: "coord_mask".into(),
            output: "coords".into(),
        })
        .node(Node::Add {
            lhs: "coords".into(),
            rhs: "score_column".into(),
            output: "boxes".into(),
        })
        .output("boxes", &[Some(3), Some(5)])
        .output("labels", &[Some(3)])
        .output("masks", &[Some(3), Some(4), Some(4)])
        .metadata(MODEL_TYPE, "MaskRCNN")
        .metadata(LABELS, "background person dog")
        .build()?;
    Ok(artifact)
}

/// A model whose metadata names `tag` but whose single output is a plain
/// feature vector.
pub fn featurizer(tag: &str) -> Result<ModelArtifact> {
    let artifact = GraphBuilder::new("featurizer")
        .input("image", &[Some(1), Some(3), Some(8), Some(8)])
        .node(Node::GlobalAveragePool {
            input: "image".into(),
            output: "features".into(),
        })
        .output("features", &[Some(1), Some(3)])
        .metadata(MODEL_TYPE, tag)
        .build()?;
    Ok(artifact)
}
