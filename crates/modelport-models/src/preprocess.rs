use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use modelport_core::metadata::{MEAN_VALUES, PAD_VALUE, RESIZE_TYPE, REVERSE_INPUT_CHANNELS, SCALE_VALUES};
use modelport_core::{
    DType, IOName, InferenceError, ModelLoadError, ModelMetadata, Shape, Tensor, TensorSpec,
};

use crate::{Detection, InferenceResult, Mask, SegmentedObject};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResizeMode {
    /// Stretch to the input size.
    #[default]
    Standard,
    /// Keep the aspect ratio, anchor top-left, pad the rest.
    FitToWindow,
    /// Keep the aspect ratio, center, pad both sides.
    FitToWindowLetterbox,
    /// Center-crop to the input aspect ratio, then resize.
    Crop,
}

impl FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "standard" => Ok(Self::Standard),
            "fit_to_window" => Ok(Self::FitToWindow),
            "fit_to_window_letterbox" => Ok(Self::FitToWindowLetterbox),
            "crop" => Ok(Self::Crop),
            other => Err(format!("unknown resize type `{other}`")),
        }
    }
}

impl fmt::Display for ResizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Standard => "standard",
            Self::FitToWindow => "fit_to_window",
            Self::FitToWindowLetterbox => "fit_to_window_letterbox",
            Self::Crop => "crop",
        })
    }
}

/// Per-channel `(x - mean) / scale`, optionally feeding BGR instead of RGB.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTransform {
    pub reverse_channels: bool,
    pub mean: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for InputTransform {
    fn default() -> Self {
        Self {
            reverse_channels: false,
            mean: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl InputTransform {
    pub fn from_metadata(meta: &ModelMetadata) -> Result<Self, ModelLoadError> {
        let scale = channel_values(meta, SCALE_VALUES, 1.0)?;
        if scale.contains(&0.0) {
            return Err(ModelLoadError::InvalidMetadata {
                key: SCALE_VALUES.to_string(),
                message: "scale values must be non-zero".to_string(),
            });
        }
        Ok(Self {
            reverse_channels: meta.flag(REVERSE_INPUT_CHANNELS, false)?,
            mean: channel_values(meta, MEAN_VALUES, 0.0)?,
            scale,
        })
    }

    /// Channel values in the order the network consumes them.
    pub fn apply(&self, pixel: Rgb<u8>) -> [f32; 3] {
        let [r, g, b] = pixel.0;
        let ordered = if self.reverse_channels { [b, g, r] } else { [r, g, b] };
        std::array::from_fn(|c| (f32::from(ordered[c]) - self.mean[c]) / self.scale[c])
    }
}

fn channel_values(meta: &ModelMetadata, key: &str, default: f32) -> Result<[f32; 3], ModelLoadError> {
    match meta.floats(key)?.as_deref() {
        None => Ok([default; 3]),
        Some([v]) => Ok([*v; 3]),
        Some([a, b, c]) => Ok([*a, *b, *c]),
        Some(other) => Err(ModelLoadError::InvalidMetadata {
            key: key.to_string(),
            message: format!("expected 1 or 3 values, got {}", other.len()),
        }),
    }
}

/// How a network-input pixel maps back onto the original image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageGeometry {
    /// Original `(width, height)`.
    pub original: (u32, u32),
    /// Network input `(width, height)`.
    pub input: (u32, u32),
    pub scale: (f32, f32),
    pub pad: (f32, f32),
    /// Top-left of the crop window in the original image.
    pub offset: (f32, f32),
}

impl ImageGeometry {
    fn identity(width: u32, height: u32) -> Self {
        Self {
            original: (width, height),
            input: (width, height),
            scale: (1.0, 1.0),
            pad: (0.0, 0.0),
            offset: (0.0, 0.0),
        }
    }

    /// Transform from original-image pixels to `resolution`, keeping the
    /// aspect ratio.
    pub fn output_transform(&self, resolution: (u32, u32)) -> Option<OutputTransform> {
        OutputTransform::new(self.original, resolution)
    }

    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad.0) / self.scale.0 + self.offset.0,
            (y - self.pad.1) / self.scale.1 + self.offset.1,
        )
    }
}

/// Rescales results and frames from original-image pixels to a display
/// resolution. The scale is the smaller of the two axis ratios; coordinates
/// are truncated after scaling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputTransform {
    original: (u32, u32),
    scale: f32,
}

impl OutputTransform {
    /// `None` when either size has a zero side.
    pub fn new(original: (u32, u32), resolution: (u32, u32)) -> Option<Self> {
        if [original.0, original.1, resolution.0, resolution.1].contains(&0) {
            return None;
        }
        let scale = (resolution.0 as f32 / original.0 as f32).min(resolution.1 as f32 / original.1 as f32);
        Some(Self { original, scale })
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale
    }

    /// Size of the rescaled frame.
    pub fn resolution(&self) -> (u32, u32) {
        (self.scale_value(self.original.0), self.scale_value(self.original.1))
    }

    fn scale_value(&self, v: u32) -> u32 {
        if self.scale == 1.0 {
            v
        } else {
            (v as f32 * self.scale) as u32
        }
    }

    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        let (w, h) = self.resolution();
        resize(image, w.max(1), h.max(1))
    }

    pub fn detection(&self, d: &Detection) -> Detection {
        let (x, y) = (self.scale_value(d.x), self.scale_value(d.y));
        Detection {
            x,
            y,
            width: self.scale_value(d.xmax()) - x,
            height: self.scale_value(d.ymax()) - y,
            ..d.clone()
        }
    }

    /// Masks follow their box, resampled nearest-neighbour.
    pub fn apply(&self, result: &InferenceResult) -> InferenceResult {
        match result {
            InferenceResult::Classification(c) => InferenceResult::Classification(c.clone()),
            InferenceResult::Detection(d) => {
                InferenceResult::Detection(d.iter().map(|d| self.detection(d)).collect())
            }
            InferenceResult::InstanceSegmentation(objects) => InferenceResult::InstanceSegmentation(
                objects
                    .iter()
                    .map(|o| {
                        let detection = self.detection(&o.detection);
                        let mask = resample_mask(&o.mask, detection.width, detection.height);
                        SegmentedObject { detection, mask }
                    })
                    .collect(),
            ),
        }
    }
}

fn resample_mask(mask: &Mask, width: u32, height: u32) -> Mask {
    if (mask.width, mask.height) == (width, height) {
        return mask.clone();
    }
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        let sy = (u64::from(y) * u64::from(mask.height) / u64::from(height)) as u32;
        for x in 0..width {
            let sx = (u64::from(x) * u64::from(mask.width) / u64::from(width)) as u32;
            data.push(u8::from(mask.get(sx, sy)));
        }
    }
    Mask { width, height, data }
}

/// Turns an RGB raster into the NCHW f32 tensor the model input expects.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    input: IOName,
    /// `(width, height)` when the input spec fixes them.
    size: Option<(u32, u32)>,
    resize: ResizeMode,
    pad_value: u8,
    transform: InputTransform,
}

impl Preprocessor {
    pub fn new(spec: &TensorSpec, meta: &ModelMetadata) -> Result<Self, ModelLoadError> {
        if spec.dtype != DType::F32 || spec.rank() != 4 || spec.dims[1].is_some_and(|c| c != 3) {
            return Err(ModelLoadError::Malformed(format!(
                "input `{}` must be an f32 NCHW tensor with 3 channels, got {} {:?}",
                spec.name, spec.dtype, spec.dims
            )));
        }
        if spec.dims[0].is_some_and(|n| n != 1) {
            return Err(ModelLoadError::Malformed(format!(
                "input `{}` has a static batch of {:?}; only single images are fed",
                spec.name, spec.dims[0]
            )));
        }

        let size = match (spec.dims[3], spec.dims[2]) {
            (Some(w), Some(h)) => Some((dim_u32(w)?, dim_u32(h)?)),
            _ => None,
        };
        let resize = meta
            .parse::<ResizeMode>(RESIZE_TYPE)?
            .unwrap_or_default();

        Ok(Self {
            input: spec.name.clone(),
            size,
            resize,
            pad_value: meta.parse_or(PAD_VALUE, 0u8)?,
            transform: InputTransform::from_metadata(meta)?,
        })
    }

    pub fn input_name(&self) -> &IOName {
        &self.input
    }

    pub fn resize_mode(&self) -> ResizeMode {
        self.resize
    }

    pub fn run(&self, image: &RgbImage) -> Result<(Tensor, ImageGeometry), InferenceError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::InvalidTensor("image is empty".to_string()));
        }
        let (resized, geometry) = match self.size {
            Some((w, h)) => self.fit(image, w, h),
            None => (image.clone(), ImageGeometry::identity(image.width(), image.height())),
        };
        Ok((self.to_tensor(&resized)?, geometry))
    }

    fn fit(&self, image: &RgbImage, width: u32, height: u32) -> (RgbImage, ImageGeometry) {
        let (ow, oh) = image.dimensions();
        let mut geometry = ImageGeometry {
            original: (ow, oh),
            input: (width, height),
            scale: (width as f32 / ow as f32, height as f32 / oh as f32),
            pad: (0.0, 0.0),
            offset: (0.0, 0.0),
        };

        match self.resize {
            ResizeMode::Standard => (resize(image, width, height), geometry),
            ResizeMode::FitToWindow | ResizeMode::FitToWindowLetterbox => {
                let s = geometry.scale.0.min(geometry.scale.1);
                let nw = ((ow as f32 * s).round() as u32).clamp(1, width);
                let nh = ((oh as f32 * s).round() as u32).clamp(1, height);
                let (dx, dy) = if self.resize == ResizeMode::FitToWindowLetterbox {
                    ((width - nw) / 2, (height - nh) / 2)
                } else {
                    (0, 0)
                };

                let mut canvas = RgbImage::from_pixel(width, height, Rgb([self.pad_value; 3]));
                imageops::replace(&mut canvas, &resize(image, nw, nh), i64::from(dx), i64::from(dy));

                geometry.scale = (nw as f32 / ow as f32, nh as f32 / oh as f32);
                geometry.pad = (dx as f32, dy as f32);
                (canvas, geometry)
            }
            ResizeMode::Crop => {
                let aspect = width as f32 / height as f32;
                let (cw, ch) = if (ow as f32 / oh as f32) > aspect {
                    (((oh as f32 * aspect).floor() as u32).clamp(1, ow), oh)
                } else {
                    (ow, ((ow as f32 / aspect).floor() as u32).clamp(1, oh))
                };
                let (cx, cy) = ((ow - cw) / 2, (oh - ch) / 2);
                let cropped = imageops::crop_imm(image, cx, cy, cw, ch).to_image();

                geometry.scale = (width as f32 / cw as f32, height as f32 / ch as f32);
                geometry.offset = (cx as f32, cy as f32);
                (resize(&cropped, width, height), geometry)
            }
        }
    }

    fn to_tensor(&self, image: &RgbImage) -> Result<Tensor, InferenceError> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let plane = w * h;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let at = y as usize * w + x as usize;
            for (c, v) in self.transform.apply(*pixel).into_iter().enumerate() {
                data[c * plane + at] = v;
            }
        }
        Tensor::from_f32(Shape::from_slice(&[1, 3, h, w]), &data)
    }
}

fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

fn dim_u32(d: usize) -> Result<u32, ModelLoadError> {
    u32::try_from(d)
        .ok()
        .filter(|&d| d > 0)
        .ok_or_else(|| ModelLoadError::Malformed(format!("input dimension {d} is not a valid image size")))
}
