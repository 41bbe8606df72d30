use std::collections::BTreeMap;
use std::str::FromStr;

use crate::ModelLoadError;

pub const MODEL_TYPE: &str = "model_type";
pub const LABELS: &str = "labels";
pub const CONFIDENCE_THRESHOLD: &str = "confidence_threshold";
pub const IOU_THRESHOLD: &str = "iou_threshold";
pub const MEAN_VALUES: &str = "mean_values";
pub const SCALE_VALUES: &str = "scale_values";
pub const REVERSE_INPUT_CHANNELS: &str = "reverse_input_channels";
pub const RESIZE_TYPE: &str = "resize_type";
pub const PAD_VALUE: &str = "pad_value";
pub const TOPK: &str = "topk";
pub const APPLY_SOFTMAX: &str = "apply_softmax";
pub const BOX_VARIANCES: &str = "box_variances";

/// Key/value configuration embedded in a model representation.
///
/// Values are stored as strings, the way both the native graph format and ONNX
/// custom metadata carry them; typed getters parse on access.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelMetadata(BTreeMap<String, String>);

impl ModelMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ModelLoadError>
    where
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, e.to_string()))
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ModelLoadError>
    where
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Accepts `true/false`, `yes/no` and `1/0`.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, ModelLoadError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(invalid(key, format!("expected a boolean, got `{v}`"))),
            },
        }
    }

    /// Space- or comma-separated list of floats.
    pub fn floats(&self, key: &str) -> Result<Option<Vec<f32>>, ModelLoadError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f32>()
                    .map_err(|e| invalid(key, format!("`{s}`: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Labels are stored space-separated.
    pub fn labels(&self) -> Vec<String> {
        self.get(LABELS)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl FromIterator<(String, String)> for ModelMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for ModelMetadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<ModelMetadata> for BTreeMap<String, String> {
    fn from(meta: ModelMetadata) -> Self {
        meta.0
    }
}

fn invalid(key: &str, message: String) -> ModelLoadError {
    ModelLoadError::InvalidMetadata {
        key: key.to_string(),
        message,
    }
}
