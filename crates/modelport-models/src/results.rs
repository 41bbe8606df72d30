use std::fmt;

use crate::ModelKind;

/// Axis-aligned detection in original-image pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub score: f32,
    pub label: usize,
    pub label_name: Option<String>,
}

impl Detection {
    pub fn xmax(&self) -> u32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {:.3}, {}, {})",
            self.x,
            self.y,
            self.width,
            self.height,
            self.score,
            self.label,
            self.label_name.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: usize,
    pub label_name: Option<String>,
    pub score: f32,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {:.3})",
            self.label,
            self.label_name.as_deref().unwrap_or("-"),
            self.score
        )
    }
}

/// Binary mask covering a detection's box, row-major, one byte per pixel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Mask {
    pub fn get(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.data[(y * self.width + x) as usize] != 0
    }

    /// Number of set pixels.
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SegmentedObject {
    pub detection: Detection,
    pub mask: Mask,
}

impl fmt::Display for SegmentedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.detection;
        write!(
            f,
            "({}, {}, {}, {}, {:.3}, {}, {}, {})",
            d.x,
            d.y,
            d.width,
            d.height,
            d.score,
            d.label,
            d.label_name.as_deref().unwrap_or("-"),
            self.mask.area()
        )
    }
}

/// Output of one `Model::infer` call.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceResult {
    Classification(Vec<Classification>),
    Detection(Vec<Detection>),
    InstanceSegmentation(Vec<SegmentedObject>),
}

impl InferenceResult {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Classification(_) => ModelKind::Classification,
            Self::Detection(_) => ModelKind::Detection,
            Self::InstanceSegmentation(_) => ModelKind::InstanceSegmentation,
        }
    }

    /// Located objects in result order; empty for classification.
    pub fn objects(&self) -> Vec<&Detection> {
        match self {
            Self::Classification(_) => Vec::new(),
            Self::Detection(d) => d.iter().collect(),
            Self::InstanceSegmentation(s) => s.iter().map(|o| &o.detection).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Classification(c) => c.len(),
            Self::Detection(d) => d.len(),
            Self::InstanceSegmentation(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for InferenceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str("; ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Self::Classification(c) => join(f, c),
            Self::Detection(d) => join(f, d),
            Self::InstanceSegmentation(s) => join(f, s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: u32, label: usize) -> Detection {
        Detection {
            x,
            y: 20,
            width: 30,
            height: 40,
            score: 0.875,
            label,
            label_name: None,
        }
    }

    #[test]
    fn display_lists_objects_in_order() {
        let mut first = det(10, 1);
        first.label_name = Some("person".into());
        let result = InferenceResult::Detection(vec![first, det(100, 2)]);
        assert_eq!(
            result.to_string(),
            "(10, 20, 30, 40, 0.875, 1, person); (100, 20, 30, 40, 0.875, 2, -)"
        );
        assert_eq!(result.objects()[1].xmax(), 130);
        assert_eq!(result.kind(), ModelKind::Detection);
    }

    #[test]
    fn mask_area_counts_set_pixels() {
        let mask = Mask {
            width: 2,
            height: 2,
            data: vec![1, 0, 1, 1],
        };
        assert_eq!(mask.area(), 3);
        assert!(mask.get(0, 1) && !mask.get(1, 0) && !mask.get(5, 5));

        let result = InferenceResult::InstanceSegmentation(vec![SegmentedObject {
            detection: det(0, 3),
            mask,
        }]);
        assert_eq!(result.len(), 1);
        assert!(result.to_string().ends_with(", 3)"));
        assert!(InferenceResult::Classification(vec![]).is_empty());
    }
}
