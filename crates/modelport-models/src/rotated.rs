//! Rotated bounding rectangles around instance masks.

use std::fmt;

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;
use tracing::debug;

use crate::{Mask, SegmentedObject};

/// Minimum-area rectangle in original-image pixels. `angle` is in degrees,
/// within `(-45, 45]`, measured from the x axis to the `width` side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotatedRect {
    pub center: (f32, f32),
    pub width: f32,
    pub height: f32,
    pub angle: f32,
}

impl RotatedRect {
    /// Corners may come in any order.
    fn from_corners(corners: [Point<i32>; 4], offset: (f32, f32)) -> Self {
        let pts = corners.map(|p| (p.x as f32, p.y as f32));
        let center = pts
            .iter()
            .fold((0.0, 0.0), |(cx, cy), p| (cx + p.0 / 4.0, cy + p.1 / 4.0));

        // the two corners nearest to the first one span the sides
        let mut others = [pts[1], pts[2], pts[3]];
        others.sort_by(|a, b| distance(pts[0], *a).total_cmp(&distance(pts[0], *b)));
        let (side, other_side) = (others[0], others[1]);

        let mut width = distance(pts[0], side);
        let mut height = distance(pts[0], other_side);
        let mut angle = (side.1 - pts[0].1).atan2(side.0 - pts[0].0).to_degrees();
        while angle > 45.0 {
            angle -= 90.0;
            std::mem::swap(&mut width, &mut height);
        }
        while angle <= -45.0 {
            angle += 90.0;
            std::mem::swap(&mut width, &mut height);
        }

        Self {
            center: (center.0 + offset.0, center.1 + offset.1),
            width,
            height,
            angle: angle + 0.0,
        }
    }
}

impl fmt::Display for RotatedRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RotatedRect: {:.3} {:.3} {:.3} {:.3} {:.3}",
            self.center.0, self.center.1, self.width, self.height, self.angle
        )
    }
}

/// A segmented object plus one rotated rectangle per outer mask contour.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentedObjectWithRects {
    pub object: SegmentedObject,
    pub rotated_rects: Vec<RotatedRect>,
}

impl fmt::Display for SegmentedObjectWithRects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.object.to_string();
        f.write_str(base.strip_suffix(')').unwrap_or(&base))?;
        for rect in &self.rotated_rects {
            write!(f, ", {rect}")?;
        }
        f.write_str(")")
    }
}

/// Fits a rotated rectangle to every outer contour of each object's mask.
/// Contours with fewer than three points or under one pixel of area are
/// skipped.
pub fn add_rotated_rects(objects: &[SegmentedObject]) -> Vec<SegmentedObjectWithRects> {
    objects
        .iter()
        .map(|object| {
            let offset = (object.detection.x as f32, object.detection.y as f32);
            let rotated_rects = mask_rects(&object.mask, offset);
            debug!(label = object.detection.label, rects = rotated_rects.len(), "fitted rotated rects");
            SegmentedObjectWithRects {
                object: object.clone(),
                rotated_rects,
            }
        })
        .collect()
}

fn mask_rects(mask: &Mask, offset: (f32, f32)) -> Vec<RotatedRect> {
    if mask.width == 0 || mask.height == 0 {
        return Vec::new();
    }
    let Some(bitmap) = GrayImage::from_raw(mask.width, mask.height, mask.data.clone()) else {
        return Vec::new();
    };

    find_contours::<i32>(&bitmap)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter(|c| c.points.len() > 2 && polygon_area(&c.points) >= 1.0)
        .map(|c| RotatedRect::from_corners(min_area_rect(&c.points), offset))
        .collect()
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    twice.abs() as f64 / 2.0
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    (b.0 - a.0).hypot(b.1 - a.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Detection;

    fn object(x: u32, y: u32, mask: Mask) -> SegmentedObject {
        SegmentedObject {
            detection: Detection {
                x,
                y,
                width: mask.width,
                height: mask.height,
                score: 0.75,
                label: 1,
                label_name: Some("person".into()),
            },
            mask,
        }
    }

    fn filled(width: u32, height: u32, set: impl Fn(u32, u32) -> bool) -> Mask {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| u8::from(set(x, y)))
            .collect();
        Mask { width, height, data }
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn axis_aligned_block() {
        let mask = filled(12, 8, |x, y| (1..11).contains(&x) && (2..7).contains(&y));
        let objects = add_rotated_rects(&[object(100, 50, mask)]);
        let rects = &objects[0].rotated_rects;
        assert_eq!(rects.len(), 1);

        let r = rects[0];
        // pixel centres span x 1..=10, y 2..=6
        assert!(approx(r.width, 9.0) && approx(r.height, 4.0), "{r:?}");
        assert!(approx(r.angle, 0.0), "{r:?}");
        assert!(approx(r.center.0, 105.5) && approx(r.center.1, 54.0), "{r:?}");
    }

    #[test]
    fn separate_blobs_get_separate_rects_and_specks_are_dropped() {
        let mask = filled(20, 10, |x, y| {
            (x < 5 && y < 5) || ((10..18).contains(&x) && (3..9).contains(&y)) || (x == 19 && y == 9)
        });
        let objects = add_rotated_rects(&[object(0, 0, mask)]);
        assert_eq!(objects[0].rotated_rects.len(), 2);
    }

    #[test]
    fn empty_masks_have_no_rects() {
        let objects = add_rotated_rects(&[object(3, 3, filled(4, 4, |_, _| false))]);
        assert!(objects[0].rotated_rects.is_empty());
        assert_eq!(objects[0].to_string(), "(3, 3, 4, 4, 0.750, 1, person, 0)");
    }

    #[test]
    fn display_appends_rects() {
        let mask = filled(4, 3, |_, _| true);
        let objects = add_rotated_rects(&[object(0, 0, mask)]);
        assert_eq!(
            objects[0].to_string(),
            "(0, 0, 4, 3, 0.750, 1, person, 12, RotatedRect: 1.500 1.000 3.000 2.000 0.000)"
        );
    }

    #[test]
    fn shoelace_area() {
        let square = [Point::new(0, 0), Point::new(4, 0), Point::new(4, 4), Point::new(0, 4)];
        assert_eq!(polygon_area(&square), 16.0);
    }
}
