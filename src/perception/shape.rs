use std::fmt;

use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};

use super::contour::{outlines, BoundingBox, Outline};
use crate::geometry::PixelPoint;

/// Blur applied to shape masks, which hold thinner strokes than color masks.
const SHAPE_BLUR: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Triangle,
    Rectangle,
    Circle,
}

impl Shape {
    pub fn from_vertices(vertices: usize) -> Option<Self> {
        match vertices {
            3 => Some(Shape::Triangle),
            4 => Some(Shape::Rectangle),
            n if n > 4 => Some(Shape::Circle),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Triangle => write!(f, "triangle"),
            Shape::Rectangle => write!(f, "rectangle"),
            Shape::Circle => write!(f, "circle"),
        }
    }
}

/// The kinds of marker a landing can home in on: a plain shape or the
/// three-element code marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetShape {
    Triangle,
    Rectangle,
    Circle,
    Code,
}

impl TargetShape {
    pub fn shape(self) -> Option<Shape> {
        match self {
            TargetShape::Triangle => Some(Shape::Triangle),
            TargetShape::Rectangle => Some(Shape::Rectangle),
            TargetShape::Circle => Some(Shape::Circle),
            TargetShape::Code => None,
        }
    }
}

fn crop(mask: &GrayImage, bbox: &BoundingBox) -> GrayImage {
    let x = bbox.x.min(mask.width());
    let y = bbox.y.min(mask.height());
    let width = bbox.width.min(mask.width() - x);
    let height = bbox.height.min(mask.height() - y);
    imageops::crop_imm(mask, x, y, width, height).to_image()
}

fn outlines_within(mask: &GrayImage, bbox: &BoundingBox, min_diagonal: f64) -> Vec<Outline> {
    let cropped = crop(mask, bbox);
    let offset = (bbox.x.min(mask.width()), bbox.y.min(mask.height()));

    outlines(&cropped, SHAPE_BLUR, offset)
        .into_iter()
        .filter(|o| o.bbox.diagonal() >= min_diagonal)
        .collect()
}

/// Classifies the largest shape outline drawn inside `bbox`.
pub fn classify_shape(
    bbox: &BoundingBox,
    shape_mask: &GrayImage,
    min_diagonal: f64,
) -> Option<Shape> {
    outlines_within(shape_mask, bbox, min_diagonal)
        .into_iter()
        .max_by(|a, b| a.bbox.diagonal().total_cmp(&b.bbox.diagonal()))
        .and_then(|o| Shape::from_vertices(o.vertices()))
}

/// Finds the three square elements of a code marker inside `bbox` and
/// returns their centers. When more than three squares are visible, the three
/// largest are kept.
pub fn classify_fiducial(
    bbox: &BoundingBox,
    shape_mask: &GrayImage,
    min_diagonal: f64,
) -> Option<[PixelPoint; 3]> {
    let mut elements: Vec<Outline> = outlines_within(shape_mask, bbox, min_diagonal)
        .into_iter()
        .filter(|o| o.vertices() == 4)
        .collect();

    if elements.len() < 3 {
        return None;
    }

    elements.sort_by(|a, b| b.bbox.diagonal().total_cmp(&a.bbox.diagonal()));

    Some([
        elements[0].bbox.center(),
        elements[1].bbox.center(),
        elements[2].bbox.center(),
    ])
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};

    use super::*;

    #[test]
    fn vertex_counts_map_to_shapes() {
        assert_eq!(Shape::from_vertices(2), None);
        assert_eq!(Shape::from_vertices(3), Some(Shape::Triangle));
        assert_eq!(Shape::from_vertices(4), Some(Shape::Rectangle));
        assert_eq!(Shape::from_vertices(9), Some(Shape::Circle));
    }

    #[test]
    fn fiducial_keeps_three_largest_elements() {
        let mut mask = GrayImage::new(300, 300);
        draw_filled_rect_mut(&mut mask, Rect::at(50, 50).of_size(40, 40), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(150, 50).of_size(40, 40), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(50, 150).of_size(40, 40), Luma([255]));
        // speck that must lose against the real elements
        draw_filled_rect_mut(&mut mask, Rect::at(150, 150).of_size(12, 12), Luma([255]));

        let bbox = BoundingBox {
            x: 20,
            y: 20,
            width: 220,
            height: 220,
        };
        let corners = classify_fiducial(&bbox, &mask, 1.0).unwrap();

        let mut xs: Vec<_> = corners.iter().map(|c| c.x.round() as i32).collect();
        xs.sort();
        assert!((xs[0] - 70).abs() <= 2 && (xs[2] - 170).abs() <= 2, "{:?}", corners);
        assert!(corners.iter().all(|c| c.y < 180.0));
    }

    #[test]
    fn fiducial_needs_three_elements() {
        let mut mask = GrayImage::new(200, 200);
        draw_filled_rect_mut(&mut mask, Rect::at(20, 20).of_size(40, 40), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(120, 20).of_size(40, 40), Luma([255]));

        let bbox = BoundingBox {
            x: 0,
            y: 0,
            width: 200,
            height: 200,
        };
        assert_eq!(classify_fiducial(&bbox, &mask, 1.0), None);
    }
}
