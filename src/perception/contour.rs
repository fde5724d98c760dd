use image::GrayImage;
use imageproc::{
    contours::{find_contours, BorderType},
    contrast::threshold,
    filter::gaussian_blur_f32,
    geometry::{approximate_polygon_dp, arc_length},
    point::Point,
};
use serde::{Deserialize, Serialize};

use crate::geometry::PixelPoint;

/// Binarization level applied after blurring a mask.
const MASK_THRESHOLD: u8 = 60;

/// Polygon approximation tolerance as a fraction of the contour length.
const APPROX_FRACTION: f64 = 0.04;

/// Axis-aligned bounding box in pixels.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    fn around(points: &[Point<i32>]) -> Self {
        let min_x = points.iter().map(|p| p.x).min().unwrap_or(0).max(0);
        let min_y = points.iter().map(|p| p.y).min().unwrap_or(0).max(0);
        let max_x = points.iter().map(|p| p.x).max().unwrap_or(0).max(min_x);
        let max_y = points.iter().map(|p| p.y).max().unwrap_or(0).max(min_y);

        BoundingBox {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x) as u32 + 1,
            height: (max_y - min_y) as u32 + 1,
        }
    }

    pub fn diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64)
    }

    pub fn center(&self) -> PixelPoint {
        PixelPoint::new(
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }
}

/// An outer contour reduced to its polygon corners.
#[derive(Debug, Clone, PartialEq)]
pub struct Outline {
    pub polygon: Vec<PixelPoint>,
    pub bbox: BoundingBox,
}

impl Outline {
    pub fn vertices(&self) -> usize {
        self.polygon.len()
    }
}

/// Douglas-Peucker over a closed contour: the contour is split at the point
/// farthest from its start and each half is simplified on its own, so the
/// start point does not need to be a corner.
fn approximate_closed(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let first = points[0];
    let distance = |p: &Point<i32>| {
        let (dx, dy) = ((p.x - first.x) as i64, (p.y - first.y) as i64);
        dx * dx + dy * dy
    };
    let far = points
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| distance(p))
        .map(|(i, _)| i)
        .unwrap_or(0);

    if far == 0 {
        return vec![first];
    }

    let mut polygon = approximate_polygon_dp(&points[..=far], epsilon, false);
    polygon.pop();

    let mut back_half = points[far..].to_vec();
    back_half.push(first);
    polygon.extend(approximate_polygon_dp(&back_half, epsilon, false));
    polygon.pop();

    polygon.dedup();
    polygon
}

/// Finds the outer contours of a binary mask and approximates each as a
/// polygon. `offset` is added to every coordinate, for masks cropped out of a
/// larger frame.
pub fn outlines(mask: &GrayImage, blur_sigma: f32, offset: (u32, u32)) -> Vec<Outline> {
    if mask.width() == 0 || mask.height() == 0 {
        return Vec::new();
    }

    let blurred = gaussian_blur_f32(mask, blur_sigma);
    let binary = threshold(&blurred, MASK_THRESHOLD);

    find_contours::<i32>(&binary)
        .into_iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer) && c.parent.is_none())
        .filter(|c| !c.points.is_empty())
        .map(|c| {
            let epsilon = (APPROX_FRACTION * arc_length(&c.points, true)).max(1e-3);
            let approx = approximate_closed(&c.points, epsilon);
            let mut bbox = BoundingBox::around(&approx);
            bbox.x += offset.0;
            bbox.y += offset.1;

            let polygon = approx
                .iter()
                .map(|p| {
                    PixelPoint::new((p.x as u32 + offset.0) as f64, (p.y as u32 + offset.1) as f64)
                })
                .collect();

            Outline { polygon, bbox }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::{
        drawing::{draw_filled_rect_mut, draw_polygon_mut},
        rect::Rect,
    };

    use super::*;

    fn blank() -> GrayImage {
        GrayImage::new(200, 160)
    }

    #[test]
    fn rectangle_has_four_corners() {
        let mut mask = blank();
        draw_filled_rect_mut(&mut mask, Rect::at(40, 30).of_size(80, 50), Luma([255]));

        let found = outlines(&mask, 1.1, (0, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vertices(), 4);

        let bbox = found[0].bbox;
        assert!(
            (bbox.x as i32 - 40).abs() <= 2 && (bbox.width as i32 - 80).abs() <= 3,
            "{:?}",
            bbox
        );
        let center = bbox.center();
        assert!((center.x - 80.0).abs() < 2.0 && (center.y - 55.0).abs() < 2.0);
    }

    #[test]
    fn triangle_has_three_corners() {
        let mut mask = blank();
        draw_polygon_mut(
            &mut mask,
            &[Point::new(100, 20), Point::new(40, 120), Point::new(160, 120)],
            Luma([255]),
        );

        let found = outlines(&mask, 1.1, (0, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vertices(), 3);
    }

    #[test]
    fn holes_are_not_reported() {
        let mut mask = blank();
        draw_filled_rect_mut(&mut mask, Rect::at(20, 20).of_size(120, 100), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(60, 50).of_size(30, 30), Luma([0]));

        let found = outlines(&mask, 1.1, (0, 0));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn offset_shifts_coordinates() {
        let mut mask = blank();
        draw_filled_rect_mut(&mut mask, Rect::at(40, 30).of_size(80, 50), Luma([255]));

        let found = outlines(&mask, 1.1, (100, 10));
        assert!(found[0].bbox.x >= 138);
        assert!(found[0].polygon.iter().all(|p| p.x >= 138.0 && p.y >= 38.0));
    }
}
