use nalgebra::Vector3;

use super::{CameraModel, GeometryError, PixelPoint};
use crate::state::Attitude;

const BOX_ITERATIONS: usize = 3;
const FIDUCIAL_ITERATIONS: usize = 5;

/// Result of refining the camera height against an object of known size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeightEstimate {
    /// Displacement of the object from the vehicle (north, east, down)
    pub offset: Vector3<f64>,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiducialEstimate {
    pub offset: Vector3<f64>,
    pub height: f64,

    /// Heading correction in degrees that aligns the vehicle with the
    /// marker's left edge
    pub yaw_offset: f64,
}

fn horizontal_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Refines a height estimate from a quadrilateral of known side lengths.
///
/// Every round projects the outline at the current height; the two shortest
/// projected edges are compared against `short_side` and the two longest
/// against `long_side`, and the height is scaled by the mean ratio.
#[allow(clippy::too_many_arguments)]
pub fn refine_height_known_box(
    model: &CameraModel,
    image_size: (u32, u32),
    outline: &[PixelPoint],
    center: PixelPoint,
    attitude: Attitude,
    initial_height: f64,
    short_side: f64,
    long_side: f64,
) -> Result<HeightEstimate, GeometryError> {
    if outline.len() != 4 {
        return Err(GeometryError::DegenerateMarker("outline is not a quadrilateral"));
    }

    let mut height = initial_height;

    for _ in 0..BOX_ITERATIONS {
        let points = outline
            .iter()
            .map(|p| model.locate(*p, image_size, attitude, height))
            .collect::<Result<Vec<_>, _>>()?;

        let mut edges: Vec<f64> = (0..points.len())
            .map(|i| horizontal_distance(&points[i], &points[(i + 1) % points.len()]))
            .collect();
        edges.sort_by(|a, b| a.total_cmp(b));

        if edges[0] <= f64::EPSILON {
            return Err(GeometryError::DegenerateMarker("zero length edge"));
        }

        let factor = (short_side / edges[0]
            + short_side / edges[1]
            + long_side / edges[2]
            + long_side / edges[3])
            / 4.0;
        height *= factor;
    }

    let offset = model.locate(center, image_size, attitude, height)?;
    Ok(HeightEstimate { offset, height })
}

/// Orders three code elements as (top left, top right, bottom left). The
/// corner is the vertex whose two edges are closest to perpendicular, and
/// the top edge is the one that turns clockwise onto the left edge in image
/// coordinates.
pub fn order_code_corners(corners: &[PixelPoint; 3]) -> [PixelPoint; 3] {
    let edge = |from: usize, to: usize| {
        (
            corners[to].x - corners[from].x,
            corners[to].y - corners[from].y,
        )
    };

    let mut best = (0, f64::INFINITY);
    for i in 0..3 {
        let a = edge(i, (i + 1) % 3);
        let b = edge(i, (i + 2) % 3);
        let norm = (a.0.hypot(a.1) * b.0.hypot(b.1)).max(f64::EPSILON);
        let cos = ((a.0 * b.0 + a.1 * b.1) / norm).abs();
        if cos < best.1 {
            best = (i, cos);
        }
    }

    let i = best.0;
    let (j, k) = ((i + 1) % 3, (i + 2) % 3);
    let a = edge(i, j);
    let b = edge(i, k);

    if a.0 * b.1 - a.1 * b.0 > 0.0 {
        [corners[i], corners[j], corners[k]]
    } else {
        [corners[i], corners[k], corners[j]]
    }
}

/// Refines a height estimate from the three elements of a code marker whose
/// top and left edges are `side` meters long.
pub fn refine_height_fiducial(
    model: &CameraModel,
    image_size: (u32, u32),
    code_corners: &[PixelPoint; 3],
    attitude: Attitude,
    initial_height: f64,
    side: f64,
) -> Result<FiducialEstimate, GeometryError> {
    let [top_left, top_right, bottom_left] = order_code_corners(code_corners);

    let mut height = initial_height;

    for _ in 0..FIDUCIAL_ITERATIONS {
        let tl = model.locate(top_left, image_size, attitude, height)?;
        let tr = model.locate(top_right, image_size, attitude, height)?;
        let bl = model.locate(bottom_left, image_size, attitude, height)?;

        let top = horizontal_distance(&tl, &tr);
        let left = horizontal_distance(&tl, &bl);
        if top <= f64::EPSILON || left <= f64::EPSILON {
            return Err(GeometryError::DegenerateMarker("code elements overlap"));
        }

        height *= side * (1.0 / left + 1.0 / top) / 2.0;
    }

    let tr = model.locate(top_right, image_size, attitude, height)?;
    let bl = model.locate(bottom_left, image_size, attitude, height)?;
    let offset = (tr + bl) / 2.0;

    let (dx, dy) = (bottom_left.x - top_left.x, bottom_left.y - top_left.y);
    let yaw_offset = -dx.atan2(dy).to_degrees();

    Ok(FiducialEstimate {
        offset,
        height,
        yaw_offset,
    })
}
