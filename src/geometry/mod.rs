//! Pinhole projection from image pixels to ground offsets in the local
//! north/east/down frame.
//!
//! Camera rays use x to the right of the image, y down the image and z along
//! the optical axis. The camera looks straight down when the mount rotation is
//! zero, with the top of the image facing the vehicle's nose.

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::Attitude;

mod height;
mod local;

pub use height::*;
pub use local::*;

/// Directions whose vertical component is below this never reach the ground.
const MIN_VERTICAL: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("ray does not intersect the ground (vertical component {0:.6})")]
    AboveHorizon(f64),

    #[error("marker outline is degenerate: {0}")]
    DegenerateMarker(&'static str),
}

/// A point in image coordinates (pixels, origin at the top left).
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn new(x: f64, y: f64) -> Self {
        PixelPoint { x, y }
    }
}

/// Builds the camera-frame ray through a pixel. `fov` is the horizontal and
/// vertical field of view in degrees.
pub fn pixel_ray(px: f64, py: f64, image_size: (u32, u32), fov: (f64, f64)) -> Vector3<f64> {
    let half_w = image_size.0 as f64 / 2.0;
    let half_h = image_size.1 as f64 / 2.0;

    let x = (px - half_w) / half_w;
    let y = (py - half_h) / half_h;

    Vector3::new(
        x * (fov.0.to_radians() / 2.0).tan(),
        y * (fov.1.to_radians() / 2.0).tan(),
        1.0,
    )
}

/// Rotation from vehicle attitude, applied yaw first, then pitch, then roll.
pub fn attitude_rotation(attitude: Attitude) -> Rotation3<f64> {
    Rotation3::from_euler_angles(
        attitude.roll.to_radians(),
        attitude.pitch.to_radians(),
        attitude.yaw.to_radians(),
    )
}

/// Maps camera axes onto body axes (forward, right, down) for a downward
/// facing camera.
fn camera_to_body() -> Matrix3<f64> {
    Matrix3::new(
        0.0, -1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Rotates a camera ray into the local tangent frame.
pub fn orient(
    ray: Vector3<f64>,
    attitude: Attitude,
    mount_rotation: Rotation3<f64>,
) -> Vector3<f64> {
    attitude_rotation(attitude) * (mount_rotation * (camera_to_body() * ray))
}

/// Scales `direction` down to flat ground `height` below the camera and adds
/// the camera's mount offset, giving the (north, east, down) displacement from
/// the vehicle's reference point.
pub fn ground_intersect(
    direction: Vector3<f64>,
    height: f64,
    attitude: Attitude,
    mount_offset: Vector3<f64>,
) -> Result<Vector3<f64>, GeometryError> {
    if direction.z < MIN_VERTICAL {
        return Err(GeometryError::AboveHorizon(direction.z));
    }

    let ground = direction * (height / direction.z);
    Ok(ground + attitude_rotation(attitude) * mount_offset)
}

/// Camera intrinsics and mounting, validated once from config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    /// Horizontal and vertical field of view in degrees
    pub fov: (f64, f64),

    /// Camera position relative to the vehicle reference point, body frame
    /// (forward, right, down) in meters
    pub mount_offset: Vector3<f64>,

    pub mount_rotation: Rotation3<f64>,
}

impl CameraModel {
    pub fn new(fov: (f64, f64), mount_offset: [f64; 3], mount_rotation: [f64; 3]) -> Self {
        CameraModel {
            fov,
            mount_offset: Vector3::from(mount_offset),
            mount_rotation: Rotation3::from_euler_angles(
                mount_rotation[0].to_radians(),
                mount_rotation[1].to_radians(),
                mount_rotation[2].to_radians(),
            ),
        }
    }

    /// Direction of a pixel's ray in the local frame.
    pub fn direction(
        &self,
        pixel: PixelPoint,
        image_size: (u32, u32),
        attitude: Attitude,
    ) -> Vector3<f64> {
        let ray = pixel_ray(pixel.x, pixel.y, image_size, self.fov);
        orient(ray, attitude, self.mount_rotation)
    }

    /// Ground displacement of a pixel seen from `height` meters.
    pub fn locate(
        &self,
        pixel: PixelPoint,
        image_size: (u32, u32),
        attitude: Attitude,
        height: f64,
    ) -> Result<Vector3<f64>, GeometryError> {
        let direction = self.direction(pixel, image_size, attitude);
        ground_intersect(direction, height, attitude, self.mount_offset)
    }
}

impl Default for CameraModel {
    fn default() -> Self {
        CameraModel::new((66.0, 41.0), [0.0; 3], [0.0; 3])
    }
}
