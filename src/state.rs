use geo::Point;
use serde::{Deserialize, Serialize};

/// Vehicle attitude in degrees.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Attitude {
    pub fn new(roll: f64, pitch: f64, yaw: f64) -> Self {
        Attitude { roll, pitch, yaw }
    }

    /// The same attitude with the heading removed, so that projected offsets
    /// come out in the vehicle's heading-aligned frame.
    pub fn without_yaw(self) -> Self {
        Attitude { yaw: 0.0, ..self }
    }
}

/// Global vehicle pose sampled from the vehicle link when a frame is taken.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Latitude in degrees
    pub lat: f64,

    /// Longitude in degrees
    pub lon: f64,

    /// Altitude in meters above the takeoff point
    pub rel_alt: f64,

    #[serde(flatten)]
    pub attitude: Attitude,
}

impl Pose {
    /// A pose reported before the link has a position fix is all zeroes.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && (self.lat != 0.0 || self.lon != 0.0)
    }

    /// Position as a geo point (x = longitude, y = latitude).
    pub fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// Vehicle position in the autopilot's local north/east/down frame.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalPosition {
    pub north: f64,
    pub east: f64,
    pub down: f64,

    #[serde(flatten)]
    pub attitude: Attitude,
}

/// A 3-axis vector in a north/east/down (or forward/right/down) frame.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ned {
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

impl Ned {
    pub fn new(north: f64, east: f64, down: f64) -> Self {
        Ned { north, east, down }
    }
}
