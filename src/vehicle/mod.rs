//! The vehicle link: arming, position setpoints, velocity commands and
//! telemetry queries against the autopilot.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::state::{LocalPosition, Ned, Pose};

// simulated vehicle
pub mod software;

pub use software::SoftwareVehicle;

fn default_speed() -> f64 {
    5.0
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum VehicleKind {
    Software {
        home_lat: f64,
        home_lon: f64,

        /// Cruise and climb speed in m/s
        #[serde(default = "default_speed")]
        speed: f64,
    },
}

/// Commands are serialized by the mission scheduler; implementations only
/// need to be safe to query from several tasks.
#[async_trait]
pub trait VehicleLink: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;

    /// Arms and climbs to `height` meters above the takeoff point.
    async fn start(&self, height: f64) -> anyhow::Result<()>;

    async fn land(&self) -> anyhow::Result<()>;

    /// Resolves once the vehicle is on the ground and disarmed.
    async fn await_disarm(&self) -> anyhow::Result<()>;

    /// Flies to a global position at `height` meters relative altitude.
    async fn mov_to_lat_lon_alt(
        &self,
        lat: f64,
        lon: f64,
        height: f64,
        yaw: Option<f64>,
    ) -> anyhow::Result<()>;

    /// Flies to a position in the local north/east/down frame.
    async fn mov_to_xyz(&self, position: Ned, yaw: Option<f64>) -> anyhow::Result<()>;

    /// Flies by an offset in the local north/east/down frame.
    async fn mov_by_xyz(&self, offset: Ned, yaw: Option<f64>) -> anyhow::Result<()>;

    /// Sets a velocity in the heading-aligned frame (forward, right, down).
    /// `yaw` turns the heading by that many degrees.
    async fn mov_by_vel(&self, velocity: Ned, yaw: Option<f64>) -> anyhow::Result<()>;

    async fn get_position_xyz(&self) -> anyhow::Result<LocalPosition>;

    async fn get_position_lat_lon_alt(&self) -> anyhow::Result<Pose>;

    async fn get_relative_height(&self) -> anyhow::Result<f64>;

    async fn is_flying(&self) -> anyhow::Result<bool>;

    /// Reports a human readable status line to the ground.
    async fn send_status(&self, text: &str) -> anyhow::Result<()>;
}

pub fn create_link(kind: &VehicleKind) -> anyhow::Result<Arc<dyn VehicleLink>> {
    match kind {
        VehicleKind::Software {
            home_lat,
            home_lon,
            speed,
        } => Ok(Arc::new(SoftwareVehicle::new(*home_lat, *home_lon, *speed)?)),
    }
}
