use std::{net::SocketAddr, path::PathBuf};

use config::{Config, ConfigError};
use serde::Deserialize;

use crate::{camera::CameraKind, vehicle::VehicleKind};

fn default_recovery_window() -> f64 {
    10.0
}

fn default_progress_interval() -> f64 {
    0.1
}

fn default_flight_height() -> f64 {
    5.0
}

fn default_land_speed() -> f64 {
    2.0
}

fn default_connect_attempts() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionConfig {
    /// Directory holding the working plan and the recovery file
    pub storage_path: PathBuf,

    /// Seconds after which a recovery file is considered stale
    #[serde(default = "default_recovery_window")]
    pub recovery_window: f64,

    /// Seconds between progress snapshots
    #[serde(default = "default_progress_interval")]
    pub progress_interval: f64,

    #[serde(default = "default_flight_height")]
    pub flight_height: f64,

    #[serde(default = "default_land_speed")]
    pub land_speed: f64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LandingConfig {
    /// Relative altitude below which visual corrections stop
    pub decision_height: f64,
    pub correction_gain: f64,
    pub control_interval: f64,
    pub max_retries: u32,

    /// Altitude readings and estimates are clamped to at least this value
    pub min_altitude: f64,

    pub marker_short_side: f64,
    pub marker_long_side: f64,
    pub code_side: f64,
}

impl Default for LandingConfig {
    fn default() -> Self {
        LandingConfig {
            decision_height: 1.0,
            correction_gain: 0.1,
            control_interval: 0.1,
            max_retries: 10,
            min_altitude: 0.1,
            marker_short_side: 0.4,
            marker_long_side: 0.6,
            code_side: 0.5,
        }
    }
}

/// Color bounds in CIELAB (L in 0..100, a and b in -128..127).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ColorRangeConfig {
    Wrapped {
        lower_0: [f64; 3],
        upper_0: [f64; 3],
        lower_1: [f64; 3],
        upper_1: [f64; 3],
    },
    Single {
        lower: [f64; 3],
        upper: [f64; 3],
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColorConfig {
    pub name: String,

    #[serde(flatten)]
    pub range: ColorRangeConfig,
}

fn default_fov() -> [f64; 2] {
    [66.0, 41.0]
}

fn default_min_diagonal() -> f64 {
    10.0
}

fn default_min_diagonal_small() -> f64 {
    1.0
}

fn default_quality_threshold() -> f64 {
    -1.0
}

fn default_cluster_distance() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub colors: Vec<ColorConfig>,
    pub shape_color: ColorRangeConfig,

    /// Shape outlines are drawn in the complement of the marker color
    #[serde(default)]
    pub shape_inverted: bool,

    #[serde(default = "default_fov")]
    pub fov: [f64; 2],

    #[serde(default)]
    pub camera_offset: [f64; 3],

    #[serde(default)]
    pub rotation_offset: [f64; 3],

    #[serde(default = "default_min_diagonal")]
    pub min_diagonal: f64,

    #[serde(default = "default_min_diagonal_small")]
    pub min_diagonal_shape: f64,

    #[serde(default = "default_min_diagonal_small")]
    pub min_diagonal_code_element: f64,

    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Meters within which detections are considered the same object
    #[serde(default = "default_cluster_distance")]
    pub cluster_distance: f64,

    /// Directory holding the observation journal and captured images
    pub journal_path: PathBuf,
}

fn default_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Frames per second when a mission does not give a rate
    #[serde(default = "default_rate")]
    pub default_rate: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            default_rate: default_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub kind: VehicleKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub kind: CameraKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub address: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    pub mission: MissionConfig,

    #[serde(default)]
    pub landing: LandingConfig,

    pub vision: VisionConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    pub vehicle: VehicleConfig,
    pub camera: CameraConfig,
    pub upload: Option<UploadConfig>,
}

impl PayloadConfig {
    pub fn read_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let mut c = Config::new();

        c.merge(config::File::from(path))?;
        c.merge(config::Environment::with_prefix("PAYLOAD").separator("__"))?;

        c.try_into()
    }
}
