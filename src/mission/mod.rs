//! Mission scheduling: plan loading and resumption, execution of the action
//! tree, crash-recoverable progress and mission replacement.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    capture::CaptureLoop,
    config::{CaptureConfig, LandingConfig, MissionConfig},
    vehicle::VehicleLink,
};

pub mod landing;
pub mod plan;
pub mod progress;
pub mod runner;
pub mod supervisor;

pub use plan::{count, load_plan, resume_subplan, Action, MissionPlan, PlanError, Resumed};
pub use progress::{MissionStore, ProgressState};
pub use supervisor::{Supervisor, SupervisorRequest};

/// Flight settings in effect for one mission: configured defaults with the
/// plan's `parameter` block applied.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionSettings {
    pub flight_height: f64,
    pub land_speed: f64,
    pub default_rate: f64,
    pub landing: LandingConfig,
}

impl MissionSettings {
    pub fn from_config(
        mission: &MissionConfig,
        landing: &LandingConfig,
        capture: &CaptureConfig,
    ) -> Self {
        MissionSettings {
            flight_height: mission.flight_height,
            land_speed: mission.land_speed,
            default_rate: capture.default_rate,
            landing: landing.clone(),
        }
    }

    /// Applies plan overrides. Heights are clamped to the minimum altitude
    /// and a negative decision height becomes zero.
    pub fn with_parameters(&self, parameters: &plan::MissionParameters) -> Self {
        let mut settings = self.clone();
        let min_altitude = settings.landing.min_altitude;

        if let Some(height) = parameters.flight_height {
            settings.flight_height = height;
        }
        if let Some(height) = parameters.decision_height {
            settings.landing.decision_height = height;
        }
        if let Some(speed) = parameters.land_speed.filter(|s| *s > 0.0) {
            settings.land_speed = speed;
        }

        settings.flight_height = settings.flight_height.max(min_altitude);
        settings.landing.decision_height = settings.landing.decision_height.max(0.0);
        settings
    }
}

/// Collaborators shared by the supervisor and the mission it runs.
pub struct MissionContext {
    pub link: Arc<dyn VehicleLink>,
    pub capture: Arc<CaptureLoop>,
    pub store: Arc<MissionStore>,
    pub progress: watch::Sender<ProgressState>,
    pub defaults: MissionSettings,
}

impl MissionContext {
    /// Sends a status line, logging instead of failing when the link drops it.
    pub async fn status(&self, text: &str) {
        if let Err(err) = self.link.send_status(text).await {
            warn!("failed to send status {:?}: {:#}", text, err);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        camera::StaticCamera,
        capture::tests::fixture,
        util::seconds,
        vehicle::SoftwareVehicle,
    };

    pub struct Harness {
        pub dir: TempDir,
        pub vehicle: Arc<SoftwareVehicle>,
        pub camera: Arc<StaticCamera>,
        pub ctx: Arc<MissionContext>,
    }

    impl Harness {
        pub fn write_plan(&self, name: &str, plan: serde_json::Value) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, plan.to_string()).unwrap();
            path
        }

        pub fn mission_dir(&self) -> &Path {
            self.ctx.store.dir()
        }
    }

    pub async fn harness() -> Harness {
        let f = fixture(-1.0).await;

        let store = MissionStore::new(f.dir.path().join("mission"), seconds(10.0)).unwrap();
        let (progress, _) = watch::channel(ProgressState::default());

        let ctx = Arc::new(MissionContext {
            link: f.vehicle.clone(),
            capture: Arc::new(CaptureLoop::new(f.pipeline.clone())),
            store: Arc::new(store),
            progress,
            defaults: MissionSettings {
                flight_height: 5.0,
                land_speed: 2.0,
                default_rate: 1.0,
                landing: LandingConfig::default(),
            },
        });

        Harness {
            dir: f.dir,
            vehicle: f.vehicle,
            camera: f.camera,
            ctx,
        }
    }

    #[test]
    fn parameters_override_and_clamp() {
        let defaults = MissionSettings {
            flight_height: 5.0,
            land_speed: 2.0,
            default_rate: 1.0,
            landing: LandingConfig::default(),
        };

        let settings = defaults.with_parameters(&plan::MissionParameters {
            flight_height: Some(-3.0),
            decision_height: Some(-1.0),
            land_speed: Some(0.0),
        });

        assert_eq!(settings.flight_height, defaults.landing.min_altitude);
        assert_eq!(settings.landing.decision_height, 0.0);
        assert_eq!(settings.land_speed, 2.0);

        let settings = defaults.with_parameters(&plan::MissionParameters {
            flight_height: Some(12.0),
            ..Default::default()
        });
        assert_eq!(settings.flight_height, 12.0);
        assert_eq!(settings.landing, defaults.landing);
    }
}
