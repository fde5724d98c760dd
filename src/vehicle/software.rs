use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{bail, ensure};
use async_trait::async_trait;
use nalgebra::{Rotation3, Vector3};
use tokio::time::Instant;

use super::VehicleLink;
use crate::{
    geometry::LocalFrame,
    state::{Attitude, LocalPosition, Ned, Pose},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default descent rate of the autopilot's own landing mode, m/s.
const LAND_RATE: f64 = 1.0;

/// Point-mass vehicle: position setpoints take distance / speed to reach,
/// velocity setpoints are integrated lazily whenever the state is read.
/// Reaching the ground while descending lands and disarms it.
#[derive(Debug)]
struct SimState {
    connected: bool,
    armed: bool,

    /// North, east, down relative to home; down is negative in the air
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    yaw: f64,
    last_tick: Instant,
}

impl SimState {
    fn tick(&mut self) {
        let now = Instant::now();
        let dt = (now - self.last_tick).as_secs_f64();
        self.last_tick = now;

        if self.armed {
            self.position += self.velocity * dt;
        }

        if self.position.z >= 0.0 {
            self.position.z = 0.0;
            if self.velocity.z > 0.0 {
                self.velocity = Vector3::zeros();
                if self.armed {
                    info!("simulated vehicle touched down, disarming");
                    self.armed = false;
                }
            }
        }
    }

    fn altitude(&self) -> f64 {
        -self.position.z
    }
}

#[derive(Debug)]
pub struct SoftwareVehicle {
    frame: LocalFrame,
    speed: f64,
    state: Mutex<SimState>,
    statuses: Mutex<Vec<String>>,
}

impl SoftwareVehicle {
    pub fn new(home_lat: f64, home_lon: f64, speed: f64) -> anyhow::Result<Self> {
        ensure!(speed > 0.0, "simulated vehicle speed must be positive");

        Ok(SoftwareVehicle {
            frame: LocalFrame::new(home_lat, home_lon),
            speed,
            state: Mutex::new(SimState {
                connected: false,
                armed: false,
                position: Vector3::zeros(),
                velocity: Vector3::zeros(),
                yaw: 0.0,
                last_tick: Instant::now(),
            }),
            statuses: Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, SimState>> {
        match self.state.lock() {
            Ok(mut state) => {
                state.tick();
                Ok(state)
            }
            Err(_) => bail!("simulated vehicle state is poisoned"),
        }
    }

    /// Every status line sent so far.
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    async fn fly_to(&self, target: Vector3<f64>, yaw: Option<f64>) -> anyhow::Result<()> {
        ensure!(
            target.iter().all(|v| v.is_finite()),
            "invalid position setpoint {:?}",
            target
        );

        let distance = {
            let mut state = self.state()?;
            ensure!(state.connected, "vehicle link is not connected");
            ensure!(state.armed, "vehicle is not armed");
            state.velocity = Vector3::zeros();
            (target - state.position).norm()
        };

        tokio::time::sleep(Duration::from_secs_f64(distance / self.speed)).await;

        let mut state = self.state()?;
        state.position = target;
        if let Some(yaw) = yaw {
            state.yaw = yaw;
        }
        Ok(())
    }
}

#[async_trait]
impl VehicleLink for SoftwareVehicle {
    async fn connect(&self) -> anyhow::Result<()> {
        self.state()?.connected = true;
        debug!("simulated vehicle connected");
        Ok(())
    }

    async fn start(&self, height: f64) -> anyhow::Result<()> {
        ensure!(height.is_finite() && height > 0.0, "invalid takeoff height {}", height);

        let climb = {
            let mut state = self.state()?;
            ensure!(state.connected, "vehicle link is not connected");
            state.armed = true;
            state.velocity = Vector3::zeros();
            (height - state.altitude()).abs()
        };

        tokio::time::sleep(Duration::from_secs_f64(climb / self.speed)).await;
        self.state()?.position.z = -height;
        Ok(())
    }

    async fn land(&self) -> anyhow::Result<()> {
        let mut state = self.state()?;
        state.velocity = Vector3::new(0.0, 0.0, LAND_RATE);
        Ok(())
    }

    async fn await_disarm(&self) -> anyhow::Result<()> {
        loop {
            if !self.state()?.armed {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn mov_to_lat_lon_alt(
        &self,
        lat: f64,
        lon: f64,
        height: f64,
        yaw: Option<f64>,
    ) -> anyhow::Result<()> {
        let (north, east) = self.frame.to_local(geo::Point::new(lon, lat));
        self.fly_to(Vector3::new(north, east, -height), yaw).await
    }

    async fn mov_to_xyz(&self, position: Ned, yaw: Option<f64>) -> anyhow::Result<()> {
        self.fly_to(Vector3::new(position.north, position.east, position.down), yaw)
            .await
    }

    async fn mov_by_xyz(&self, offset: Ned, yaw: Option<f64>) -> anyhow::Result<()> {
        let current = self.state()?.position;
        let target = current + Vector3::new(offset.north, offset.east, offset.down);
        self.fly_to(target, yaw).await
    }

    async fn mov_by_vel(&self, velocity: Ned, yaw: Option<f64>) -> anyhow::Result<()> {
        let mut state = self.state()?;
        ensure!(state.armed, "vehicle is not armed");

        if let Some(yaw) = yaw {
            state.yaw = (state.yaw + yaw).rem_euclid(360.0);
        }

        let heading = Rotation3::from_axis_angle(&Vector3::z_axis(), state.yaw.to_radians());
        state.velocity = heading * Vector3::new(velocity.north, velocity.east, velocity.down);
        Ok(())
    }

    async fn get_position_xyz(&self) -> anyhow::Result<LocalPosition> {
        let state = self.state()?;
        Ok(LocalPosition {
            north: state.position.x,
            east: state.position.y,
            down: state.position.z,
            attitude: Attitude::new(0.0, 0.0, state.yaw),
        })
    }

    async fn get_position_lat_lon_alt(&self) -> anyhow::Result<Pose> {
        let state = self.state()?;
        let point = self.frame.to_global(state.position.x, state.position.y);
        Ok(Pose {
            lat: point.y(),
            lon: point.x(),
            rel_alt: state.altitude(),
            attitude: Attitude::new(0.0, 0.0, state.yaw),
        })
    }

    async fn get_relative_height(&self) -> anyhow::Result<f64> {
        Ok(self.state()?.altitude())
    }

    async fn is_flying(&self) -> anyhow::Result<bool> {
        let state = self.state()?;
        Ok(state.armed && state.altitude() > 0.0)
    }

    async fn send_status(&self, text: &str) -> anyhow::Result<()> {
        info!("status: {}", text);
        match self.statuses.lock() {
            Ok(mut statuses) => statuses.push(text.to_owned()),
            Err(_) => bail!("status log is poisoned"),
        }
        Ok(())
    }
}
