//! Landing, optionally guided by a marker seen from the camera.

use anyhow::{bail, ensure};
use nalgebra::Vector3;

use super::{plan::LandCommand, MissionContext, MissionSettings};
use crate::{
    config::LandingConfig,
    geometry::{refine_height_fiducial, refine_height_known_box, GeometryError},
    perception::{ColorName, DetectedObject, TargetShape},
    state::{Attitude, Ned},
    util::seconds,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescentPhase {
    /// Above the decision height, looking for the marker
    Descending,

    /// Marker in view, closing the lateral offset while descending
    Correcting,

    /// Below the decision height or marker lost; no more corrections
    FinalDescent,

    Landed,
}

struct Correction {
    /// Marker displacement in the heading frame (forward, right, down)
    offset: Vector3<f64>,
    height: f64,
    yaw: Option<f64>,
}

/// Height at which corrections stop and the autopilot takes over. Readings
/// under the minimum altitude are treated as being on the ground.
fn exit_height(landing: &LandingConfig) -> f64 {
    landing.decision_height.max(landing.min_altitude)
}

/// Closed loop that steers the vehicle over a marker while descending to the
/// decision height.
pub struct VisualDescent<'a> {
    ctx: &'a MissionContext,
    settings: &'a MissionSettings,
    color: ColorName,
    shape: Option<TargetShape>,
    phase: DescentPhase,
    retries_left: u32,
}

impl<'a> VisualDescent<'a> {
    pub fn new(
        ctx: &'a MissionContext,
        settings: &'a MissionSettings,
        color: ColorName,
        shape: Option<TargetShape>,
    ) -> Self {
        VisualDescent {
            ctx,
            settings,
            color,
            shape,
            phase: DescentPhase::Descending,
            retries_left: settings.landing.max_retries.max(1),
        }
    }

    pub fn phase(&self) -> DescentPhase {
        self.phase
    }

    /// Runs until the decision height is reached or the marker is lost for
    /// good, leaving the phase at `FinalDescent`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let camera = self.ctx.capture.pipeline().camera().clone();
        let started_camera = !camera.is_active();
        if started_camera {
            camera.start_camera().await?;
        }

        let result = self.control_loop().await;
        self.phase = DescentPhase::FinalDescent;

        if started_camera {
            camera.stop_camera().await?;
        }
        result
    }

    async fn control_loop(&mut self) -> anyhow::Result<()> {
        let link = self.ctx.link.clone();
        let pipeline = self.ctx.capture.pipeline().clone();
        let landing = &self.settings.landing;

        loop {
            let measured = link.get_relative_height().await?;
            if measured <= exit_height(landing) {
                debug!("reached decision height at {:.2} m", measured);
                return Ok(());
            }
            let altitude = measured.max(landing.min_altitude);

            let frame = pipeline.camera().get_current_frame().await?;
            let pose = link.get_position_lat_lon_alt().await?;
            let size = frame.dimensions();

            let perception = pipeline.perception().clone();
            let (color, shape) = (self.color.clone(), self.shape);
            let found =
                tokio::task::spawn_blocking(move || perception.find_closest(&frame, &color, shape))
                    .await?;

            let correction = found.and_then(|object| {
                match self.correction(&object, size, pose.attitude, altitude) {
                    Ok(correction) => Some(correction),
                    Err(err) => {
                        debug!("marker unusable: {}", err);
                        None
                    }
                }
            });

            match correction {
                Some(c) => {
                    self.phase = DescentPhase::Correcting;

                    let lateral = c.offset.x.hypot(c.offset.y);
                    let descent = (1.0 / lateral).min(altitude / 2.0);
                    trace!(
                        "marker offset {:.2} m, estimated height {:.2} m, descending at {:.2} m/s",
                        lateral,
                        c.height,
                        descent
                    );

                    let gain = landing.correction_gain;
                    link.mov_by_vel(Ned::new(c.offset.x * gain, c.offset.y * gain, descent), c.yaw)
                        .await?;
                }
                None => {
                    self.retries_left -= 1;
                    warn!("{} marker not found, {} retries left", self.color, self.retries_left);

                    if self.retries_left == 0 {
                        self.ctx.status("object not found").await;
                        return Ok(());
                    }

                    link.mov_by_vel(Ned::new(0.0, 0.0, 0.0), None).await?;
                }
            }

            tokio::time::sleep(seconds(landing.control_interval)).await;
        }
    }

    /// Offsets are computed with the heading removed so they come out in the
    /// frame velocity commands are given in.
    fn correction(
        &self,
        object: &DetectedObject,
        size: (u32, u32),
        attitude: Attitude,
        altitude: f64,
    ) -> Result<Correction, GeometryError> {
        let landing = &self.settings.landing;
        let model = self.ctx.capture.pipeline().model();
        let attitude = attitude.without_yaw();

        if let Some(corners) = &object.code_corners {
            let estimate = refine_height_fiducial(
                model,
                size,
                corners,
                attitude,
                altitude,
                landing.code_side,
            )?;
            return Ok(Correction {
                offset: estimate.offset,
                height: estimate.height,
                yaw: Some(estimate.yaw_offset),
            });
        }

        if object.contour.len() == 4 {
            let estimate = refine_height_known_box(
                model,
                size,
                &object.contour,
                object.center,
                attitude,
                altitude,
                landing.marker_short_side,
                landing.marker_long_side,
            )?;
            return Ok(Correction {
                offset: estimate.offset,
                height: estimate.height,
                yaw: None,
            });
        }

        Ok(Correction {
            offset: model.locate(object.center, size, attitude, altitude)?,
            height: altitude,
            yaw: None,
        })
    }
}

/// Descends at the land speed without corrections until the decision height.
async fn plain_descent(ctx: &MissionContext, settings: &MissionSettings) -> anyhow::Result<()> {
    ensure!(settings.land_speed > 0.0, "land speed must be positive");

    ctx.link
        .mov_by_vel(Ned::new(0.0, 0.0, settings.land_speed), None)
        .await?;

    while ctx.link.get_relative_height().await? > exit_height(&settings.landing) {
        tokio::time::sleep(seconds(settings.landing.control_interval)).await;
    }
    Ok(())
}

/// Hands the last meters to the autopilot and waits until it has disarmed.
async fn final_descent(ctx: &MissionContext) -> anyhow::Result<DescentPhase> {
    ctx.status("Landing position reached, landing").await;
    ctx.link.land().await?;
    ctx.link.await_disarm().await?;
    Ok(DescentPhase::Landed)
}

pub async fn land_at(
    ctx: &MissionContext,
    settings: &MissionSettings,
    land: &LandCommand,
) -> anyhow::Result<()> {
    let link = &ctx.link;

    match (land.lat, land.lon) {
        (Some(lat), Some(lon)) => {
            if !link.is_flying().await? {
                bail!("cannot land at {:.6} {:.6}, vehicle is not flying", lat, lon);
            }
            info!("landing at {:.6} {:.6}", lat, lon);

            let height = land
                .height
                .unwrap_or(settings.flight_height)
                .max(settings.landing.min_altitude);
            link.mov_to_lat_lon_alt(lat, lon, height, land.yaw).await?;
        }
        (None, None) => {
            ctx.status("No landing position given, landing at current position")
                .await;
        }
        _ => bail!("landing position needs both lat and lon"),
    }

    let guided = match &land.color {
        Some(color) => {
            info!("looking for {} {:?} marker", color, land.shape);
            let mut descent = VisualDescent::new(ctx, settings, color.clone(), land.shape);
            match descent.run().await {
                Ok(()) => descent.phase() == DescentPhase::FinalDescent,
                Err(err) => {
                    warn!("precision descent aborted: {:#}", err);
                    false
                }
            }
        }
        None => false,
    };

    if !guided || link.get_relative_height().await? > exit_height(&settings.landing) {
        plain_descent(ctx, settings).await?;
    }

    let phase = final_descent(ctx).await?;
    debug!("landing finished in phase {:?}", phase);
    Ok(())
}
