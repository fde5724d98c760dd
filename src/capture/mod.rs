//! Periodic frame capture: every frame is quality-checked, segmented,
//! geolocated and journaled as one transaction.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context};
use image::RgbImage;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    camera::Camera,
    config::{LandingConfig, VisionConfig},
    geometry::{refine_height_known_box, CameraModel, LocalFrame},
    observation::{ClusterIndex, FrameRecord, Journal},
    perception::{annotate, quality, DetectedObject, GeoLocation, Perception},
    state::Pose,
    vehicle::VehicleLink,
};

/// Everything needed to turn a camera frame into a journal record.
pub struct FramePipeline {
    perception: Arc<Perception>,
    model: CameraModel,
    marker_sides: (f64, f64),
    min_altitude: f64,
    cluster_distance: f64,
    journal: Mutex<Journal>,
    camera: Arc<dyn Camera>,
    link: Arc<dyn VehicleLink>,
}

impl FramePipeline {
    pub fn new(
        vision: &VisionConfig,
        landing: &LandingConfig,
        perception: Arc<Perception>,
        camera: Arc<dyn Camera>,
        link: Arc<dyn VehicleLink>,
    ) -> anyhow::Result<Self> {
        let journal = Journal::open(&vision.journal_path)
            .with_context(|| format!("failed to open journal in {:?}", vision.journal_path))?;

        Ok(FramePipeline {
            perception,
            model: CameraModel::new(
                (vision.fov[0], vision.fov[1]),
                vision.camera_offset,
                vision.rotation_offset,
            ),
            marker_sides: (landing.marker_short_side, landing.marker_long_side),
            min_altitude: landing.min_altitude,
            cluster_distance: vision.cluster_distance,
            journal: Mutex::new(journal),
            camera,
            link,
        })
    }

    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    pub fn perception(&self) -> &Arc<Perception> {
        &self.perception
    }

    pub fn model(&self) -> &CameraModel {
        &self.model
    }

    /// Grabs the current frame and pose and journals them.
    pub async fn capture(self: &Arc<Self>) -> anyhow::Result<FrameRecord> {
        let frame = self.camera.get_current_frame().await?;
        let pose = self.link.get_position_lat_lon_alt().await?;

        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || pipeline.process(frame, pose)).await?
    }

    /// Journals one frame. The record is committed even if detection fails
    /// partway, so a frame is never half-written.
    pub fn process(&self, frame: RgbImage, pose: Pose) -> anyhow::Result<FrameRecord> {
        let quality = quality(&frame);

        let mut journal = match self.journal.lock() {
            Ok(journal) => journal,
            Err(_) => bail!("observation journal is poisoned"),
        };
        let mut txn = journal.begin(pose, &frame, quality)?;

        if !self.perception.passes_quality(quality) {
            debug!("frame {} below quality threshold ({:.1})", txn.id(), quality);
            return Ok(txn.commit()?);
        }

        if !pose.is_valid() {
            warn!("frame {} has no valid pose, skipping detection", txn.id());
            return Ok(txn.commit()?);
        }

        let mut objects = self.perception.analyze(&frame);
        self.geolocate(&mut objects, &pose, frame.dimensions());

        txn.add_computed_image(&annotate(&frame, &objects))?;
        txn.add_objects(objects);
        Ok(txn.commit()?)
    }

    fn geolocate(&self, objects: &mut [DetectedObject], pose: &Pose, size: (u32, u32)) {
        let frame = LocalFrame::new(pose.lat, pose.lon);
        let height = pose.rel_alt.max(self.min_altitude);

        for object in objects {
            let offset = if object.contour.len() == 4 {
                refine_height_known_box(
                    &self.model,
                    size,
                    &object.contour,
                    object.center,
                    pose.attitude,
                    height,
                    self.marker_sides.0,
                    self.marker_sides.1,
                )
                .map(|estimate| estimate.offset)
            } else {
                self.model.locate(object.center, size, pose.attitude, height)
            };

            match offset {
                Ok(offset) => {
                    let point = frame.to_global(offset.x, offset.y);
                    object.geolocation = Some(GeoLocation {
                        lat: point.y(),
                        lon: point.x(),
                    });
                }
                Err(err) => debug!("could not geolocate {} object: {}", object.color, err),
            }
        }
    }

    /// Rebuilds the deduplicated view of everything journaled so far.
    pub async fn deduplicate(self: &Arc<Self>) -> anyhow::Result<ClusterIndex> {
        let pipeline = self.clone();
        tokio::task::spawn_blocking(move || {
            let journal = match pipeline.journal.lock() {
                Ok(journal) => journal,
                Err(_) => bail!("observation journal is poisoned"),
            };
            Ok(journal.deduplicate(pipeline.cluster_distance)?)
        })
        .await?
    }
}

struct RunningCapture {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the capture loop. At most one loop runs at a time.
pub struct CaptureLoop {
    pipeline: Arc<FramePipeline>,
    running: tokio::sync::Mutex<Option<RunningCapture>>,
}

impl CaptureLoop {
    pub fn new(pipeline: Arc<FramePipeline>) -> Self {
        CaptureLoop {
            pipeline,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<FramePipeline> {
        &self.pipeline
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts the camera and captures `rate` frames per second until stopped
    /// or until `parent` is cancelled. A running loop is replaced.
    pub async fn start(&self, rate: f64, parent: &CancellationToken) -> anyhow::Result<()> {
        if !(rate.is_finite() && rate > 0.0) {
            bail!("invalid capture rate {}", rate);
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        self.pipeline.camera.start_camera().await?;

        let cancel = parent.child_token();
        let handle = tokio::spawn(run_loop(
            self.pipeline.clone(),
            Duration::from_secs_f64(1.0 / rate),
            cancel.clone(),
        ));

        info!("capturing at {} frames per second", rate);
        *running = Some(RunningCapture { cancel, handle });
        Ok(())
    }

    /// Stops the loop and the camera. Stopping an idle loop is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let previous = self.running.lock().await.take();

        if let Some(previous) = previous {
            previous.cancel.cancel();
            if let Err(err) = previous.handle.await {
                warn!("capture loop ended abnormally: {}", err);
            }
            self.pipeline.camera.stop_camera().await?;
            info!("capture stopped");
        }

        Ok(())
    }
}

async fn run_loop(pipeline: Arc<FramePipeline>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = tokio::time::Instant::now();

        tokio::select! {
            _ = cancel.cancelled() => break,
            res = pipeline.capture() => match res {
                Ok(record) => {
                    trace!("frame {} captured with {} objects", record.id, record.objects.len())
                }
                Err(err) => warn!("frame capture failed: {:#}", err),
            }
        }

        let elapsed = started.elapsed();
        if elapsed > period {
            warn!("frame took {:?}, over the {:?} budget", elapsed, period);
        }
    }
}
