use std::{sync::Arc, time::Duration};

use anyhow::bail;
use futures::{future::BoxFuture, FutureExt};
use geo::Point;
use tokio_util::sync::CancellationToken;

use super::{
    landing,
    plan::{count, Action, LocalMove, MissionPlan, VisitCommand, Waypoint},
    MissionContext, MissionSettings,
};
use crate::{geometry::LocalFrame, state::Ned, util::seconds};

const FOREVER_IDLE: Duration = Duration::from_secs(2);

/// Orders `targets` by repeatedly flying to the one with the smallest
/// Manhattan distance (in meters) from the current position.
pub fn plan_route(start: Point<f64>, mut targets: Vec<Point<f64>>) -> Vec<Point<f64>> {
    let frame = LocalFrame::new(start.y(), start.x());
    let mut here = (0.0, 0.0);
    let mut route = Vec::with_capacity(targets.len());

    while !targets.is_empty() {
        let distance = |p: &Point<f64>| {
            let (n, e) = frame.to_local(*p);
            (n - here.0).abs() + (e - here.1).abs()
        };

        let nearest = targets
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| distance(a).total_cmp(&distance(b)))
            .map(|(i, _)| i);

        match nearest {
            Some(i) => {
                let next = targets.remove(i);
                here = frame.to_local(next);
                route.push(next);
            }
            None => break,
        }
    }

    route
}

/// Executes one mission's action tree in order. Every leaf and every
/// waypoint of a multi-waypoint move advances progress by one, whether it
/// succeeded or not.
pub struct MissionRunner {
    ctx: Arc<MissionContext>,
    settings: MissionSettings,
    completed: u32,
    total: u32,
    cancel: CancellationToken,
}

impl MissionRunner {
    /// `cancel` is the mission's own token; the capture loop it starts is
    /// tied to it.
    pub fn new(
        ctx: Arc<MissionContext>,
        plan: &MissionPlan,
        completed: u32,
        cancel: CancellationToken,
    ) -> Self {
        let settings = ctx.defaults.with_parameters(&plan.parameter);
        MissionRunner {
            settings,
            completed,
            total: count(&plan.action),
            cancel,
            ctx,
        }
    }

    pub async fn run(mut self, remaining: Action) {
        debug!("running mission at {}/{}", self.completed, self.total);
        self.execute(&remaining).await;
    }

    fn execute<'a>(&'a mut self, action: &'a Action) -> BoxFuture<'a, ()> {
        async move {
            match action {
                Action::List(children) => {
                    for child in children {
                        self.execute(child).await;
                    }
                }
                Action::MoveMultiple(targets) => {
                    for target in targets {
                        let result = self.move_to(target).await;
                        self.finish("mov", result).await;
                    }
                }
                leaf => {
                    let result = self.dispatch(leaf).await;
                    self.finish(leaf.tag(), result).await;
                }
            }
        }
        .boxed()
    }

    async fn finish(&mut self, tag: &str, result: anyhow::Result<()>) {
        if let Err(err) = result {
            error!(
                completed = self.completed,
                total = self.total,
                "action {} failed: {:#}",
                tag,
                err
            );
            self.ctx.status(&format!("Action {} failed", tag)).await;
        }

        self.completed += 1;
        let completed = self.completed;
        self.ctx.progress.send_modify(|state| state.completed = completed);

        if self.completed >= self.total {
            complete(&self.ctx).await;
        }
    }

    async fn dispatch(&mut self, action: &Action) -> anyhow::Result<()> {
        let link = &self.ctx.link;

        match action {
            Action::MoveTo(target) => self.move_to(target).await,
            Action::MoveLocal(LocalMove::Offset { north, east, down, yaw }) => {
                link.mov_by_xyz(Ned::new(*north, *east, *down), *yaw).await
            }
            Action::MoveLocal(LocalMove::Position { north, east, down, yaw }) => {
                link.mov_to_xyz(Ned::new(*north, *east, *down), *yaw).await
            }
            Action::Takeoff(takeoff) => {
                let height = takeoff.height.unwrap_or(self.settings.flight_height);
                self.ctx.status(&format!("Taking off to {:.1} m", height)).await;
                link.start(height).await
            }
            Action::LandAt(land) => landing::land_at(&self.ctx, &self.settings, land).await,
            Action::Delay(delay) => {
                debug!("waiting {}s", delay.time);
                tokio::time::sleep(seconds(delay.time)).await;
                Ok(())
            }
            Action::StartCamera(camera) => {
                let rate = camera.ips.unwrap_or(self.settings.default_rate);
                self.ctx.capture.start(rate, &self.cancel).await
            }
            Action::StopCamera => {
                self.ctx.capture.stop().await?;
                self.ctx.capture.pipeline().deduplicate().await?;
                Ok(())
            }
            Action::Forever => {
                info!("idling until the mission is replaced");
                loop {
                    tokio::time::sleep(FOREVER_IDLE).await;
                }
            }
            Action::VisitDetectedObjects(visit) => self.visit_detected_objects(visit).await,
            Action::List(_) | Action::MoveMultiple(_) => {
                bail!("{} is not a leaf action", action.tag())
            }
        }
    }

    /// Flies to a waypoint, taking off first if the vehicle is on the ground.
    async fn move_to(&self, target: &Waypoint) -> anyhow::Result<()> {
        let link = &self.ctx.link;
        let height = target
            .height
            .unwrap_or(self.settings.flight_height)
            .max(self.settings.landing.min_altitude);

        self.ctx
            .status(&format!("Moving to {:.6} {:.6}", target.lat, target.lon))
            .await;

        if !link.is_flying().await? {
            link.start(height).await?;
        }

        link.mov_to_lat_lon_alt(target.lat, target.lon, height, target.yaw).await
    }

    async fn visit_detected_objects(&self, visit: &VisitCommand) -> anyhow::Result<()> {
        let pipeline = self.ctx.capture.pipeline();
        let clusters = pipeline.deduplicate().await?;

        let targets: Vec<Point<f64>> = clusters
            .values()
            .flat_map(|shapes| shapes.values())
            .flatten()
            .map(|cluster| cluster.point())
            .collect();

        let pose = self.ctx.link.get_position_lat_lon_alt().await?;
        let route = plan_route(pose.point(), targets);
        self.ctx.status(&format!("Visiting {} objects", route.len())).await;

        let camera = pipeline.camera();
        let started_camera = !camera.is_active();
        if started_camera {
            camera.start_camera().await?;
        }

        let result = self.photograph_route(&route, visit).await;

        if started_camera {
            camera.stop_camera().await?;
        }
        result
    }

    async fn photograph_route(
        &self,
        route: &[Point<f64>],
        visit: &VisitCommand,
    ) -> anyhow::Result<()> {
        let pipeline = self.ctx.capture.pipeline();

        for (i, target) in route.iter().enumerate() {
            info!("moving to object {}/{}", i + 1, route.len());
            self.move_to(&Waypoint {
                lat: target.y(),
                lon: target.x(),
                height: visit.height,
                yaw: None,
            })
            .await?;

            tokio::time::sleep(seconds(visit.delay)).await;

            if let Err(err) = pipeline.capture().await {
                warn!("photo at object {} failed: {:#}", i + 1, err);
            }
        }

        Ok(())
    }
}

/// Reports completion and removes the working plan and recovery file.
pub async fn complete(ctx: &MissionContext) {
    ctx.status("Mission Completed").await;
    ctx.store.finish(&ctx.progress).await;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        camera::Camera,
        mission::{tests::harness, ProgressState, Resumed},
        vehicle::VehicleLink,
    };

    #[test]
    fn route_visits_nearest_first() {
        let frame = LocalFrame::new(48.0, 11.0);
        let far = frame.to_global(100.0, 0.0);
        let near = frame.to_global(10.0, 0.0);
        let middle = frame.to_global(50.0, 5.0);

        let route = plan_route(frame.origin(), vec![far, near, middle]);
        assert_eq!(route, vec![near, middle, far]);
    }

    async fn run_plan(
        h: &crate::mission::tests::Harness,
        plan: serde_json::Value,
    ) -> ProgressState {
        let path = h.write_plan("plan.json", plan);
        let loaded = h.ctx.store.install(&path).await.unwrap();
        let plan = loaded.plan.unwrap();
        let total = count(&plan.action);

        h.ctx.progress.send_modify(|s| {
            *s = ProgressState {
                completed: 0,
                total: Some(total),
                running: true,
            }
        });

        let remaining = match crate::mission::resume_subplan(&plan.action, 0) {
            Resumed::Plan(action) => action,
            Resumed::Remainder(_) => panic!("empty plan"),
        };
        MissionRunner::new(h.ctx.clone(), &plan, 0, CancellationToken::new())
            .run(remaining)
            .await;

        *h.ctx.progress.borrow()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_actions_are_counted_and_skipped() {
        let h = harness().await;

        let state = run_plan(
            &h,
            json!({
                "action": "list",
                "commands": [
                    {"action": "land_at", "commands": {"lat": 48.0}},
                    {"action": "delay", "commands": {"time": 0.5}},
                    {"action": "takeoff", "commands": {"height": 4}}
                ]
            }),
        )
        .await;

        assert_eq!(state.completed, 3);
        assert!(!state.running);
        assert_eq!(h.vehicle.get_relative_height().await.unwrap(), 4.0);

        let statuses = h.vehicle.statuses();
        assert!(statuses.contains(&"Action land_at failed".to_owned()), "{:?}", statuses);
        assert_eq!(statuses.last().map(String::as_str), Some("Mission Completed"));
        assert!(!h.ctx.store.plan_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn move_takes_off_with_plan_height() {
        let h = harness().await;

        run_plan(
            &h,
            json!({
                "parameter": {"height": 9},
                "action": "mov",
                "commands": {"lat": 48.0001, "lon": 11.0}
            }),
        )
        .await;

        let pose = h.vehicle.get_position_lat_lon_alt().await.unwrap();
        assert_eq!(pose.rel_alt, 9.0);
        assert!((pose.lat - 48.0001).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_visit_turns_the_camera_off() {
        let h = harness().await;
        let pipeline = h.ctx.capture.pipeline().clone();
        h.vehicle.start(10.0).await.unwrap();

        h.camera.start_camera().await.unwrap();
        pipeline.capture().await.unwrap();
        h.camera.stop_camera().await.unwrap();

        let plan = MissionPlan {
            action: Action::Forever,
            parameter: Default::default(),
        };
        let runner = MissionRunner::new(h.ctx.clone(), &plan, 0, CancellationToken::new());

        // an unreachable height makes the first move fail
        let visit = VisitCommand {
            height: Some(f64::INFINITY),
            delay: 0.0,
        };
        assert!(runner.visit_detected_objects(&visit).await.is_err());
        assert!(!h.camera.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn camera_actions_capture_and_visit_objects() {
        let h = harness().await;
        h.vehicle.connect().await.unwrap();

        run_plan(
            &h,
            json!({
                "action": "list",
                "commands": [
                    {"action": "takeoff", "commands": {"height": 10}},
                    {"action": "start_camera", "commands": {"ips": 4}},
                    {"action": "delay", "commands": {"time": 1}},
                    {"action": "stop_camera"},
                    {"action": "mov_to_objects_cap_pic", "commands": {"height": 6, "delay": 0.2}}
                ]
            }),
        )
        .await;

        assert!(!h.ctx.capture.is_running().await);
        assert!(!h.camera.is_active());

        let journal = h.dir.path().join("observations");
        assert!(journal.join("__data_filtered__.json").exists());

        let statuses = h.vehicle.statuses();
        assert!(statuses.contains(&"Visiting 2 objects".to_owned()), "{:?}", statuses);
        assert_eq!(h.vehicle.get_relative_height().await.unwrap(), 6.0);
    }
}
