use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    plan::{resume_subplan, PlanError, Resumed},
    progress::{LoadedMission, ProgressState},
    runner::{complete, MissionRunner},
    MissionContext,
};
use crate::task::{reply, ChannelCommandSink, ChannelCommandSource, Task};

#[derive(Debug, Clone)]
pub enum SupervisorRequest {
    /// Cancel the active mission and start the plan at this path
    Replace(PathBuf),

    Status,
}

struct ActiveMission {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the single active mission task.
pub struct Supervisor {
    ctx: Arc<MissionContext>,
    cancel: CancellationToken,
    active: Option<ActiveMission>,
}

impl Supervisor {
    pub fn new(ctx: Arc<MissionContext>, cancel: CancellationToken) -> Self {
        Supervisor {
            ctx,
            cancel,
            active: None,
        }
    }

    /// Resumes the working plan left by a previous run, if any.
    pub async fn recover(&mut self) -> ProgressState {
        self.cancel_active().await;
        let loaded = self.ctx.store.recover().await;
        self.launch(loaded).await
    }

    /// Replaces the active mission. The old mission and the capture loop are
    /// fully stopped before the new plan is loaded. A plan that fails to
    /// load leaves no mission running.
    pub async fn replace_mission(&mut self, source: &Path) -> Result<ProgressState, PlanError> {
        info!("replacing mission with {:?}", source);
        self.cancel_active().await;

        match self.ctx.store.install(source).await {
            Ok(loaded) => Ok(self.launch(loaded).await),
            Err(err) => {
                self.launch(LoadedMission::invalid()).await;
                Err(err)
            }
        }
    }

    pub async fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(err) = active.handle.await {
                error!("mission task ended abnormally: {}", err);
            }
        }

        if let Err(err) = self.ctx.capture.stop().await {
            warn!("failed to stop capture: {:#}", err);
        }

        // a cancelled landing or visit leaves the camera it started running
        let camera = self.ctx.capture.pipeline().camera();
        if camera.is_active() {
            if let Err(err) = camera.stop_camera().await {
                warn!("failed to stop camera: {:#}", err);
            }
        }

        self.ctx.progress.send_modify(|state| state.running = false);
    }

    async fn launch(&mut self, loaded: LoadedMission) -> ProgressState {
        let total = loaded.total();

        let plan = match loaded.plan {
            Some(plan) => plan,
            None => {
                self.ctx.progress.send_modify(|state| *state = ProgressState::default());
                self.ctx.status("No Valid Mission").await;
                return *self.ctx.progress.borrow();
            }
        };

        self.ctx.progress.send_modify(|state| {
            *state = ProgressState {
                completed: loaded.completed,
                total,
                running: true,
            }
        });
        self.ctx
            .status(&format!("Starting with Progress: {}", loaded.completed))
            .await;

        match resume_subplan(&plan.action, loaded.completed) {
            Resumed::Plan(remaining) => {
                let cancel = self.cancel.child_token();
                let runner =
                    MissionRunner::new(self.ctx.clone(), &plan, loaded.completed, cancel.clone());

                let token = cancel.clone();
                let handle = tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => debug!("mission cancelled"),
                        _ = runner.run(remaining) => debug!("mission finished"),
                    }
                });

                self.active = Some(ActiveMission { cancel, handle });
            }
            Resumed::Remainder(_) => {
                info!("mission has nothing left to do");
                complete(&self.ctx).await;
            }
        }

        *self.ctx.progress.borrow()
    }

    /// Waits for the active mission to run to completion.
    pub async fn join(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.handle.await {
                error!("mission task ended abnormally: {}", err);
            }
        }
    }
}

pub struct SupervisorTask {
    ctx: Arc<MissionContext>,
    initial: Option<PathBuf>,
    cmd_tx: ChannelCommandSink<SupervisorRequest, ProgressState>,
    cmd_rx: ChannelCommandSource<SupervisorRequest, ProgressState>,
}

/// `initial` replaces the working plan at startup; without it the previous
/// run's plan is recovered.
pub fn create_task(ctx: Arc<MissionContext>, initial: Option<PathBuf>) -> SupervisorTask {
    let (cmd_tx, cmd_rx) = crate::task::command_channel(16);

    SupervisorTask {
        ctx,
        initial,
        cmd_tx,
        cmd_rx,
    }
}

impl SupervisorTask {
    pub fn cmd(&self) -> ChannelCommandSink<SupervisorRequest, ProgressState> {
        self.cmd_tx.clone()
    }
}

#[async_trait]
impl Task for SupervisorTask {
    fn name(&self) -> &'static str {
        "mission/supervisor"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut supervisor = Supervisor::new(self.ctx.clone(), cancel.clone());

        self.ctx.status("Mission Computer Started").await;

        match &self.initial {
            Some(path) => {
                if let Err(err) = supervisor.replace_mission(path).await {
                    error!("startup mission {:?} is invalid: {}", path, err);
                }
            }
            None => {
                supervisor.recover().await;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                req = self.cmd_rx.recv_async() => {
                    let (req, ret_tx) = match req {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    };

                    let result = match req {
                        SupervisorRequest::Replace(path) => {
                            supervisor.replace_mission(&path).await.map_err(Into::into)
                        }
                        SupervisorRequest::Status => Ok(*self.ctx.progress.borrow()),
                    };

                    reply(ret_tx, result);
                }
            }
        }

        supervisor.cancel_active().await;
        Ok(())
    }
}
