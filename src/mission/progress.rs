use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::plan::{count, load_plan, MissionPlan, PlanError};
use crate::task::Task;

const PLAN_FILE: &str = "mission_file.json";
const PROGRESS_FILE: &str = "__mission__.json";

/// Shared view of the active mission's progress. Written by the supervisor
/// and the mission it runs; read by the persistence task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    pub completed: u32,

    /// `None` when there is no valid mission
    pub total: Option<u32>,
    pub running: bool,
}

/// On-disk recovery snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecoveryRecord {
    progress: u32,

    /// -1 when there is no valid mission
    max_progress: i64,

    /// Unix seconds
    time: f64,
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug)]
pub struct LoadedMission {
    pub plan: Option<MissionPlan>,
    pub completed: u32,
}

impl LoadedMission {
    pub fn invalid() -> Self {
        LoadedMission {
            plan: None,
            completed: 0,
        }
    }

    pub fn total(&self) -> Option<u32> {
        self.plan.as_ref().map(|p| count(&p.action))
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn write_atomic(path: &Path, data: Vec<u8>) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

/// The working plan and the recovery file. Every file operation holds the
/// store lock, so a snapshot never races the completion cleanup.
#[derive(Debug)]
pub struct MissionStore {
    dir: PathBuf,
    recovery_window: Duration,
    lock: Mutex<()>,
}

impl MissionStore {
    pub fn new(dir: impl Into<PathBuf>, recovery_window: Duration) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(MissionStore {
            dir,
            recovery_window,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn plan_path(&self) -> PathBuf {
        self.dir.join(PLAN_FILE)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.dir.join(PROGRESS_FILE)
    }

    /// Resolves `source` into the working plan and clears any previous
    /// progress. Fails closed: on error the working files are removed.
    pub async fn install(&self, source: &Path) -> Result<LoadedMission, PlanError> {
        let _guard = self.lock.lock().await;

        if let Err(err) = remove_if_exists(&self.progress_path()).await {
            warn!("failed to clear recovery file: {}", err);
        }

        let installed = async {
            let plan = load_plan(source)?;
            let data = serde_json::to_vec_pretty(&plan.to_value()?)?;
            write_atomic(&self.plan_path(), data)
                .await
                .map_err(|source| PlanError::Io {
                    path: self.plan_path(),
                    source,
                })?;
            Ok::<_, PlanError>(plan)
        }
        .await;

        match installed {
            Ok(plan) => {
                info!("installed mission from {:?} with {} actions", source, count(&plan.action));
                Ok(LoadedMission {
                    plan: Some(plan),
                    completed: 0,
                })
            }
            Err(err) => {
                warn!("rejected mission {:?}: {}", source, err);
                self.discard().await;
                Err(err)
            }
        }
    }

    /// Loads the working plan left by a previous run and restores progress
    /// if the recovery file matches it and is recent enough.
    pub async fn recover(&self) -> LoadedMission {
        let _guard = self.lock.lock().await;

        if !self.plan_path().exists() {
            return LoadedMission::invalid();
        }

        let plan = match load_plan(&self.plan_path()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("discarding unreadable working plan: {}", err);
                self.discard().await;
                return LoadedMission::invalid();
            }
        };

        let total = count(&plan.action);
        let completed = match self.read_recovery().await {
            Ok(Some(record)) => {
                let age = unix_now() - record.time;
                if record.max_progress != total as i64 {
                    warn!(
                        "recovery file is for a mission of {} actions, this one has {}",
                        record.max_progress, total
                    );
                    0
                } else if age.abs() >= self.recovery_window.as_secs_f64() {
                    info!("recovery file is {:.1}s old, starting over", age);
                    0
                } else {
                    record.progress.min(total)
                }
            }
            Ok(None) => 0,
            Err(err) => {
                warn!("discarding unreadable recovery file: {}", err);
                0
            }
        };

        if completed == 0 {
            if let Err(err) = remove_if_exists(&self.progress_path()).await {
                warn!("failed to clear recovery file: {}", err);
            }
        }

        LoadedMission {
            plan: Some(plan),
            completed,
        }
    }

    async fn read_recovery(&self) -> anyhow::Result<Option<RecoveryRecord>> {
        match tokio::fs::read(self.progress_path()).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a snapshot if a mission is running.
    pub async fn save(&self, state: ProgressState) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        self.write_snapshot(state).await
    }

    /// Snapshots the shared state under the store lock, so a mission that
    /// finished concurrently is never written back.
    pub async fn save_current(&self, progress: &watch::Receiver<ProgressState>) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let state = *progress.borrow();
        self.write_snapshot(state).await
    }

    async fn write_snapshot(&self, state: ProgressState) -> io::Result<()> {
        let total = match (state.running, state.total) {
            (true, Some(total)) => total,
            _ => return Ok(()),
        };

        let record = RecoveryRecord {
            progress: state.completed,
            max_progress: total as i64,
            time: unix_now(),
        };
        write_atomic(&self.progress_path(), serde_json::to_vec(&record)?).await
    }

    /// Clears the running flag and removes both files.
    pub async fn finish(&self, progress: &watch::Sender<ProgressState>) {
        let _guard = self.lock.lock().await;
        progress.send_modify(|state| state.running = false);
        self.discard().await;
    }

    async fn discard(&self) {
        for path in [self.plan_path(), self.progress_path()] {
            if let Err(err) = remove_if_exists(&path).await {
                warn!("failed to remove {:?}: {}", path, err);
            }
        }
    }
}

/// Snapshots progress at a fixed interval while a mission is running.
pub struct PersistenceTask {
    store: std::sync::Arc<MissionStore>,
    progress: watch::Receiver<ProgressState>,
    interval: Duration,
}

pub fn create_task(
    store: std::sync::Arc<MissionStore>,
    progress: watch::Receiver<ProgressState>,
    interval: Duration,
) -> PersistenceTask {
    PersistenceTask {
        store,
        progress,
        interval: interval.max(Duration::from_millis(1)),
    }
}

#[async_trait]
impl Task for PersistenceTask {
    fn name(&self) -> &'static str {
        "mission/progress"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.store.save_current(&self.progress).await {
                        warn!("failed to persist progress: {}", err);
                    }
                }
            }
        }

        Ok(())
    }
}
