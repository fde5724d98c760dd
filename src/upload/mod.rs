//! HTTP endpoint for uploading a new mission plan.

use std::{
    convert::Infallible,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use warp::{
    http::StatusCode,
    reply::{self, Reply, Response},
    Filter,
};

use crate::{
    config::UploadConfig,
    mission::{PlanError, ProgressState, SupervisorRequest},
    task::{ChannelCommandSink, CommandSink, Task},
};

const MAX_PLAN_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
struct ServerState {
    uploads: Arc<PathBuf>,
    sequence: Arc<AtomicUsize>,
    cmd_tx: ChannelCommandSink<SupervisorRequest, ProgressState>,
}

pub struct UploadTask {
    address: SocketAddr,
    state: ServerState,
}

/// Uploaded plans are kept under `storage_path/uploads` so that relative
/// `src` includes resolve against that directory.
pub fn create_task(
    config: &UploadConfig,
    storage_path: &Path,
    cmd_tx: ChannelCommandSink<SupervisorRequest, ProgressState>,
) -> anyhow::Result<UploadTask> {
    let uploads = storage_path.join("uploads");
    std::fs::create_dir_all(&uploads).with_context(|| format!("failed to create {:?}", uploads))?;

    Ok(UploadTask {
        address: config.address,
        state: ServerState {
            uploads: Arc::new(uploads),
            sequence: Arc::new(AtomicUsize::new(0)),
            cmd_tx,
        },
    })
}

#[async_trait]
impl Task for UploadTask {
    fn name(&self) -> &'static str {
        "upload"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self { address, state } = *self;

        let (address, server) = warp::serve(routes(state))
            .try_bind_with_graceful_shutdown(address, async move { cancel.cancelled().await })
            .context("failed to bind upload server")?;

        info!("accepting missions at http://{}/mission", address);
        server.await;
        Ok(())
    }
}

fn with_state(
    state: ServerState,
) -> impl Filter<Extract = (ServerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn routes(
    state: ServerState,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let upload = warp::path!("mission")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_PLAN_BYTES))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(upload_mission);

    let status = warp::path!("mission")
        .and(warp::get())
        .and(with_state(state))
        .and_then(mission_status);

    upload.or(status).unify()
}

fn error_response(status: StatusCode, message: String) -> Response {
    reply::with_status(message, status).into_response()
}

// stores the uploaded plan and asks the supervisor to replace the running mission with it
async fn upload_mission(body: Bytes, state: ServerState) -> Result<Response, Infallible> {
    debug!("hit mission upload endpoint with {} bytes", body.len());

    if let Err(err) = serde_json::from_slice::<serde_json::Value>(&body) {
        return Ok(error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", err)));
    }

    let sequence = state.sequence.fetch_add(1, Ordering::Relaxed);
    let path = state.uploads.join(format!(
        "mission_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S%.3f"),
        sequence
    ));

    if let Err(err) = tokio::fs::write(&path, &body).await {
        return Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to store mission: {}", err),
        ));
    }

    let response = match state.cmd_tx.command(SupervisorRequest::Replace(path)).await {
        Ok(progress) => reply::json(&progress).into_response(),
        Err(err) => match err.downcast_ref::<PlanError>() {
            Some(plan_err) => {
                error_response(StatusCode::UNPROCESSABLE_ENTITY, plan_err.to_string())
            }
            None => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)),
        },
    };

    Ok(response)
}

async fn mission_status(state: ServerState) -> Result<Response, Infallible> {
    let response = match state.cmd_tx.command(SupervisorRequest::Status).await {
        Ok(progress) => reply::json(&progress).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err)),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::mission::{supervisor, tests::harness};

    #[tokio::test(start_paused = true)]
    async fn uploads_replace_the_mission() {
        let h = harness().await;
        let task = supervisor::create_task(h.ctx.clone(), None);
        let cmd_tx = task.cmd();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Box::new(task).run(cancel.clone()));

        let upload = create_task(
            &UploadConfig {
                address: ([127, 0, 0, 1], 0).into(),
            },
            h.mission_dir(),
            cmd_tx,
        )
        .unwrap();
        let filter = routes(upload.state);

        let res = warp::test::request()
            .method("POST")
            .path("/mission")
            .body(json!({"action": "delay", "commands": {"time": 30}}).to_string())
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let progress: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(progress["total"], 1);
        assert_eq!(progress["running"], true);

        let stored = std::fs::read_dir(h.mission_dir().join("uploads")).unwrap().count();
        assert_eq!(stored, 1);

        let res = warp::test::request()
            .method("POST")
            .path("/mission")
            .body("{\"action\": ")
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("POST")
            .path("/mission")
            .body(json!({"action": "teleport"}).to_string())
            .reply(&filter)
            .await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let res = warp::test::request().path("/mission").reply(&filter).await;
        assert_eq!(res.status(), StatusCode::OK);
        let progress: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(progress["total"], Value::Null);
        assert_eq!(progress["running"], false);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
