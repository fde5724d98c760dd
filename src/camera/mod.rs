//! Frame sources for the perception pipeline.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use image::RgbImage;
use serde::Deserialize;

mod software;

pub use software::{DirectoryCamera, StaticCamera};

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CameraKind {
    /// Replays the images in a directory in file name order, looping.
    Directory { path: PathBuf },

    /// Produces a blank frame of the given size.
    Synthetic { width: u32, height: u32 },
}

#[async_trait]
pub trait Camera: Send + Sync {
    async fn start_camera(&self) -> anyhow::Result<()>;

    async fn stop_camera(&self) -> anyhow::Result<()>;

    /// Fails while the camera is stopped.
    async fn get_current_frame(&self) -> anyhow::Result<RgbImage>;

    fn is_active(&self) -> bool;
}

pub fn create_camera(kind: &CameraKind) -> anyhow::Result<Arc<dyn Camera>> {
    Ok(match kind {
        CameraKind::Directory { path } => Arc::new(DirectoryCamera::new(path.clone())),
        CameraKind::Synthetic { width, height } => Arc::new(StaticCamera::blank(*width, *height)),
    })
}
