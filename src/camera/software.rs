use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{bail, ensure, Context};
use async_trait::async_trait;
use image::{Rgb, RgbImage};

use super::Camera;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

#[derive(Debug)]
pub struct DirectoryCamera {
    dir: PathBuf,
    files: Mutex<Vec<PathBuf>>,
    cursor: AtomicUsize,
    active: AtomicBool,
}

impl DirectoryCamera {
    pub fn new(dir: PathBuf) -> Self {
        DirectoryCamera {
            dir,
            files: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    fn scan(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {:?}", self.dir))?;
        for entry in entries {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl Camera for DirectoryCamera {
    async fn start_camera(&self) -> anyhow::Result<()> {
        let files = self.scan()?;
        ensure!(!files.is_empty(), "no images found in {:?}", self.dir);
        debug!("replaying {} images from {:?}", files.len(), self.dir);

        match self.files.lock() {
            Ok(mut slot) => *slot = files,
            Err(_) => bail!("camera file list is poisoned"),
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_camera(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_current_frame(&self) -> anyhow::Result<RgbImage> {
        ensure!(self.is_active(), "camera is not active");

        let path = match self.files.lock() {
            Ok(files) if !files.is_empty() => {
                let i = self.cursor.fetch_add(1, Ordering::SeqCst) % files.len();
                files[i].clone()
            }
            Ok(_) => bail!("no images to replay"),
            Err(_) => bail!("camera file list is poisoned"),
        };

        let image = tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8()))
            .await?
            .context("failed to decode frame")?;
        Ok(image)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Returns the same frame until it is replaced.
#[derive(Debug)]
pub struct StaticCamera {
    frame: Mutex<RgbImage>,
    active: AtomicBool,
}

impl StaticCamera {
    pub fn new(frame: RgbImage) -> Self {
        StaticCamera {
            frame: Mutex::new(frame),
            active: AtomicBool::new(false),
        }
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbImage::from_pixel(width, height, Rgb([128, 128, 128])))
    }

    pub fn set_frame(&self, frame: RgbImage) {
        if let Ok(mut slot) = self.frame.lock() {
            *slot = frame;
        }
    }
}

#[async_trait]
impl Camera for StaticCamera {
    async fn start_camera(&self) -> anyhow::Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_camera(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_current_frame(&self) -> anyhow::Result<RgbImage> {
        ensure!(self.is_active(), "camera is not active");
        match self.frame.lock() {
            Ok(frame) => Ok(frame.clone()),
            Err(_) => bail!("camera frame is poisoned"),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn directory_camera_loops_over_images() {
        let dir = TempDir::new().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 0, 0])).save(dir.path().join("a.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 0, 0])).save(dir.path().join("b.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let camera = DirectoryCamera::new(dir.path().to_owned());
        assert!(camera.get_current_frame().await.is_err());

        camera.start_camera().await.unwrap();
        let frames = (0..3).map(|_| camera.get_current_frame());
        let reds: Vec<u8> = futures::future::try_join_all(frames)
            .await
            .unwrap()
            .iter()
            .map(|f| f.get_pixel(0, 0)[0])
            .collect();
        assert_eq!(reds, vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn empty_directory_fails_to_start() {
        let dir = TempDir::new().unwrap();
        let camera = DirectoryCamera::new(dir.path().to_owned());
        assert!(camera.start_camera().await.is_err());
        assert!(!camera.is_active());
    }

    #[tokio::test]
    async fn static_camera_serves_replaced_frame() {
        let camera = StaticCamera::blank(8, 6);
        camera.start_camera().await.unwrap();
        assert_eq!(camera.get_current_frame().await.unwrap().dimensions(), (8, 6));

        camera.set_frame(RgbImage::new(2, 2));
        assert_eq!(camera.get_current_frame().await.unwrap().dimensions(), (2, 2));

        camera.stop_camera().await.unwrap();
        assert!(camera.get_current_frame().await.is_err());
    }
}
