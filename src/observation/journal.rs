use std::{
    fs, io,
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{perception::DetectedObject, state::Pose};

const JOURNAL_FILE: &str = "__data__.json";
const FILTERED_FILE: &str = "__data_filtered__.json";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("journal encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = core::result::Result<T, JournalError>;

/// One captured frame. Image paths are relative to the journal directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub pose: Pose,
    pub quality: f64,
    pub raw_image: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_image: Option<PathBuf>,

    #[serde(default)]
    pub objects: Vec<DetectedObject>,
}

/// Append-only newline-delimited JSON log of frame records, plus the images
/// they reference.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    next_id: u64,
}

impl Journal {
    /// Opens (or creates) the journal in `dir`, continuing frame ids after the
    /// last stored record.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut journal = Journal { dir, next_id: 0 };
        journal.next_id = journal
            .load()?
            .iter()
            .map(|r| r.id + 1)
            .max()
            .unwrap_or(0);

        Ok(journal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    pub fn filtered_path(&self) -> PathBuf {
        self.dir.join(FILTERED_FILE)
    }

    /// Reads every record. Blank lines and a torn trailing line from an
    /// interrupted write are skipped.
    pub fn load(&self) -> Result<Vec<FrameRecord>> {
        let file = match fs::File::open(self.path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (n, line) in io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping unreadable journal line {}: {}", n + 1, err),
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &FrameRecord) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Starts a record for a new frame, storing the raw image right away. The
    /// record is appended when the transaction is committed or dropped.
    pub fn begin(
        &mut self,
        pose: Pose,
        frame: &RgbImage,
        quality: f64,
    ) -> Result<FrameTransaction<'_>> {
        let id = self.next_id;
        let raw_image = PathBuf::from(format!("raw_image_{}.png", id));
        frame.save(self.dir.join(&raw_image))?;
        self.next_id += 1;

        Ok(FrameTransaction {
            record: FrameRecord {
                id,
                time: Utc::now(),
                pose,
                quality,
                raw_image,
                computed_image: None,
                objects: Vec::new(),
            },
            committed: false,
            journal: self,
        })
    }

    /// Replaces the filtered-results file as a whole.
    pub fn write_filtered<T: Serialize>(&self, value: &T) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", FILTERED_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(tmp, self.filtered_path())?;
        Ok(())
    }
}

pub struct FrameTransaction<'a> {
    journal: &'a mut Journal,
    record: FrameRecord,
    committed: bool,
}

impl FrameTransaction<'_> {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn record(&self) -> &FrameRecord {
        &self.record
    }

    pub fn add_objects(&mut self, objects: Vec<DetectedObject>) {
        self.record.objects.extend(objects);
    }

    pub fn add_computed_image(&mut self, image: &RgbImage) -> Result<()> {
        let name = PathBuf::from(format!("computed_image_{}.png", self.record.id));
        image.save(self.journal.dir.join(&name))?;
        self.record.computed_image = Some(name);
        Ok(())
    }

    pub fn commit(mut self) -> Result<FrameRecord> {
        self.committed = true;
        self.journal.append(&self.record)?;
        Ok(self.record.clone())
    }
}

impl Drop for FrameTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        debug!("committing frame {} on early exit", self.record.id);
        if let Err(err) = self.journal.append(&self.record) {
            warn!("failed to commit frame {}: {}", self.record.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::state::Attitude;

    fn pose() -> Pose {
        Pose {
            lat: 48.0,
            lon: 11.0,
            rel_alt: 10.0,
            attitude: Attitude::default(),
        }
    }

    #[test]
    fn commit_appends_and_reopen_continues_ids() {
        let dir = TempDir::new().unwrap();
        let frame = RgbImage::new(8, 8);

        {
            let mut journal = Journal::open(dir.path()).unwrap();
            let txn = journal.begin(pose(), &frame, 12.0).unwrap();
            assert_eq!(txn.id(), 0);
            txn.commit().unwrap();
            journal.begin(pose(), &frame, 13.0).unwrap().commit().unwrap();
        }

        let mut journal = Journal::open(dir.path()).unwrap();
        let records = journal.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].quality, 13.0);
        assert!(dir.path().join(&records[0].raw_image).exists());

        let txn = journal.begin(pose(), &frame, 1.0).unwrap();
        assert_eq!(txn.id(), 2);
    }

    #[test]
    fn dropped_transaction_still_commits() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();

        let outcome: std::result::Result<(), &str> = (|| {
            let _txn = journal.begin(pose(), &RgbImage::new(4, 4), 0.5).map_err(|_| "begin")?;
            Err("detection blew up")
        })();
        assert!(outcome.is_err());

        let records = journal.load().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].objects.is_empty());
        assert_eq!(records[0].pose, pose());
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut journal = Journal::open(dir.path()).unwrap();
        journal.begin(pose(), &RgbImage::new(4, 4), 0.5).unwrap().commit().unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(journal.path()).unwrap();
        file.write_all(b"\n{\"id\": 7, \"ti").unwrap();

        let journal = Journal::open(dir.path()).unwrap();
        assert_eq!(journal.load().unwrap().len(), 1);
    }
}
