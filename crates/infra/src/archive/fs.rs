//! Filesystem vault emulating a delayed-retrieval archive service.
//!
//! Layout: `<root>/archives/<archive_id>` holds payloads and
//! `<root>/retrievals/<retrieval_id>.json` holds retrieval jobs.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gas_core::{ArchiveId, RetrievalId};

use super::{ArchiveError, ColdArchive, RetrievalStatus, new_archive_id, new_retrieval_id};

#[derive(Debug, Serialize, Deserialize)]
struct RetrievalJob {
    archive_id: ArchiveId,
    ready_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
    retrieval_delay: Duration,
}

fn io(path: &Path, err: std::io::Error) -> ArchiveError {
    ArchiveError::Io(format!("{}: {err}", path.display()))
}

fn remove_if_present(path: &Path) -> Result<(), ArchiveError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io(path, e)),
    }
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>, retrieval_delay: Duration) -> Self {
        Self {
            root: root.into(),
            retrieval_delay,
        }
    }

    fn archive_path(&self, archive_id: &ArchiveId) -> PathBuf {
        self.root.join("archives").join(archive_id.as_str())
    }

    fn retrieval_path(&self, retrieval_id: &RetrievalId) -> PathBuf {
        self.root
            .join("retrievals")
            .join(format!("{}.json", retrieval_id.as_str()))
    }

    /// Drop every retrieval job that points at `archive_id`. Unreadable job
    /// files are left for inspection.
    fn remove_retrievals_of(&self, archive_id: &ArchiveId) -> Result<(), ArchiveError> {
        let dir = self.root.join("retrievals");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io(&dir, e)),
        };

        for entry in entries {
            let path = entry.map_err(|e| io(&dir, e))?.path();
            let Ok(raw) = fs::read(&path) else { continue };
            let Ok(job) = serde_json::from_slice::<RetrievalJob>(&raw) else { continue };
            if &job.archive_id == archive_id {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }

    fn write(path: &Path, data: &[u8]) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
        }
        fs::write(path, data).map_err(|e| io(path, e))
    }
}

impl ColdArchive for FsArchive {
    fn upload(&self, data: &[u8]) -> Result<ArchiveId, ArchiveError> {
        let archive_id = new_archive_id()?;
        Self::write(&self.archive_path(&archive_id), data)?;
        Ok(archive_id)
    }

    fn initiate_retrieval(&self, archive_id: &ArchiveId) -> Result<RetrievalId, ArchiveError> {
        if !self.archive_path(archive_id).is_file() {
            return Err(ArchiveError::NotFound(archive_id.clone()));
        }

        let delay = chrono::Duration::from_std(self.retrieval_delay)
            .map_err(|e| ArchiveError::Io(format!("retrieval delay out of range: {e}")))?;
        let job = RetrievalJob {
            archive_id: archive_id.clone(),
            ready_at: Utc::now() + delay,
        };
        let body = serde_json::to_vec(&job).map_err(|e| ArchiveError::Io(e.to_string()))?;

        let retrieval_id = new_retrieval_id()?;
        Self::write(&self.retrieval_path(&retrieval_id), &body)?;
        Ok(retrieval_id)
    }

    fn retrieval_status(&self, retrieval_id: &RetrievalId) -> Result<RetrievalStatus, ArchiveError> {
        let path = self.retrieval_path(retrieval_id);
        let raw = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ArchiveError::UnknownRetrieval(retrieval_id.clone()),
            _ => io(&path, e),
        })?;
        let job: RetrievalJob = serde_json::from_slice(&raw).map_err(|e| ArchiveError::Io(e.to_string()))?;

        if Utc::now() < job.ready_at {
            return Ok(RetrievalStatus::InProgress);
        }

        let archive = self.archive_path(&job.archive_id);
        match fs::read(&archive) {
            Ok(data) => Ok(RetrievalStatus::Ready(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArchiveError::NotFound(job.archive_id)),
            Err(e) => Err(io(&archive, e)),
        }
    }

    fn delete(&self, archive_id: &ArchiveId) -> Result<(), ArchiveError> {
        let path = self.archive_path(archive_id);
        remove_if_present(&path)?;
        self.remove_retrievals_of(archive_id)
    }
}
