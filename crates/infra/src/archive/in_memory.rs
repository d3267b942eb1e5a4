use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use gas_core::{ArchiveId, RetrievalId};

use super::{ArchiveError, ColdArchive, RetrievalStatus, new_archive_id, new_retrieval_id};

#[derive(Debug)]
struct Retrieval {
    archive_id: ArchiveId,
    ready_at: Instant,
}

/// In-memory cold archive for tests/dev. Retrievals become ready after
/// `retrieval_delay` (zero by default).
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    retrieval_delay: Duration,
    archives: RwLock<HashMap<ArchiveId, Vec<u8>>>,
    retrievals: RwLock<HashMap<RetrievalId, Retrieval>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retrieval_delay(mut self, delay: Duration) -> Self {
        self.retrieval_delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.archives.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, archive_id: &ArchiveId) -> bool {
        self.archives
            .read()
            .map(|a| a.contains_key(archive_id))
            .unwrap_or(false)
    }
}

fn poisoned() -> ArchiveError {
    ArchiveError::Unavailable("archive lock poisoned".to_string())
}

impl ColdArchive for InMemoryArchive {
    fn upload(&self, data: &[u8]) -> Result<ArchiveId, ArchiveError> {
        let archive_id = new_archive_id()?;
        let mut archives = self.archives.write().map_err(|_| poisoned())?;
        archives.insert(archive_id.clone(), data.to_vec());
        Ok(archive_id)
    }

    fn initiate_retrieval(&self, archive_id: &ArchiveId) -> Result<RetrievalId, ArchiveError> {
        if !self.archives.read().map_err(|_| poisoned())?.contains_key(archive_id) {
            return Err(ArchiveError::NotFound(archive_id.clone()));
        }
        let retrieval_id = new_retrieval_id()?;
        let mut retrievals = self.retrievals.write().map_err(|_| poisoned())?;
        retrievals.insert(
            retrieval_id.clone(),
            Retrieval {
                archive_id: archive_id.clone(),
                ready_at: Instant::now() + self.retrieval_delay,
            },
        );
        Ok(retrieval_id)
    }

    fn retrieval_status(&self, retrieval_id: &RetrievalId) -> Result<RetrievalStatus, ArchiveError> {
        let retrievals = self.retrievals.read().map_err(|_| poisoned())?;
        let retrieval = retrievals
            .get(retrieval_id)
            .ok_or_else(|| ArchiveError::UnknownRetrieval(retrieval_id.clone()))?;
        if Instant::now() < retrieval.ready_at {
            return Ok(RetrievalStatus::InProgress);
        }

        let archives = self.archives.read().map_err(|_| poisoned())?;
        archives
            .get(&retrieval.archive_id)
            .map(|data| RetrievalStatus::Ready(data.clone()))
            .ok_or_else(|| ArchiveError::NotFound(retrieval.archive_id.clone()))
    }

    fn delete(&self, archive_id: &ArchiveId) -> Result<(), ArchiveError> {
        let mut archives = self.archives.write().map_err(|_| poisoned())?;
        archives.remove(archive_id);
        drop(archives);

        let mut retrievals = self.retrievals.write().map_err(|_| poisoned())?;
        retrievals.retain(|_, r| &r.archive_id != archive_id);
        Ok(())
    }
}
