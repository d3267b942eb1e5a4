//! Cold archive for retention-limited results.
//!
//! Archived payloads are not directly readable: a retrieval must be initiated
//! first and only becomes ready after a delay.

mod fs;
mod in_memory;

use gas_core::{ArchiveId, RetrievalId};

pub use fs::FsArchive;
pub use in_memory::InMemoryArchive;

/// State of an archive retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalStatus {
    InProgress,
    Ready(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    NotFound(ArchiveId),

    #[error("unknown retrieval: {0}")]
    UnknownRetrieval(RetrievalId),

    #[error("archive i/o error: {0}")]
    Io(String),

    #[error("archive unavailable: {0}")]
    Unavailable(String),
}

pub trait ColdArchive: Send + Sync {
    /// Store a payload and return its archive id.
    fn upload(&self, data: &[u8]) -> Result<ArchiveId, ArchiveError>;

    fn initiate_retrieval(&self, archive_id: &ArchiveId) -> Result<RetrievalId, ArchiveError>;

    fn retrieval_status(&self, retrieval_id: &RetrievalId) -> Result<RetrievalStatus, ArchiveError>;

    /// Remove an archive together with its retrieval jobs. Deleting a
    /// missing archive succeeds.
    fn delete(&self, archive_id: &ArchiveId) -> Result<(), ArchiveError>;
}

impl<A> ColdArchive for std::sync::Arc<A>
where
    A: ColdArchive + ?Sized,
{
    fn upload(&self, data: &[u8]) -> Result<ArchiveId, ArchiveError> {
        (**self).upload(data)
    }

    fn initiate_retrieval(&self, archive_id: &ArchiveId) -> Result<RetrievalId, ArchiveError> {
        (**self).initiate_retrieval(archive_id)
    }

    fn retrieval_status(&self, retrieval_id: &RetrievalId) -> Result<RetrievalStatus, ArchiveError> {
        (**self).retrieval_status(retrieval_id)
    }

    fn delete(&self, archive_id: &ArchiveId) -> Result<(), ArchiveError> {
        (**self).delete(archive_id)
    }
}

fn new_archive_id() -> Result<ArchiveId, ArchiveError> {
    ArchiveId::new(uuid::Uuid::new_v4().simple().to_string()).map_err(|e| ArchiveError::Io(e.to_string()))
}

fn new_retrieval_id() -> Result<RetrievalId, ArchiveError> {
    RetrievalId::new(uuid::Uuid::new_v4().simple().to_string()).map_err(|e| ArchiveError::Io(e.to_string()))
}
