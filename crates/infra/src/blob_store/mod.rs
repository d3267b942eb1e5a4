//! Object storage for job inputs, results and logs.

mod fs;
mod in_memory;

use std::path::Path;

use uuid::Uuid;

use gas_core::FileRef;

pub use fs::FsBlobStore;
pub use in_memory::InMemoryBlobStore;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(FileRef),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

impl BlobError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound(_))
    }
}

/// Bucket/key object store.
pub trait BlobStore: Send + Sync {
    fn get(&self, object: &FileRef) -> Result<Vec<u8>, BlobError>;

    /// Create or replace an object.
    fn put(&self, object: &FileRef, data: &[u8]) -> Result<(), BlobError>;

    /// Remove an object. Deleting a missing object succeeds.
    fn delete(&self, object: &FileRef) -> Result<(), BlobError>;

    fn exists(&self, object: &FileRef) -> Result<bool, BlobError>;

    /// Download an object to a local file, creating parent directories.
    /// Returns the number of bytes written.
    ///
    /// An existing file at `dest` is replaced by rename, never truncated, so
    /// open readers keep the contents they started with.
    fn download_to(&self, object: &FileRef, dest: &Path) -> Result<u64, BlobError> {
        let data = self.get(object)?;
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| BlobError::io(parent, e))?;

        let tmp = parent.join(format!(".download-{}", Uuid::new_v4()));
        std::fs::write(&tmp, &data).map_err(|e| BlobError::io(&tmp, e))?;
        std::fs::rename(&tmp, dest).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            BlobError::io(dest, e)
        })?;
        Ok(data.len() as u64)
    }

    /// Upload a local file. Returns the number of bytes read.
    fn upload_from(&self, src: &Path, object: &FileRef) -> Result<u64, BlobError> {
        let data = std::fs::read(src).map_err(|e| BlobError::io(src, e))?;
        self.put(object, &data)?;
        Ok(data.len() as u64)
    }
}

impl<B> BlobStore for std::sync::Arc<B>
where
    B: BlobStore + ?Sized,
{
    fn get(&self, object: &FileRef) -> Result<Vec<u8>, BlobError> {
        (**self).get(object)
    }

    fn put(&self, object: &FileRef, data: &[u8]) -> Result<(), BlobError> {
        (**self).put(object, data)
    }

    fn delete(&self, object: &FileRef) -> Result<(), BlobError> {
        (**self).delete(object)
    }

    fn exists(&self, object: &FileRef) -> Result<bool, BlobError> {
        (**self).exists(object)
    }

    fn download_to(&self, object: &FileRef, dest: &Path) -> Result<u64, BlobError> {
        (**self).download_to(object, dest)
    }

    fn upload_from(&self, src: &Path, object: &FileRef) -> Result<u64, BlobError> {
        (**self).upload_from(src, object)
    }
}
