//! Filesystem-backed blob store: objects live at `<root>/<bucket>/<key>`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use gas_core::FileRef;

use super::{BlobError, BlobStore};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, object: &FileRef) -> Result<PathBuf, BlobError> {
        let mut path = self.root.clone();
        for part in [object.bucket.as_str(), object.key.as_str()] {
            let relative = Path::new(part);
            let safe = !part.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !safe {
                return Err(BlobError::InvalidKey(object.to_string()));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, object: &FileRef) -> Result<Vec<u8>, BlobError> {
        let path = self.path_of(object)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => BlobError::NotFound(object.clone()),
            _ => BlobError::io(&path, e),
        })
    }

    fn put(&self, object: &FileRef, data: &[u8]) -> Result<(), BlobError> {
        let path = self.path_of(object)?;
        let parent = path
            .parent()
            .ok_or_else(|| BlobError::InvalidKey(object.to_string()))?;
        fs::create_dir_all(parent).map_err(|e| BlobError::io(parent, e))?;

        // Write beside the target and rename so readers never see a partial object.
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, data).map_err(|e| BlobError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BlobError::io(&path, e)
        })
    }

    fn delete(&self, object: &FileRef) -> Result<(), BlobError> {
        let path = self.path_of(object)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::io(&path, e)),
        }
    }

    fn exists(&self, object: &FileRef) -> Result<bool, BlobError> {
        Ok(self.path_of(object)?.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_are_stored_under_bucket_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let obj = FileRef::new("gas-results", "prefix/u1/j1/a.annot.vcf");

        store.put(&obj, b"annotated").unwrap();
        assert!(dir.path().join("gas-results/prefix/u1/j1/a.annot.vcf").is_file());
        assert_eq!(store.get(&obj).unwrap(), b"annotated");

        store.put(&obj, b"replaced").unwrap();
        assert_eq!(store.get(&obj).unwrap(), b"replaced");

        store.delete(&obj).unwrap();
        assert!(!store.exists(&obj).unwrap());
        assert!(store.get(&obj).unwrap_err().is_not_found());
        store.delete(&obj).unwrap();
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        for obj in [
            FileRef::new("b", "../escape"),
            FileRef::new("b", "/abs"),
            FileRef::new("..", "k"),
            FileRef::new("b", ""),
        ] {
            assert!(matches!(store.put(&obj, b"x"), Err(BlobError::InvalidKey(_))), "{obj}");
        }
    }
}
