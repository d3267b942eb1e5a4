use std::collections::HashMap;
use std::sync::RwLock;

use gas_core::FileRef;

use super::{BlobError, BlobStore};

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<FileRef, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored object references, sorted.
    pub fn objects(&self) -> Vec<FileRef> {
        let mut refs: Vec<FileRef> = self
            .objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        refs.sort_by(|a, b| (&a.bucket, &a.key).cmp(&(&b.bucket, &b.key)));
        refs
    }
}

fn poisoned() -> BlobError {
    BlobError::Unavailable("blob store lock poisoned".to_string())
}

impl BlobStore for InMemoryBlobStore {
    fn get(&self, object: &FileRef) -> Result<Vec<u8>, BlobError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(object)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(object.clone()))
    }

    fn put(&self, object: &FileRef, data: &[u8]) -> Result<(), BlobError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.insert(object.clone(), data.to_vec());
        Ok(())
    }

    fn delete(&self, object: &FileRef) -> Result<(), BlobError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.remove(object);
        Ok(())
    }

    fn exists(&self, object: &FileRef) -> Result<bool, BlobError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.contains_key(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = InMemoryBlobStore::new();
        let obj = FileRef::new("b", "k/one.vcf");
        store.put(&obj, b"data").unwrap();
        assert_eq!(store.get(&obj).unwrap(), b"data");
        assert!(store.exists(&obj).unwrap());

        store.delete(&obj).unwrap();
        store.delete(&obj).unwrap();
        assert!(store.get(&obj).unwrap_err().is_not_found());
    }

    #[test]
    fn download_and_upload_through_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new();
        let input = FileRef::new("in", "u/j~a.vcf");
        store.put(&input, b"#VCF").unwrap();

        let local = dir.path().join("job").join("job.vcf");
        assert_eq!(store.download_to(&input, &local).unwrap(), 4);
        assert_eq!(std::fs::read(&local).unwrap(), b"#VCF");

        let output = FileRef::new("out", "u/j/a.annot.vcf");
        store.upload_from(&local, &output).unwrap();
        assert_eq!(store.objects(), vec![input, output]);
    }

    #[cfg(unix)]
    #[test]
    fn download_replaces_file_without_disturbing_open_readers() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new();
        let input = FileRef::new("in", "u/j~a.vcf");
        let local = dir.path().join("job.vcf");

        store.put(&input, b"first").unwrap();
        store.download_to(&input, &local).unwrap();
        let mut reader = std::fs::File::open(&local).unwrap();

        store.put(&input, b"second copy").unwrap();
        store.download_to(&input, &local).unwrap();

        let mut seen = String::new();
        reader.read_to_string(&mut seen).unwrap();
        assert_eq!(seen, "first");
        assert_eq!(std::fs::read(&local).unwrap(), b"second copy");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
