use crate::config::StorageRoot;
use crate::error::StoreError;
use crate::fsutil::{is_hidden, remove_dir_if_empty, StagedFile};
use crate::naming::{KeyNamespace, PhotoIdentity, UploadKey, PHOTO_EXTENSION};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Photo bytes, one directory per upload key
///
/// All methods do blocking filesystem I/O; async callers run them on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    namespace: KeyNamespace,
}

impl PhotoStore {
    pub fn new(root: &StorageRoot) -> Self {
        Self {
            namespace: KeyNamespace::new(root),
        }
    }

    /// Where a photo with this identity lives (whether or not it exists)
    pub fn path_for(&self, identity: &PhotoIdentity) -> PathBuf {
        self.namespace
            .partition_dir(identity.upload_key().as_str())
            .join(identity.filename())
    }

    /// Write a photo, replacing any earlier photo with the same identity
    pub fn put(&self, identity: &PhotoIdentity, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let staged = self.stage(identity, bytes)?;
        let path = staged.target().to_path_buf();
        staged.commit()?;
        Ok(path)
    }

    /// Write a photo into its partition without making it visible yet.
    ///
    /// Creates the partition if needed. Until the returned file is committed,
    /// an earlier photo with the same identity stays in place.
    #[instrument(skip(self, bytes), fields(filename = %identity.filename(), size_bytes = bytes.len()))]
    pub fn stage(&self, identity: &PhotoIdentity, bytes: &[u8]) -> Result<StagedFile, StoreError> {
        let partition = self.namespace.partition_for(identity.upload_key())?;
        let staged = StagedFile::write(&partition.path_of(identity), bytes)?;

        debug!(path = %staged.target().display(), "Photo staged");
        Ok(staged)
    }

    /// Read back a stored photo
    pub fn read(&self, identity: &PhotoIdentity) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(identity);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(identity.filename()),
            _ => StoreError::io(&path, e),
        })
    }

    /// Drop a partition that holds nothing, so keys only exist with photos
    pub fn prune_partition(&self, upload_key: &UploadKey) -> Result<bool, StoreError> {
        let removed = remove_dir_if_empty(&self.partition_dir(upload_key.as_str()))?;
        if removed {
            debug!(upload_key = %upload_key, "Removed empty partition");
        }
        Ok(removed)
    }

    /// Upload keys that have a partition directory
    pub fn list_partitions(&self) -> Result<BTreeSet<String>, StoreError> {
        let uploads_dir = self.namespace.uploads_dir();
        let entries = match fs::read_dir(uploads_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(StoreError::io(uploads_dir, e)),
        };

        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(uploads_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                continue;
            }
            if entry
                .file_type()
                .map_err(|e| StoreError::io(entry.path(), e))?
                .is_dir()
            {
                keys.insert(name);
            }
        }

        Ok(keys)
    }

    pub fn partition_dir(&self, upload_key: &str) -> PathBuf {
        self.namespace.partition_dir(upload_key)
    }

    /// Number of photos in a partition, by directory enumeration
    pub fn count_in_partition(&self, upload_key: &str) -> Result<usize, StoreError> {
        Ok(self.photos_in_partition(upload_key)?.len())
    }

    /// Photo filenames in a partition, sorted
    pub fn photos_in_partition(&self, upload_key: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.partition_dir(upload_key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_hidden(&name) && is_photo(Path::new(&name)) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }
}

fn is_photo(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(PHOTO_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(key: &str, ts: &str, seq: &str) -> PhotoIdentity {
        PhotoIdentity::resolve(key, Some(ts), Some(seq), Utc::now()).unwrap()
    }

    fn store() -> (tempfile::TempDir, PhotoStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::new(&StorageRoot::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_put_uses_deterministic_path() {
        let (dir, store) = store();
        let id = identity("lot42", "1000", "0001");

        let path = store.put(&id, b"jpeg-bytes").unwrap();

        assert_eq!(path, dir.path().join("uploads/lot42/lot42_1000_0001.jpg"));
        assert_eq!(store.read(&id).unwrap(), b"jpeg-bytes");
    }

    #[test]
    fn test_put_same_identity_last_write_wins() {
        let (_dir, store) = store();
        let id = identity("lot42", "1000", "0001");

        store.put(&id, b"first").unwrap();
        store.put(&id, b"second").unwrap();

        assert_eq!(store.read(&id).unwrap(), b"second");
        assert_eq!(store.count_in_partition("lot42").unwrap(), 1);
    }

    #[test]
    fn test_partitions_and_counts() {
        let (_dir, store) = store();
        assert!(store.list_partitions().unwrap().is_empty());

        store.put(&identity("lot42", "1000", "0001"), b"a").unwrap();
        store.put(&identity("lot42", "1000", "0002"), b"b").unwrap();
        store.put(&identity("lot7", "2000", "0001"), b"c").unwrap();

        let keys: Vec<String> = store.list_partitions().unwrap().into_iter().collect();
        assert_eq!(keys, vec!["lot42".to_string(), "lot7".to_string()]);
        assert_eq!(store.count_in_partition("lot42").unwrap(), 2);
        assert_eq!(store.count_in_partition("lot7").unwrap(), 1);
        assert_eq!(store.count_in_partition("missing").unwrap(), 0);
    }

    #[test]
    fn test_count_ignores_temporary_and_foreign_files() {
        let (_dir, store) = store();
        store.put(&identity("lot42", "1000", "0001"), b"a").unwrap();

        let partition = store.partition_dir("lot42");
        fs::write(partition.join(".upload-x.partial"), b"half").unwrap();
        fs::write(partition.join("notes.txt"), b"n").unwrap();

        assert_eq!(
            store.photos_in_partition("lot42").unwrap(),
            vec!["lot42_1000_0001.jpg".to_string()]
        );
    }

    #[test]
    fn test_read_missing() {
        let (_dir, store) = store();
        let id = identity("lot42", "1000", "0001");

        assert!(matches!(store.read(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_uncommitted_stage_is_invisible() {
        let (_dir, store) = store();
        let id = identity("lot42", "1000", "0001");
        store.put(&id, b"first").unwrap();

        let staged = store.stage(&id, b"second").unwrap();
        assert_eq!(store.read(&id).unwrap(), b"first");
        assert_eq!(store.count_in_partition("lot42").unwrap(), 1);

        drop(staged);
        assert_eq!(store.read(&id).unwrap(), b"first");
    }

    #[test]
    fn test_prune_partition_only_when_empty() {
        let (_dir, store) = store();
        let id = identity("lot42", "1000", "0001");

        drop(store.stage(&id, b"a").unwrap());
        assert!(store.list_partitions().unwrap().contains("lot42"));
        assert!(store.prune_partition(id.upload_key()).unwrap());
        assert!(store.list_partitions().unwrap().is_empty());

        store.put(&id, b"a").unwrap();
        assert!(!store.prune_partition(id.upload_key()).unwrap());
        assert_eq!(store.count_in_partition("lot42").unwrap(), 1);
    }
}
