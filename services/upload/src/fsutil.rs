use crate::error::StoreError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Prefix of in-flight files; never a valid upload key or record name
pub const TEMP_PREFIX: &str = ".upload-";

/// Replace `target` with `bytes` so readers see either the old or the new file.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    StagedFile::write(target, bytes)?.commit()
}

/// Bytes written and synced next to their target but not yet visible.
///
/// The temporary file is created in the target's directory so the final
/// rename never crosses a filesystem boundary. Dropping an uncommitted
/// `StagedFile` deletes it and leaves any existing target untouched.
#[derive(Debug)]
pub struct StagedFile {
    temp_file: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    pub fn write(target: &Path, bytes: &[u8]) -> Result<Self, StoreError> {
        let dir = target
            .parent()
            .ok_or_else(|| StoreError::NotFound(target.display().to_string()))?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|e| StoreError::io(dir, e))?;

        temp_file
            .write_all(bytes)
            .and_then(|_| temp_file.as_file().sync_all())
            .map_err(|e| StoreError::io(temp_file.path(), e))?;

        Ok(Self {
            temp_file,
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename into place, replacing any previous target
    pub fn commit(self) -> Result<(), StoreError> {
        let Self { temp_file, target } = self;
        temp_file
            .persist(&target)
            .map_err(|e| StoreError::io(&target, e.error))?;
        Ok(())
    }
}

/// Remove `dir` if it has no entries left; a missing directory is fine.
///
/// Returns whether the directory was removed.
pub fn remove_dir_if_empty(dir: &Path) -> Result<bool, StoreError> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    if entries.next().is_some() {
        return Ok(false);
    }

    match fs::remove_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

/// Delete leftover temporary files directly inside `dir`.
///
/// Returns how many were removed. A missing directory counts as clean.
pub fn sweep_temp_files(dir: &Path) -> Result<usize, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed interrupted write");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
        }
    }

    Ok(removed)
}

/// Hidden and temporary entries are invisible to listings and scans
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
