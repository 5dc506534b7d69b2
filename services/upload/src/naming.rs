//! Upload key namespace and deterministic photo naming.
//!
//! Every photo lives at `uploads/<key>/<key>_<timestamp>_<sequence>.jpg`, so the
//! key, timestamp and sequence all end up as filename components. They are
//! validated here instead of being sanitized: rewriting `lot/42` to `lot_42`
//! would silently merge two distinct sessions into one partition.

use crate::config::StorageRoot;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Sequence used when the caller omits one
pub const DEFAULT_SEQUENCE: &str = "0001";

/// Photos are always named `.jpg`, whatever their actual encoding
pub const PHOTO_EXTENSION: &str = "jpg";

const MAX_COMPONENT_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains unsupported character {ch:?}")]
    InvalidChar { field: &'static str, ch: char },

    #[error("{field} must not start with '.'")]
    LeadingDot { field: &'static str },

    #[error("{field} must not contain the '_' separator")]
    Separator { field: &'static str },
}

/// Check one filename component.
///
/// Allowed: ASCII letters, digits, `-`, `_` and `.`, not starting with `.`.
/// This rules out separators, `..` traversal and hidden/temporary names.
pub fn validate_component(field: &'static str, value: &str) -> Result<(), NamingError> {
    if value.is_empty() {
        return Err(NamingError::Empty { field });
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(NamingError::TooLong {
            field,
            max: MAX_COMPONENT_LEN,
        });
    }
    if value.starts_with('.') {
        return Err(NamingError::LeadingDot { field });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(NamingError::InvalidChar { field, ch });
    }
    Ok(())
}

/// Check a component that follows the upload key in a filename.
///
/// Timestamp and sequence may not contain `_`, so the last two
/// `_`-separated parts of a filename always decode to exactly one
/// (timestamp, sequence) pair even when the key itself contains `_`.
pub fn validate_suffix_component(field: &'static str, value: &str) -> Result<(), NamingError> {
    validate_component(field, value)?;
    if value.contains('_') {
        return Err(NamingError::Separator { field });
    }
    Ok(())
}

/// A validated upload key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploadKey(String);

impl UploadKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, NamingError> {
        let raw = raw.into();
        validate_component("upload_key", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UploadKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub(crate) fn filename_prefix(upload_key: &str) -> String {
    format!("{upload_key}_")
}

/// (upload key, timestamp, sequence): everything a photo's location derives from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoIdentity {
    upload_key: UploadKey,
    timestamp: String,
    sequence: String,
}

impl PhotoIdentity {
    /// Build an identity, filling in defaults for omitted parts.
    ///
    /// Empty strings count as omitted. A missing timestamp becomes `now` in
    /// whole Unix seconds; a missing sequence becomes [`DEFAULT_SEQUENCE`].
    pub fn resolve(
        upload_key: &str,
        timestamp: Option<&str>,
        sequence: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, NamingError> {
        let upload_key = UploadKey::parse(upload_key)?;

        let timestamp = match timestamp.filter(|t| !t.is_empty()) {
            Some(t) => t.to_string(),
            None => now.timestamp().to_string(),
        };
        validate_suffix_component("timestamp", &timestamp)?;

        let sequence = sequence
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SEQUENCE)
            .to_string();
        validate_suffix_component("sequence", &sequence)?;

        Ok(Self {
            upload_key,
            timestamp,
            sequence,
        })
    }

    pub fn upload_key(&self) -> &UploadKey {
        &self.upload_key
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// `{upload_key}_{timestamp}_{sequence}.jpg`
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.upload_key, self.timestamp, self.sequence, PHOTO_EXTENSION
        )
    }
}

/// Maps upload keys to partition directories under `uploads/`
#[derive(Debug, Clone)]
pub struct KeyNamespace {
    uploads_dir: PathBuf,
}

/// A partition directory known to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    dir: PathBuf,
}

impl Partition {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, identity: &PhotoIdentity) -> PathBuf {
        self.dir.join(identity.filename())
    }
}

impl KeyNamespace {
    pub fn new(root: &StorageRoot) -> Self {
        Self {
            uploads_dir: root.uploads_dir(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Partition directory for a key, without touching the filesystem
    pub fn partition_dir(&self, upload_key: &str) -> PathBuf {
        self.uploads_dir.join(upload_key)
    }

    /// Resolve the partition for a key, creating it if absent (idempotent)
    pub fn partition_for(&self, upload_key: &UploadKey) -> Result<Partition, StoreError> {
        let dir = self.partition_dir(upload_key.as_str());
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
            debug!(upload_key = %upload_key, dir = %dir.display(), "Created partition");
        }

        Ok(Partition { dir })
    }
}
