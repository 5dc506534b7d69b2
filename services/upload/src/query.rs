use crate::error::{StoreError, UploadError};
use crate::metadata_store::{MetadataRecord, MetadataStore, RecordScan};
use crate::photo_store::PhotoStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task;
use tracing::{instrument, warn};

/// Photo count for one upload key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub upload_key: String,
    pub photo_count: usize,
    /// Partition directory
    pub directory: String,
}

/// Totals across all upload keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub total_keys: usize,
    pub total_photos: usize,
}

/// Answers listing queries by scanning durable state on every call.
///
/// There is no cached index; a query reflects whatever was fully written
/// before it started reading.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    photos: Arc<PhotoStore>,
    records: Arc<MetadataStore>,
}

impl QueryEngine {
    pub fn new(photos: Arc<PhotoStore>, records: Arc<MetadataStore>) -> Self {
        Self { photos, records }
    }

    /// Every record, newest upload first
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<MetadataRecord>, UploadError> {
        let records = self.records.clone();
        let mut uploads = task::spawn_blocking(move || collect(records.scan_all()?)).await??;

        uploads.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
        Ok(uploads)
    }

    /// Upload keys with their photo counts
    #[instrument(skip(self))]
    pub async fn list_keys(&self) -> Result<BTreeMap<String, KeySummary>, UploadError> {
        let photos = self.photos.clone();
        let keys = task::spawn_blocking(move || summarize_keys(&photos)).await??;
        Ok(keys)
    }

    /// Records of one upload key, by ascending sequence.
    ///
    /// Sequences compare as strings; callers zero-pad them so that "0010"
    /// sorts after "0009".
    #[instrument(skip(self))]
    pub async fn view_by_key(&self, upload_key: &str) -> Result<Vec<MetadataRecord>, UploadError> {
        let records = self.records.clone();
        let key = upload_key.to_string();
        let mut uploads =
            task::spawn_blocking(move || collect(records.scan_by_prefix(&key)?)).await??;

        if uploads.is_empty() {
            return Err(UploadError::NotFound(format!(
                "No uploads found for upload key: {upload_key}"
            )));
        }

        uploads.sort_by(|a, b| a.sequence.cmp(&b.sequence));
        Ok(uploads)
    }

    pub async fn stats(&self) -> Result<ServiceStats, UploadError> {
        let keys = self.list_keys().await?;
        Ok(ServiceStats {
            total_keys: keys.len(),
            total_photos: keys.values().map(|k| k.photo_count).sum(),
        })
    }
}

fn summarize_keys(photos: &PhotoStore) -> Result<BTreeMap<String, KeySummary>, StoreError> {
    let mut keys = BTreeMap::new();

    for upload_key in photos.list_partitions()? {
        let photo_count = photos.count_in_partition(&upload_key)?;
        let directory = photos.partition_dir(&upload_key).display().to_string();

        keys.insert(
            upload_key.clone(),
            KeySummary {
                upload_key,
                photo_count,
                directory,
            },
        );
    }

    Ok(keys)
}

/// Drain a scan, skipping documents that cannot be read
fn collect(scan: RecordScan) -> Result<Vec<MetadataRecord>, StoreError> {
    let mut uploads = Vec::new();

    for result in scan {
        match result {
            Ok(record) => uploads.push(record),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable metadata record");
                metrics::counter!("upload.records.skipped").increment(1);
            }
        }
    }

    Ok(uploads)
}
