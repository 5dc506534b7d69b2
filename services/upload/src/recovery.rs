use crate::error::StoreError;
use crate::fsutil::sweep_temp_files;
use crate::metadata_store::MetadataStore;
use crate::photo_store::PhotoStore;
use tracing::{info, warn};

/// Outcome of the startup sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Temporary files left by interrupted writes, now deleted
    pub temp_files_removed: usize,
    /// Photos with no metadata record (left in place)
    pub orphaned_photos: Vec<String>,
}

/// Clean up after interrupted ingestions.
///
/// Partial files never become visible (writes are rename-based), so the only
/// leftovers are temporary files, which are deleted, and photos whose record
/// write never happened, which are reported.
pub fn recover(photos: &PhotoStore, records: &MetadataStore) -> Result<RecoveryReport, StoreError> {
    let mut report = RecoveryReport {
        temp_files_removed: sweep_temp_files(records.dir())?,
        ..Default::default()
    };

    for upload_key in photos.list_partitions()? {
        report.temp_files_removed += sweep_temp_files(&photos.partition_dir(&upload_key))?;

        for filename in photos.photos_in_partition(&upload_key)? {
            if !records.exists(&filename) {
                warn!(upload_key = %upload_key, filename = %filename, "Photo has no metadata record");
                report.orphaned_photos.push(filename);
            }
        }
    }

    info!(
        temp_files_removed = report.temp_files_removed,
        orphaned_photos = report.orphaned_photos.len(),
        "Storage recovery completed"
    );

    Ok(report)
}
