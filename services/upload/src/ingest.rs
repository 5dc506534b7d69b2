use crate::error::{StoreError, UploadError};
use crate::exif_reader;
use crate::metadata_store::{MetadataRecord, MetadataStore};
use crate::naming::PhotoIdentity;
use crate::photo_store::PhotoStore;
use chrono::{SubsecRound, Utc};
use mime_guess::mime::{self, Mime};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::{debug, error, info, instrument};

/// One photo as received from a client
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub upload_key: String,
    pub bytes: Vec<u8>,
    /// Declared content type of the photo part
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
    pub timestamp: Option<String>,
    pub sequence: Option<String>,
    /// Caller metadata as raw JSON text
    pub metadata: Option<String>,
}

/// Persists photos and their metadata records
#[derive(Debug, Clone)]
pub struct Ingestor {
    photos: Arc<PhotoStore>,
    records: Arc<MetadataStore>,
}

impl Ingestor {
    pub fn new(photos: Arc<PhotoStore>, records: Arc<MetadataStore>) -> Self {
        Self { photos, records }
    }

    /// Validate, store and index one photo.
    ///
    /// All input checks run before anything touches the disk, so a rejected
    /// upload leaves no partition, photo or record behind.
    #[instrument(skip(self, request), fields(upload_key = %request.upload_key, size_bytes = request.bytes.len()))]
    pub async fn ingest(&self, request: UploadRequest) -> Result<MetadataRecord, UploadError> {
        let started = Instant::now();

        let mime = check_content_type(
            request.content_type.as_deref(),
            request.original_filename.as_deref(),
        )?;
        let additional_metadata = parse_caller_metadata(request.metadata.as_deref())?;
        let identity = PhotoIdentity::resolve(
            &request.upload_key,
            request.timestamp.as_deref(),
            request.sequence.as_deref(),
            Utc::now(),
        )?;

        debug!(filename = %identity.filename(), content_type = %mime, "Accepted upload");

        let photos = self.photos.clone();
        let records = self.records.clone();
        let original_filename = request.original_filename;
        let bytes = request.bytes;

        let record = task::spawn_blocking(move || {
            store_photo(
                &photos,
                &records,
                &identity,
                &bytes,
                original_filename,
                additional_metadata,
            )
        })
        .await??;

        metrics::counter!("upload.photos.ingested").increment(1);
        metrics::counter!("upload.bytes.written").increment(record.file_size);
        metrics::histogram!("upload.ingest.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            filename = %record.filename,
            upload_key = %record.upload_key,
            size_bytes = record.file_size,
            exif_tags = record.exif_data.tags.len(),
            "Uploaded photo"
        );

        Ok(record)
    }
}

/// Stage the photo, write its record, then make the photo visible.
///
/// Any failure leaves the previous photo and record for this identity in
/// place and removes a partition that ends up empty.
fn store_photo(
    photos: &PhotoStore,
    records: &MetadataStore,
    identity: &PhotoIdentity,
    bytes: &[u8],
    original_filename: Option<String>,
    additional_metadata: serde_json::Value,
) -> Result<MetadataRecord, StoreError> {
    let result = stage_and_index(
        photos,
        records,
        identity,
        bytes,
        original_filename,
        additional_metadata,
    );

    if result.is_err() {
        if let Err(e) = photos.prune_partition(identity.upload_key()) {
            error!(upload_key = %identity.upload_key(), error = %e, "Failed to prune partition");
        }
    }

    result
}

fn stage_and_index(
    photos: &PhotoStore,
    records: &MetadataStore,
    identity: &PhotoIdentity,
    bytes: &[u8],
    original_filename: Option<String>,
    additional_metadata: serde_json::Value,
) -> Result<MetadataRecord, StoreError> {
    let staged = photos.stage(identity, bytes)?;

    let record = MetadataRecord {
        upload_key: identity.upload_key().to_string(),
        filename: identity.filename(),
        original_filename,
        timestamp: identity.timestamp().to_string(),
        sequence: identity.sequence().to_string(),
        // Stored with microsecond precision
        upload_time: Utc::now().trunc_subsecs(6),
        file_size: bytes.len() as u64,
        exif_data: exif_reader::extract(bytes),
        additional_metadata,
    };

    let previous = records.get(&record.filename).ok();

    if let Err(e) = records.put(&record) {
        // staged photo is discarded on drop
        error!(filename = %record.filename, error = %e, "Failed to write metadata record");
        return Err(e);
    }

    if let Err(e) = staged.commit() {
        error!(filename = %record.filename, error = %e, "Failed to publish photo");
        let rollback = match &previous {
            Some(previous) => records.put(previous).map(|_| ()),
            None => records.remove(&record.filename),
        };
        if let Err(rollback) = rollback {
            error!(filename = %record.filename, error = %rollback, "Failed to roll back metadata record");
        }
        return Err(e);
    }

    Ok(record)
}

/// Accept only `image/*`; guess from the filename when no type was sent
fn check_content_type(
    content_type: Option<&str>,
    original_filename: Option<&str>,
) -> Result<Mime, UploadError> {
    let mime = match content_type.map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => raw
            .parse::<Mime>()
            .map_err(|_| UploadError::UnsupportedMediaType(raw.to_string()))?,
        None => original_filename
            .map(|name| mime_guess::from_path(name).first_or_octet_stream())
            .unwrap_or(mime::APPLICATION_OCTET_STREAM),
    };

    if mime.type_() != mime::IMAGE {
        return Err(UploadError::UnsupportedMediaType(format!(
            "File must be an image, got {mime}"
        )));
    }

    Ok(mime)
}

/// Absent or empty metadata is `{}`; anything else must be well-formed JSON,
/// including whitespace-only text
fn parse_caller_metadata(raw: Option<&str>) -> Result<serde_json::Value, UploadError> {
    match raw.filter(|m| !m.is_empty()) {
        None => Ok(serde_json::Value::Object(Default::default())),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| UploadError::InvalidArgument(format!("metadata is not valid JSON: {e}"))),
    }
}
