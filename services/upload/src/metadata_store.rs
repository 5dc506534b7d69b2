use crate::config::StorageRoot;
use crate::error::StoreError;
use crate::exif_reader::ExifData;
use crate::fsutil::{is_hidden, write_atomic};
use crate::naming::filename_prefix;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

const RECORD_EXTENSION: &str = ".json";

/// Stored photo metadata, one JSON document per photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Mapping session the photo belongs to
    pub upload_key: String,
    /// Derived photo filename (`{upload_key}_{timestamp}_{sequence}.jpg`)
    pub filename: String,
    /// Filename the client sent
    pub original_filename: Option<String>,
    /// Capture timestamp as supplied (or defaulted)
    pub timestamp: String,
    /// Per-session sequence number as supplied (or defaulted)
    pub sequence: String,
    /// When the server accepted the photo
    #[serde(with = "upload_time")]
    pub upload_time: DateTime<Utc>,
    /// Photo size in bytes
    pub file_size: u64,
    /// Extracted EXIF tags
    #[serde(default)]
    pub exif_data: ExifData,
    /// Caller-supplied metadata
    #[serde(default = "empty_object")]
    pub additional_metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl MetadataRecord {
    /// Name of the JSON document holding this record
    pub fn document_name(&self) -> String {
        document_name(&self.filename)
    }
}

fn document_name(filename: &str) -> String {
    format!("{filename}{RECORD_EXTENSION}")
}

/// RFC 3339 on write; also accepts the naive ISO-8601 form (read as UTC)
mod upload_time {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid upload_time: {s}")))
    }

    pub(super) fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

/// Flat directory of metadata documents named after their photo
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(root: &StorageRoot) -> Self {
        Self {
            dir: root.metadata_dir(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record, replacing any record for the same filename
    #[instrument(skip(self, record), fields(filename = %record.filename))]
    pub fn put(&self, record: &MetadataRecord) -> Result<PathBuf, StoreError> {
        let body = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Encode {
            filename: record.filename.clone(),
            source: e,
        })?;
        let path = self.dir.join(record.document_name());

        write_atomic(&path, &body)?;

        debug!(path = %path.display(), "Metadata record written");
        Ok(path)
    }

    /// Fetch the record for a photo filename
    pub fn get(&self, filename: &str) -> Result<MetadataRecord, StoreError> {
        let path = self.dir.join(document_name(filename));
        match fs::read(&path) {
            Ok(bytes) => decode(&path, &bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(filename.to_string()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Delete the record for a photo filename; a missing record is fine
    pub fn remove(&self, filename: &str) -> Result<(), StoreError> {
        let path = self.dir.join(document_name(filename));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.dir.join(document_name(filename)).is_file()
    }

    /// Lazily read every record
    pub fn scan_all(&self) -> Result<RecordScan, StoreError> {
        RecordScan::open(&self.dir, None)
    }

    /// Lazily read the records of one upload key.
    ///
    /// Matches on the `{upload_key}_` filename prefix and then on the record's
    /// own `upload_key`, since `lot4_...` also carries the prefix of `lot`.
    pub fn scan_by_prefix(&self, upload_key: &str) -> Result<RecordScan, StoreError> {
        RecordScan::open(&self.dir, Some(upload_key.to_string()))
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<MetadataRecord, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Iterator over metadata documents.
///
/// Each unreadable or malformed document yields its own `Err`, so callers can
/// skip it and keep going.
#[derive(Debug)]
pub struct RecordScan {
    entries: Option<fs::ReadDir>,
    dir: PathBuf,
    upload_key: Option<String>,
    prefix: Option<String>,
}

impl RecordScan {
    fn open(dir: &Path, upload_key: Option<String>) -> Result<Self, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let prefix = upload_key.as_deref().map(filename_prefix);

        Ok(Self {
            entries,
            dir: dir.to_path_buf(),
            upload_key,
            prefix,
        })
    }

    fn wants(&self, name: &str) -> bool {
        if is_hidden(name) || !name.ends_with(RECORD_EXTENSION) {
            return false;
        }
        match &self.prefix {
            Some(prefix) => name.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

impl Iterator for RecordScan {
    type Item = Result<MetadataRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.as_mut()?.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(StoreError::io(&self.dir, e))),
            };

            let name = entry.file_name().to_string_lossy().to_string();
            if !self.wants(&name) {
                continue;
            }

            let path = entry.path();
            let record = match fs::read(&path) {
                Ok(bytes) => decode(&path, &bytes),
                // Replaced between listing and reading
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => Err(StoreError::io(&path, e)),
            };

            match (&self.upload_key, record) {
                (Some(key), Ok(record)) if &record.upload_key != key => continue,
                (_, record) => return Some(record),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_records {
    use super::*;
    use chrono::TimeZone;

    pub fn record(key: &str, ts: &str, seq: &str, upload_secs: i64) -> MetadataRecord {
        MetadataRecord {
            upload_key: key.to_string(),
            filename: format!("{key}_{ts}_{seq}.jpg"),
            original_filename: Some("IMG_0001.jpg".to_string()),
            timestamp: ts.to_string(),
            sequence: seq.to_string(),
            upload_time: Utc.timestamp_opt(upload_secs, 0).unwrap(),
            file_size: 4,
            exif_data: ExifData::default(),
            additional_metadata: serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_records::record;
    use super::*;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::new(dir.path());
        root.ensure().unwrap();
        (dir, MetadataStore::new(&root))
    }

    #[test]
    fn test_put_and_get() {
        let (dir, store) = store();
        let rec = record("lot42", "1000", "0001", 1_700_000_000);

        let path = store.put(&rec).unwrap();

        assert_eq!(path, dir.path().join("metadata/lot42_1000_0001.jpg.json"));
        assert_eq!(store.get("lot42_1000_0001.jpg").unwrap(), rec);
        assert!(store.exists("lot42_1000_0001.jpg"));
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("lot42_1000_0001.jpg"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store();
        let rec = record("lot42", "1000", "0001", 1);
        store.put(&rec).unwrap();

        store.remove(&rec.filename).unwrap();
        assert!(!store.exists(&rec.filename));
        assert!(store.remove(&rec.filename).is_ok());
    }

    #[test]
    fn test_put_replaces_in_place() {
        let (_dir, store) = store();
        let mut rec = record("lot42", "1000", "0001", 1_700_000_000);
        store.put(&rec).unwrap();

        rec.file_size = 99;
        store.put(&rec).unwrap();

        assert_eq!(store.scan_all().unwrap().count(), 1);
        assert_eq!(store.get(&rec.filename).unwrap().file_size, 99);
    }

    #[test]
    fn test_persisted_field_names() {
        let (_dir, store) = store();
        let rec = record("lot42", "1000", "0001", 1_700_000_000);
        let path = store.put(&rec).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();

        assert_eq!(
            keys,
            vec![
                "additional_metadata",
                "exif_data",
                "file_size",
                "filename",
                "original_filename",
                "sequence",
                "timestamp",
                "upload_key",
                "upload_time",
            ]
        );
        assert_eq!(json["upload_time"], "2023-11-14T22:13:20.000000Z");
    }

    #[test]
    fn test_scan_by_prefix_filters_on_record_key() {
        let (_dir, store) = store();
        store.put(&record("lot", "1000", "0001", 1)).unwrap();
        // filename starts with "lot_" but belongs to key "lot_4"
        store.put(&record("lot_4", "1000", "0001", 2)).unwrap();
        store.put(&record("lot4", "1000", "0001", 3)).unwrap();

        let keys: Vec<String> = store
            .scan_by_prefix("lot")
            .unwrap()
            .map(|r| r.unwrap().upload_key)
            .collect();

        assert_eq!(keys, vec!["lot".to_string()]);
    }

    #[test]
    fn test_scan_reports_malformed_documents() {
        let (_dir, store) = store();
        store.put(&record("lot42", "1000", "0001", 1)).unwrap();
        fs::write(store.dir().join("lot42_1000_0002.jpg.json"), b"{not json").unwrap();
        fs::write(store.dir().join(".upload-x.partial"), b"{").unwrap();

        let results: Vec<_> = store.scan_all().unwrap().collect();

        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::Corrupt { .. }))));
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(&StorageRoot::new(dir.path()));
        assert_eq!(store.scan_all().unwrap().count(), 0);
    }

    #[test]
    fn test_reads_naive_upload_time() {
        let json = r#"{
            "upload_key": "lot42",
            "filename": "lot42_1000_0001.jpg",
            "original_filename": "IMG_0001.jpg",
            "timestamp": "1000",
            "sequence": "0001",
            "upload_time": "2025-08-20T14:03:11.482113",
            "file_size": 2048,
            "exif_data": {"Make": "Google", "GPSInfo": {"GPSLatitudeRef": "N"}},
            "additional_metadata": {"lot": "3:00 & G"}
        }"#;

        let rec: MetadataRecord = serde_json::from_str(json).unwrap();

        assert_eq!(
            rec.upload_time,
            Utc.with_ymd_and_hms(2025, 8, 20, 14, 3, 11).unwrap()
                + chrono::Duration::microseconds(482_113)
        );
        assert_eq!(rec.exif_data.get("Make"), Some("Google"));
        assert_eq!(rec.exif_data.gps["GPSLatitudeRef"], "N");
    }

    #[test]
    fn test_missing_optional_sections_default() {
        let json = r#"{
            "upload_key": "lot42",
            "filename": "lot42_1000_0001.jpg",
            "original_filename": null,
            "timestamp": "1000",
            "sequence": "0001",
            "upload_time": "2025-08-20T14:03:11Z",
            "file_size": 2048
        }"#;

        let rec: MetadataRecord = serde_json::from_str(json).unwrap();
        assert!(rec.exif_data.is_empty());
        assert_eq!(rec.additional_metadata, serde_json::json!({}));
    }
}
