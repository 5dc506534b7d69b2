//! MoopMapper Upload Service
//!
//! Photo ingestion service for the MoopMapper lot-mapping workflow. Field
//! devices upload photos tagged with an upload key (the lot or session they
//! belong to); the service stores each photo under its key, extracts EXIF
//! and GPS data, and writes a JSON metadata record next to it.
//!
//! ## Features
//!
//! - **Partitioned Photo Storage**: One directory per upload key, with
//!   deterministic `{key}_{timestamp}_{sequence}.jpg` names
//! - **EXIF/GPS Extraction**: Best-effort; photos without EXIF are still stored
//! - **Metadata Records**: One pretty-printed JSON document per photo
//! - **Scan-based Queries**: Listings are rebuilt from disk on every call, so
//!   they always match what was durably written
//!
//! ## Layout
//!
//! ```text
//! {root}/
//! ├── uploads/
//! │   └── {upload_key}/
//! │       └── {upload_key}_{timestamp}_{sequence}.jpg
//! ├── processed/
//! └── metadata/
//!     └── {upload_key}_{timestamp}_{sequence}.jpg.json
//! ```
//!
//! ## Flow
//!
//! ```text
//! POST /upload ──▶ Ingestor ──▶ PhotoStore ──▶ uploads/{key}/
//!                     │
//!                     ├──▶ exif_reader
//!                     │
//!                     └──▶ MetadataStore ──▶ metadata/
//!                                               │
//! GET /uploads ───────▶ QueryEngine ◀───────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod exif_reader;
pub mod fsutil;
pub mod ingest;
pub mod metadata_store;
pub mod naming;
pub mod photo_store;
pub mod query;
pub mod recovery;

pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use config::{Config, StorageRoot};
pub use error::{StoreError, UploadError};
pub use exif_reader::ExifData;
pub use ingest::{Ingestor, UploadRequest};
pub use metadata_store::{MetadataRecord, MetadataStore};
pub use naming::{KeyNamespace, NamingError, Partition, PhotoIdentity, UploadKey};
pub use photo_store::PhotoStore;
pub use query::{KeySummary, QueryEngine, ServiceStats};
pub use recovery::{recover, RecoveryReport};
