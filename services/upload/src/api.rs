use crate::config::ApiConfig;
use crate::error::UploadError;
use crate::ingest::{Ingestor, UploadRequest};
use crate::metadata_store::MetadataRecord;
use crate::query::{KeySummary, QueryEngine, ServiceStats};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Ingestor,
    pub queries: QueryEngine,
    pub service_name: String,
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub filename: String,
    pub upload_key: String,
    pub message: &'static str,
    pub metadata: MetadataRecord,
}

/// All uploads, newest first
#[derive(Debug, Serialize)]
pub struct UploadListResponse {
    pub total_uploads: usize,
    pub uploads: Vec<MetadataRecord>,
}

/// Upload keys with photo counts
#[derive(Debug, Serialize)]
pub struct UploadKeysResponse {
    pub total_keys: usize,
    pub upload_keys: BTreeMap<String, KeySummary>,
}

/// Uploads of one key, by sequence
#[derive(Debug, Serialize)]
pub struct KeyViewResponse {
    pub upload_key: String,
    pub total_photos: usize,
    pub uploads: Vec<MetadataRecord>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

/// Service description served at `/`
#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: &'static str,
    pub authentication: &'static str,
    pub endpoints: Vec<EndpointInfo>,
    pub stats: ServiceStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointInfo {
    pub method: &'static str,
    pub path: &'static str,
    pub description: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            UploadError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            UploadError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            UploadError::Storage(_) | UploadError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        if self.is_client_error() {
            debug!(error = %self, "Rejected request");
        } else {
            error!(error = %self, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/upload", post(upload_photo))
        .route("/uploads", get(list_uploads))
        .route("/upload-keys", get(list_upload_keys))
        .route("/view/:upload_key", get(view_upload_key))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

const ENDPOINTS: [(&str, &str, &str); 5] = [
    ("POST", "/upload", "Upload photos with metadata"),
    ("GET", "/uploads", "List all uploads"),
    ("GET", "/upload-keys", "List upload keys"),
    ("GET", "/view/{upload_key}", "View uploads by key"),
    ("GET", "/health", "Health check"),
];

async fn service_info(State(state): State<AppState>) -> Result<Json<ServiceInfo>, UploadError> {
    let stats = state.queries.stats().await?;

    Ok(Json(ServiceInfo {
        service: state.service_name,
        version: VERSION,
        authentication: "open",
        endpoints: ENDPOINTS
            .iter()
            .map(|&(method, path, description)| EndpointInfo {
                method,
                path,
                description,
            })
            .collect(),
        stats,
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: state.service_name,
        timestamp: Utc::now(),
        version: VERSION,
    })
}

/// Multipart form fields of `POST /upload`
#[derive(Debug, Default)]
struct UploadForm {
    upload_key: Option<String>,
    file: Option<Vec<u8>>,
    content_type: Option<String>,
    original_filename: Option<String>,
    timestamp: Option<String>,
    sequence: Option<String>,
    metadata: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, UploadError> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    form.original_filename = field.file_name().map(str::to_string);
                    form.content_type = field.content_type().map(str::to_string);
                    form.file = Some(field.bytes().await.map_err(bad_multipart)?.to_vec());
                }
                "upload_key" => form.upload_key = Some(field.text().await.map_err(bad_multipart)?),
                "timestamp" => form.timestamp = Some(field.text().await.map_err(bad_multipart)?),
                "sequence" => form.sequence = Some(field.text().await.map_err(bad_multipart)?),
                "metadata" => form.metadata = Some(field.text().await.map_err(bad_multipart)?),
                _ => debug!(field = %name, "Ignoring unknown form field"),
            }
        }

        Ok(form)
    }

    fn into_request(self) -> Result<UploadRequest, UploadError> {
        let upload_key = self
            .upload_key
            .ok_or_else(|| UploadError::InvalidArgument("missing form field: upload_key".into()))?;
        let bytes = self
            .file
            .ok_or_else(|| UploadError::InvalidArgument("missing form field: file".into()))?;

        Ok(UploadRequest {
            upload_key,
            bytes,
            content_type: self.content_type,
            original_filename: self.original_filename,
            timestamp: self.timestamp,
            sequence: self.sequence,
            metadata: self.metadata,
        })
    }
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> UploadError {
    UploadError::InvalidArgument(format!("malformed multipart body: {e}"))
}

/// Upload a photo with associated metadata
#[instrument(skip(state, multipart))]
async fn upload_photo(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, UploadError> {
    let request = UploadForm::read(multipart).await?.into_request()?;
    let record = state.ingestor.ingest(request).await?;

    Ok(Json(UploadResponse {
        status: "success",
        filename: record.filename.clone(),
        upload_key: record.upload_key.clone(),
        message: "Photo uploaded successfully",
        metadata: record,
    }))
}

#[instrument(skip(state))]
async fn list_uploads(State(state): State<AppState>) -> Result<Json<UploadListResponse>, UploadError> {
    let uploads = state.queries.list_all().await?;

    Ok(Json(UploadListResponse {
        total_uploads: uploads.len(),
        uploads,
    }))
}

#[instrument(skip(state))]
async fn list_upload_keys(
    State(state): State<AppState>,
) -> Result<Json<UploadKeysResponse>, UploadError> {
    let upload_keys = state.queries.list_keys().await?;

    Ok(Json(UploadKeysResponse {
        total_keys: upload_keys.len(),
        upload_keys,
    }))
}

#[instrument(skip(state))]
async fn view_upload_key(
    State(state): State<AppState>,
    Path(upload_key): Path<String>,
) -> Result<Json<KeyViewResponse>, UploadError> {
    let uploads = state.queries.view_by_key(&upload_key).await?;

    Ok(Json(KeyViewResponse {
        upload_key,
        total_photos: uploads.len(),
        uploads,
    }))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageRoot;
    use crate::exif_reader::test_images::jpeg_with_gps;
    use crate::metadata_store::MetadataStore;
    use crate::photo_store::PhotoStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "moopmapper-test-boundary";

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::new(dir.path());
        root.ensure().unwrap();

        let photos = Arc::new(PhotoStore::new(&root));
        let records = Arc::new(MetadataStore::new(&root));
        let state = AppState {
            ingestor: Ingestor::new(photos.clone(), records.clone()),
            queries: QueryEngine::new(photos, records),
            service_name: "moopmapper-upload".to_string(),
        };

        (dir, create_router(state, &ApiConfig::default()))
    }

    /// Build a multipart body; `file` is (filename, content type, bytes)
    fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &str, &[u8])>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((filename, content_type, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_upload_and_query_endpoints() {
        let (_dir, router) = app();
        let photo = jpeg_with_gps();

        for seq in ["0002", "0001"] {
            let body = multipart_body(
                &[
                    ("upload_key", "lot42"),
                    ("timestamp", "1000"),
                    ("sequence", seq),
                    ("metadata", r#"{"lot": "3:00 & G"}"#),
                ],
                Some(("IMG_0001.jpg", "image/jpeg", photo.as_slice())),
            );
            let (status, json) = send(&router, upload_request(body)).await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"], "success");
            assert_eq!(json["filename"], format!("lot42_1000_{seq}.jpg"));
            assert_eq!(json["metadata"]["additional_metadata"]["lot"], "3:00 & G");
            assert_eq!(json["metadata"]["exif_data"]["GPSInfo"]["GPSLatitudeRef"], "N");
        }

        let (status, json) = send(&router, get("/uploads")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_uploads"], 2);

        let (status, json) = send(&router, get("/upload-keys")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_keys"], 1);
        assert_eq!(json["upload_keys"]["lot42"]["photo_count"], 2);

        let (status, json) = send(&router, get("/view/lot42")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_photos"], 2);
        assert_eq!(json["uploads"][0]["sequence"], "0001");
        assert_eq!(json["uploads"][1]["sequence"], "0002");
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image() {
        let (_dir, router) = app();
        let body = multipart_body(
            &[("upload_key", "lot42")],
            Some(("notes.txt", "text/plain", b"hello".as_slice())),
        );

        let (status, json) = send(&router, upload_request(body)).await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(json["code"], "UNSUPPORTED_MEDIA_TYPE");

        let (_, json) = send(&router, get("/upload-keys")).await;
        assert_eq!(json["total_keys"], 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_metadata_and_missing_fields() {
        let (_dir, router) = app();

        let body = multipart_body(
            &[("upload_key", "lot42"), ("metadata", "{oops")],
            Some(("a.jpg", "image/jpeg", b"\xFF\xD8\xFF\xD9".as_slice())),
        );
        let (status, json) = send(&router, upload_request(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_ARGUMENT");

        let body = multipart_body(&[("upload_key", "lot42")], None);
        let (status, _) = send(&router, upload_request(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_view_unknown_key_is_404() {
        let (_dir, router) = app();
        let (status, json) = send(&router, get("/view/nonexistent")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let (_dir, router) = app();

        let (status, json) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "moopmapper-upload");

        let (status, json) = send(&router, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stats"]["total_photos"], 0);
        assert_eq!(json["endpoints"].as_array().unwrap().len(), ENDPOINTS.len());
    }
}
