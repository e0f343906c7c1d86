//! Resumable upload endpoints under `/storage/v1/upload/resumable`.
//!
//! Wire protocol modeled on TUS 1.0.0 with the creation,
//! creation-with-upload, and termination extensions.  Every
//! non-OPTIONS request must carry `Tus-Resumable: 1.0.0`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use base64::Engine;
use bytes::Bytes;

use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::services::resumable::CreateSessionRequest;
use crate::AppState;

/// Protocol version spoken by this server.
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised on OPTIONS.
const TUS_EXTENSIONS: &str = "creation,creation-with-upload,termination";

/// Body content type for chunk payloads.
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Reject requests that do not speak protocol version 1.0.0.
fn require_tus_version(headers: &HeaderMap) -> Result<(), ApiError> {
    let version = headers
        .get("tus-resumable")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if version != TUS_VERSION {
        return Err(ApiError::VersionMismatch);
    }
    Ok(())
}

/// Parse `Upload-Metadata`: comma-separated `key base64value` pairs.
/// A key without a value is allowed and decodes to the empty string.
fn parse_upload_metadata(headers: &HeaderMap) -> Result<HashMap<String, String>, ApiError> {
    let raw = match headers.get("upload-metadata").and_then(|v| v.to_str().ok()) {
        Some(raw) => raw,
        None => return Ok(HashMap::new()),
    };

    let mut metadata = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or("").to_string();
        if key.is_empty() {
            return Err(ApiError::InvalidRequest {
                message: "Upload-Metadata contained an empty key".to_string(),
            });
        }
        let value = match parts.next() {
            None => String::new(),
            Some(encoded) => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| ApiError::InvalidRequest {
                        message: format!("Upload-Metadata value for {key:?} is not base64"),
                    })?;
                String::from_utf8(decoded).map_err(|_| ApiError::InvalidRequest {
                    message: format!("Upload-Metadata value for {key:?} is not UTF-8"),
                })?
            }
        };
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn parse_header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, ApiError> {
    match headers.get(name).and_then(|v| v.to_str().ok()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ApiError::InvalidRequest {
                message: format!("{name} header is not a valid non-negative integer"),
            }),
    }
}

fn tus_headers(response: &mut Response) {
    response
        .headers_mut()
        .insert("tus-resumable", HeaderValue::from_static(TUS_VERSION));
}

// -- Handlers -----------------------------------------------------------------

/// `OPTIONS /storage/v1/upload/resumable` -- protocol discovery.
#[utoipa::path(
    options,
    path = "/storage/v1/upload/resumable",
    tag = "Resumable",
    operation_id = "ResumableOptions",
    responses((status = 204, description = "Protocol capabilities"))
)]
pub async fn options_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert("tus-resumable", HeaderValue::from_static(TUS_VERSION));
    headers.insert("tus-version", HeaderValue::from_static(TUS_VERSION));
    headers.insert("tus-extension", HeaderValue::from_static(TUS_EXTENSIONS));
    let max_size = state.uploads.max_size();
    if max_size > 0 {
        if let Ok(value) = HeaderValue::from_str(&max_size.to_string()) {
            headers.insert("tus-max-size", value);
        }
    }
    response
}

/// `POST /storage/v1/upload/resumable` -- open a session.
///
/// Requires `Upload-Length` and `Upload-Metadata` with `bucketName` and
/// `objectName`.  A non-empty `application/offset+octet-stream` body is
/// appended immediately (creation-with-upload).
#[utoipa::path(
    post,
    path = "/storage/v1/upload/resumable",
    tag = "Resumable",
    operation_id = "CreateUploadSession",
    request_body = String,
    responses(
        (status = 201, description = "Session created"),
        (status = 412, description = "Protocol version mismatch"),
        (status = 413, description = "Declared length too large")
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_tus_version(&headers)?;

    let upload_length =
        parse_header_u64(&headers, "upload-length")?.ok_or_else(|| ApiError::InvalidRequest {
            message: "Upload-Length header is required".to_string(),
        })?;

    let mut metadata = parse_upload_metadata(&headers)?;
    let bucket_name = metadata
        .remove("bucketName")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest {
            message: "Upload-Metadata must include bucketName".to_string(),
        })?;
    let object_name = metadata
        .remove("objectName")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest {
            message: "Upload-Metadata must include objectName".to_string(),
        })?;
    let content_type = metadata.remove("contentType");
    let cache_control = metadata.remove("cacheControl");

    let upsert = headers
        .get("x-upsert")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let session = state
        .uploads
        .create(
            &auth,
            CreateSessionRequest {
                bucket_name,
                object_name,
                upload_length,
                content_type,
                cache_control,
                metadata,
                upsert,
            },
        )
        .await?;

    // creation-with-upload: append whatever arrived with the POST.
    let mut offset = 0u64;
    let body_is_chunk = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(OFFSET_OCTET_STREAM));
    if body_is_chunk && !body.is_empty() {
        let outcome = state.uploads.write_chunk(&session.id, 0, body).await?;
        offset = outcome.offset;
        if outcome.complete {
            state.uploads.finalize(&session.id).await?;
        }
    }

    let mut response = StatusCode::CREATED.into_response();
    let headers = response.headers_mut();
    if let Ok(value) =
        HeaderValue::from_str(&format!("/storage/v1/upload/resumable/{}", session.id))
    {
        headers.insert(header::LOCATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&offset.to_string()) {
        headers.insert("upload-offset", value);
    }
    tus_headers(&mut response);
    Ok(response)
}

/// `HEAD /storage/v1/upload/resumable/{id}` -- session progress.
#[utoipa::path(
    head,
    path = "/storage/v1/upload/resumable/{id}",
    tag = "Resumable",
    operation_id = "HeadUploadSession",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Offset and length headers"),
        (status = 404, description = "Unknown session"),
        (status = 410, description = "Session expired")
    )
)]
pub async fn head_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_tus_version(&headers)?;
    let (offset, length) = state.uploads.head(&id).await?;

    let mut response = StatusCode::OK.into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&offset.to_string()) {
        response_headers.insert("upload-offset", value);
    }
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        response_headers.insert("upload-length", value);
    }
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    tus_headers(&mut response);
    Ok(response)
}

/// `PATCH|PUT /storage/v1/upload/resumable/{id}` -- append a chunk.
///
/// Requires `Content-Type: application/offset+octet-stream` and an
/// `Upload-Offset` matching the server's.  When the final byte lands
/// the session finalizes into the object service.
#[utoipa::path(
    patch,
    path = "/storage/v1/upload/resumable/{id}",
    tag = "Resumable",
    operation_id = "AppendChunk",
    request_body = String,
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Chunk appended"),
        (status = 409, description = "Offset mismatch"),
        (status = 410, description = "Session expired"),
        (status = 415, description = "Wrong content type")
    )
)]
pub async fn patch_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_tus_version(&headers)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with(OFFSET_OCTET_STREAM) {
        return Err(ApiError::MimeNotAllowed {
            content_type: content_type.to_string(),
        });
    }

    let declared_offset =
        parse_header_u64(&headers, "upload-offset")?.ok_or_else(|| ApiError::InvalidRequest {
            message: "Upload-Offset header is required".to_string(),
        })?;

    let outcome = state.uploads.write_chunk(&id, declared_offset, body).await?;
    if outcome.complete {
        state.uploads.finalize(&id).await?;
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&outcome.offset.to_string()) {
        response.headers_mut().insert("upload-offset", value);
    }
    tus_headers(&mut response);
    Ok(response)
}

/// `DELETE /storage/v1/upload/resumable/{id}` -- cancel a session.
#[utoipa::path(
    delete,
    path = "/storage/v1/upload/resumable/{id}",
    tag = "Resumable",
    operation_id = "CancelUploadSession",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_tus_version(&headers)?;
    state.uploads.cancel(&id).await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    tus_headers(&mut response);
    Ok(response)
}

// ── Tests ───────────────────────────────────────────────────────────
