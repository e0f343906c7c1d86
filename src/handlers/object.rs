//! Object endpoints under `/storage/v1/object`.
//!
//! Wire parsing only: multipart vs raw bodies, headers, and signed-URL
//! token plumbing.  Semantics live in the object service.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;

use super::{parse_json, parse_json_or_default};
use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::metadata::store::{ListObjectsQuery, ObjectRecord, SortColumn, SortOrder};
use crate::services::object::UploadRequest;
use crate::storage::backend::StoredContent;
use crate::token::TokenKind;
use crate::AppState;

/// Characters escaped when embedding object paths in signed URLs.
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// -- Request/response shapes --------------------------------------------------

/// Body of `POST /object/list/{bucket}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsBody {
    #[serde(default)]
    pub prefix: String,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    #[serde(default)]
    pub search: String,
    pub sort_by: Option<SortBy>,
}

/// Sort selector for object listings.
#[derive(Debug, Default, Deserialize)]
pub struct SortBy {
    #[serde(default)]
    pub column: String,
    #[serde(default)]
    pub order: String,
}

/// Body of `POST /object/copy` and `POST /object/move`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyMoveBody {
    /// Source bucket name.
    pub bucket_id: String,
    pub source_key: String,
    /// Destination bucket name; defaults to the source bucket.
    pub destination_bucket: Option<String>,
    pub destination_key: String,
    /// Copy the source's user metadata (default true).
    pub copy_metadata: Option<bool>,
    /// Fresh metadata when `copy_metadata` is false.
    pub metadata: Option<HashMap<String, String>>,
}

/// Body of `DELETE /object/{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct BatchDeleteBody {
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Body of `POST /object/sign/{bucket}/{key}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignBody {
    /// Token lifetime in seconds.
    pub expires_in: u64,
}

/// Body of `PUT /object/info/{bucket}/{key}`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateMetadataBody {
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// `?token=` carrier for signed-URL redemption.
#[derive(Debug, Deserialize)]
pub struct TokenParam {
    pub token: String,
}

// -- Shared helpers -----------------------------------------------------------

fn truthy_header(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Build a streaming download response from a record and its bytes.
fn content_response(record: &ObjectRecord, content: StoredContent, head_only: bool) -> Response {
    let mut response = if head_only {
        let mut r = StatusCode::OK.into_response();
        // HEAD carries the length of the body it elides.
        r.headers_mut().insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&record.size.to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
        r
    } else {
        Body::from(content.data).into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&record.mime_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&record.updated_at) {
        let http_date = httpdate::fmt_http_date(parsed.with_timezone(&chrono::Utc).into());
        if let Ok(value) = HeaderValue::from_str(&http_date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    response
}

/// Add the ETag header to an upload response.
fn with_etag(outcome: &crate::services::object::UploadOutcome, body: Response) -> Response {
    let mut response = body;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", outcome.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

fn signed_path(bucket: &str, key: &str) -> String {
    format!(
        "/storage/v1/object/sign/{}/{}",
        utf8_percent_encode(bucket, PATH_ESCAPE),
        utf8_percent_encode(key, PATH_ESCAPE)
    )
}

/// Pull content bytes and content type out of a request: either the
/// `file` part (or first part) of a multipart form, or the raw body.
async fn extract_upload(
    headers: &HeaderMap,
    request: Request,
) -> Result<(Bytes, Option<String>), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|err| ApiError::InvalidRequest {
                message: format!("invalid multipart body: {err}"),
            })?;

        let mut fallback: Option<(Bytes, Option<String>)> = None;
        while let Some(field) = multipart.next_field().await.map_err(|err| {
            ApiError::InvalidRequest {
                message: format!("invalid multipart body: {err}"),
            }
        })? {
            let name = field.name().map(|s| s.to_string());
            let part_type = field.content_type().map(|s| s.to_string());
            let data = field.bytes().await.map_err(|err| ApiError::InvalidRequest {
                message: format!("invalid multipart body: {err}"),
            })?;

            let is_file_part = name.as_deref() == Some("file");
            if is_file_part {
                return Ok((data, part_type));
            }
            if fallback.is_none() {
                fallback = Some((data, part_type));
            }
        }

        return fallback.ok_or_else(|| ApiError::InvalidRequest {
            message: "multipart body contained no content part".to_string(),
        });
    }

    let data = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|err| ApiError::InvalidRequest {
            message: format!("failed to read request body: {err}"),
        })?;
    let declared = if content_type.is_empty() {
        None
    } else {
        Some(content_type)
    };
    Ok((data, declared))
}

// -- Listing ------------------------------------------------------------------

/// `POST /storage/v1/object/list/{bucket}` -- list objects.
#[utoipa::path(
    post,
    path = "/storage/v1/object/list/{bucket}",
    tag = "Object",
    operation_id = "ListObjects",
    request_body = String,
    params(("bucket" = String, Path, description = "Bucket name")),
    responses((status = 200, description = "Object rows visible to the caller"))
)]
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<Json<Vec<ObjectRecord>>, ApiError> {
    let body: ListObjectsBody = parse_json_or_default(&body)?;
    let sort = body.sort_by.unwrap_or_default();
    let query = ListObjectsQuery {
        prefix: body.prefix,
        search: body.search,
        limit: body.limit.unwrap_or(100),
        offset: body.offset.unwrap_or(0),
        sort_column: SortColumn::parse(&sort.column),
        sort_order: SortOrder::parse(&sort.order),
    };
    let rows = state.objects.list(&auth, &bucket, &query).await?;
    Ok(Json(rows))
}

// -- Download / head ----------------------------------------------------------

/// `GET /storage/v1/object/{bucket}/{key}` -- download with row policy.
#[utoipa::path(
    get,
    path = "/storage/v1/object/{bucket}/{key}",
    tag = "Object",
    operation_id = "DownloadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 404, description = "Missing or masked object")
    )
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (record, content) = state.objects.download(&auth, &bucket, &key).await?;
    Ok(content_response(&record, content, false))
}

/// `GET /storage/v1/object/public/{bucket}/{key}` -- public download.
#[utoipa::path(
    get,
    path = "/storage/v1/object/public/{bucket}/{key}",
    tag = "Object",
    operation_id = "PublicDownloadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 400, description = "Bucket is not public")
    )
)]
pub async fn public_download(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (record, content) = state.objects.public_download(&bucket, &key).await?;
    Ok(content_response(&record, content, false))
}

/// `HEAD /storage/v1/object/{bucket}/{key}` -- metadata headers only.
#[utoipa::path(
    head,
    path = "/storage/v1/object/{bucket}/{key}",
    tag = "Object",
    operation_id = "HeadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses((status = 200, description = "Metadata headers"))
)]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let record = state.objects.info(&auth, &bucket, &key).await?;
    Ok(content_response(
        &record,
        StoredContent {
            data: Bytes::new(),
            content_type: None,
            etag: record.etag.clone(),
        },
        true,
    ))
}

/// `GET /storage/v1/object/info/{bucket}/{key}` -- object row as JSON.
#[utoipa::path(
    get,
    path = "/storage/v1/object/info/{bucket}/{key}",
    tag = "Object",
    operation_id = "GetObjectInfo",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses((status = 200, description = "Object row"))
)]
pub async fn get_object_info(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<ObjectRecord>, ApiError> {
    Ok(Json(state.objects.info(&auth, &bucket, &key).await?))
}

/// `PUT /storage/v1/object/info/{bucket}/{key}` -- replace user metadata.
#[utoipa::path(
    put,
    path = "/storage/v1/object/info/{bucket}/{key}",
    tag = "Object",
    operation_id = "UpdateObjectMetadata",
    request_body = String,
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses((status = 200, description = "Updated object row"))
)]
pub async fn update_object_metadata(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ObjectRecord>, ApiError> {
    let body: UpdateMetadataBody = parse_json(&body)?;
    let record = state
        .objects
        .update_metadata(&auth, &bucket, &key, body.metadata)
        .await?;
    Ok(Json(record))
}

// -- Upload -------------------------------------------------------------------

/// `POST|PUT /storage/v1/object/{bucket}/{key}` -- direct or multipart
/// upload.  `x-upsert: true` permits overwriting.
#[utoipa::path(
    post,
    path = "/storage/v1/object/{bucket}/{key}",
    tag = "Object",
    operation_id = "UploadObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
        ("x-upsert" = Option<bool>, Header, description = "Permit overwrite"),
    ),
    responses(
        (status = 200, description = "Object stored"),
        (status = 409, description = "Object exists and x-upsert is not set"),
        (status = 413, description = "Too large"),
        (status = 415, description = "Content type not allowed")
    )
)]
pub async fn upload_object(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, ApiError> {
    let upsert = truthy_header(&headers, "x-upsert");
    let (data, content_type) = extract_upload(&headers, request).await?;

    let outcome = state
        .objects
        .upload(
            &auth,
            &bucket,
            &key,
            data,
            UploadRequest {
                content_type,
                user_metadata: HashMap::new(),
                owner: auth.user_id.clone(),
                upsert,
            },
        )
        .await?;

    Ok(with_etag(&outcome, Json(&outcome).into_response()))
}

// -- Delete -------------------------------------------------------------------

/// `DELETE /storage/v1/object/{bucket}/{key}` -- delete one object.
#[utoipa::path(
    delete,
    path = "/storage/v1/object/{bucket}/{key}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses(
        (status = 200, description = "Object removed"),
        (status = 404, description = "Missing or masked object")
    )
)]
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.objects.delete(&auth, &bucket, &key).await?;
    Ok(Json(serde_json::json!({ "message": "Successfully deleted" })))
}

/// `DELETE /storage/v1/object/{bucket}` -- batch delete.
#[utoipa::path(
    delete,
    path = "/storage/v1/object/{bucket}",
    tag = "Object",
    operation_id = "DeleteObjects",
    request_body = String,
    params(("bucket" = String, Path, description = "Bucket name")),
    responses((status = 200, description = "Rows actually removed"))
)]
pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<Json<Vec<ObjectRecord>>, ApiError> {
    let body: BatchDeleteBody = parse_json(&body)?;
    let removed = state
        .objects
        .batch_delete(&auth, &bucket, &body.prefixes)
        .await?;
    Ok(Json(removed))
}

// -- Copy / move --------------------------------------------------------------

/// `POST /storage/v1/object/copy` -- copy an object.
#[utoipa::path(
    post,
    path = "/storage/v1/object/copy",
    tag = "Object",
    operation_id = "CopyObject",
    request_body = String,
    responses(
        (status = 200, description = "Copy created"),
        (status = 409, description = "Destination exists")
    )
)]
pub async fn copy_object(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<crate::services::object::UploadOutcome>, ApiError> {
    let body: CopyMoveBody = parse_json(&body)?;
    let dst_bucket = body
        .destination_bucket
        .as_deref()
        .unwrap_or(&body.bucket_id);
    let outcome = state
        .objects
        .copy(
            &auth,
            &body.bucket_id,
            &body.source_key,
            dst_bucket,
            &body.destination_key,
            body.copy_metadata.unwrap_or(true),
            body.metadata,
        )
        .await?;
    Ok(Json(outcome))
}

/// `POST /storage/v1/object/move` -- move an object.
#[utoipa::path(
    post,
    path = "/storage/v1/object/move",
    tag = "Object",
    operation_id = "MoveObject",
    request_body = String,
    responses(
        (status = 200, description = "Object moved"),
        (status = 409, description = "Destination exists")
    )
)]
pub async fn move_object(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<crate::services::object::UploadOutcome>, ApiError> {
    let body: CopyMoveBody = parse_json(&body)?;
    let dst_bucket = body
        .destination_bucket
        .as_deref()
        .unwrap_or(&body.bucket_id);
    let outcome = state
        .objects
        .r#move(
            &auth,
            &body.bucket_id,
            &body.source_key,
            dst_bucket,
            &body.destination_key,
        )
        .await?;
    Ok(Json(outcome))
}

// -- Signed URLs --------------------------------------------------------------

/// `POST /storage/v1/object/sign/{bucket}/{key}` -- mint a download URL.
#[utoipa::path(
    post,
    path = "/storage/v1/object/sign/{bucket}/{key}",
    tag = "Object",
    operation_id = "SignDownloadUrl",
    request_body = String,
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
    ),
    responses((status = 200, description = "Signed URL"))
)]
pub async fn create_signed_download(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: SignBody = parse_json(&body)?;

    // Minting requires the caller to be able to read the object.
    state.objects.info(&auth, &bucket, &key).await?;

    let token = state
        .tokens
        .sign_download(&format!("{bucket}/{key}"), body.expires_in)?;
    let url = format!("{}?token={token}", signed_path(&bucket, &key));
    Ok(Json(serde_json::json!({ "signedURL": url })))
}

/// `GET /storage/v1/object/sign/{bucket}/{key}?token=` -- redeem a
/// download token.
#[utoipa::path(
    get,
    path = "/storage/v1/object/sign/{bucket}/{key}",
    tag = "Object",
    operation_id = "RedeemSignedDownload",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
        ("token" = String, Query, description = "Signed token"),
    ),
    responses(
        (status = 200, description = "Object bytes"),
        (status = 403, description = "Expired or invalid token")
    )
)]
pub async fn redeem_signed_download(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(param): Query<TokenParam>,
) -> Result<Response, ApiError> {
    let claims = state
        .tokens
        .verify(&param.token, TokenKind::Download)
        .map_err(|err| ApiError::AccessDenied {
            message: err.to_string(),
        })?;
    if claims.url != format!("{bucket}/{key}") {
        return Err(ApiError::AccessDenied {
            message: "token does not match this object".to_string(),
        });
    }

    let (record, content) = state.objects.signed_download(&bucket, &key).await?;
    Ok(content_response(&record, content, false))
}

/// `POST /storage/v1/object/upload/sign/{bucket}/{key}` -- mint an
/// upload URL (fixed two-hour lifetime).
#[utoipa::path(
    post,
    path = "/storage/v1/object/upload/sign/{bucket}/{key}",
    tag = "Object",
    operation_id = "SignUploadUrl",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
        ("x-upsert" = Option<bool>, Header, description = "Permit overwrite on redeem"),
    ),
    responses((status = 200, description = "Signed upload URL"))
)]
pub async fn create_signed_upload(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let upsert = truthy_header(&headers, "x-upsert");

    crate::services::object::ObjectService::validate_object_name(&key)?;
    let bucket_record = state.buckets.get_by_name(&bucket).await?;
    state
        .objects
        .check_insert(
            &auth,
            crate::metadata::store::ProposedObject {
                bucket_id: bucket_record.id,
                name: key.clone(),
                owner_id: auth.user_id.clone(),
            },
        )
        .await?;

    let token = state.tokens.sign_upload(
        &format!("{bucket}/{key}"),
        auth.user_id.clone(),
        upsert,
    )?;
    let url = format!("{}?token={token}", signed_path(&bucket, &key));
    Ok(Json(serde_json::json!({ "url": url, "token": token })))
}

/// `PUT /storage/v1/object/sign/{bucket}/{key}?token=` -- redeem an
/// upload token.
#[utoipa::path(
    put,
    path = "/storage/v1/object/sign/{bucket}/{key}",
    tag = "Object",
    operation_id = "RedeemSignedUpload",
    params(
        ("bucket" = String, Path, description = "Bucket name"),
        ("key" = String, Path, description = "Object path"),
        ("token" = String, Query, description = "Signed token"),
    ),
    responses(
        (status = 200, description = "Object stored"),
        (status = 403, description = "Expired or invalid token")
    )
)]
pub async fn redeem_signed_upload(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(param): Query<TokenParam>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, ApiError> {
    let claims = state
        .tokens
        .verify(&param.token, TokenKind::Upload)
        .map_err(|err| ApiError::AccessDenied {
            message: err.to_string(),
        })?;
    if claims.url != format!("{bucket}/{key}") {
        return Err(ApiError::AccessDenied {
            message: "token does not match this object".to_string(),
        });
    }

    let (data, content_type) = extract_upload(&headers, request).await?;

    // Possession of the token is the authorization; the insert policy
    // was checked when the token was minted.
    let mut redeem_auth = AuthContext::service();
    redeem_auth.user_id = claims.owner_id.clone();

    let outcome = state
        .objects
        .upload(
            &redeem_auth,
            &bucket,
            &key,
            data,
            UploadRequest {
                content_type,
                user_metadata: HashMap::new(),
                owner: claims.owner_id,
                upsert: claims.upsert.unwrap_or(false),
            },
        )
        .await?;
    Ok(with_etag(&outcome, Json(&outcome).into_response()))
}
