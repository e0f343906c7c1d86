//! Bucket endpoints under `/storage/v1/bucket`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Deserialize;

use super::{parse_json, parse_json_or_default};
use crate::auth::AuthContext;
use crate::errors::ApiError;
use crate::metadata::store::{BucketPatch, BucketRecord};
use crate::services::bucket::CreateBucketRequest;
use crate::AppState;

/// Query parameters for listing buckets.
#[derive(Debug, Default, Deserialize)]
pub struct ListBucketsParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub search: Option<String>,
}

/// Body of `POST /bucket`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketBody {
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub public: bool,
    pub file_size_limit: Option<u64>,
    pub allowed_mime_types: Option<Vec<String>>,
}

/// Body of `PUT /bucket/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateBucketBody {
    pub public: Option<bool>,
    pub file_size_limit: Option<u64>,
    pub allowed_mime_types: Option<Vec<String>>,
}

/// `GET /storage/v1/bucket` -- list buckets.
#[utoipa::path(
    get,
    path = "/storage/v1/bucket",
    tag = "Bucket",
    operation_id = "ListBuckets",
    params(
        ("limit" = Option<u32>, Query, description = "Page size (default 100)"),
        ("offset" = Option<u32>, Query, description = "Page offset"),
        ("search" = Option<String>, Query, description = "Substring filter"),
    ),
    responses((status = 200, description = "Buckets, name-ascending"))
)]
pub async fn list_buckets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBucketsParams>,
) -> Result<Json<Vec<BucketRecord>>, ApiError> {
    let buckets = state
        .buckets
        .list(params.limit, params.offset, params.search.as_deref())
        .await?;
    Ok(Json(buckets))
}

/// `POST /storage/v1/bucket` -- create a bucket.
#[utoipa::path(
    post,
    path = "/storage/v1/bucket",
    tag = "Bucket",
    operation_id = "CreateBucket",
    request_body = String,
    responses(
        (status = 200, description = "Bucket created"),
        (status = 400, description = "Invalid or duplicate name")
    )
)]
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body: CreateBucketBody = parse_json(&body)?;
    let bucket = state
        .buckets
        .create(
            CreateBucketRequest {
                id: body.id,
                name: body.name,
                public: body.public,
                file_size_limit: body.file_size_limit,
                allowed_mime_types: body.allowed_mime_types,
            },
            auth.user_id.clone(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "name": bucket.name })))
}

/// `GET /storage/v1/bucket/{id}` -- fetch one bucket.
#[utoipa::path(
    get,
    path = "/storage/v1/bucket/{id}",
    tag = "Bucket",
    operation_id = "GetBucket",
    params(("id" = String, Path, description = "Bucket id")),
    responses(
        (status = 200, description = "Bucket"),
        (status = 404, description = "Unknown bucket")
    )
)]
pub async fn get_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BucketRecord>, ApiError> {
    Ok(Json(state.buckets.get(&id).await?))
}

/// `PUT /storage/v1/bucket/{id}` -- update bucket settings.
#[utoipa::path(
    put,
    path = "/storage/v1/bucket/{id}",
    tag = "Bucket",
    operation_id = "UpdateBucket",
    request_body = String,
    params(("id" = String, Path, description = "Bucket id")),
    responses(
        (status = 200, description = "Updated bucket"),
        (status = 404, description = "Unknown bucket")
    )
)]
pub async fn update_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<BucketRecord>, ApiError> {
    let body: UpdateBucketBody = parse_json_or_default(&body)?;
    let bucket = state
        .buckets
        .update(
            &id,
            BucketPatch {
                public: body.public,
                file_size_limit: body.file_size_limit,
                allowed_mime_types: body.allowed_mime_types,
            },
        )
        .await?;
    Ok(Json(bucket))
}

/// `DELETE /storage/v1/bucket/{id}` -- delete an empty bucket.
#[utoipa::path(
    delete,
    path = "/storage/v1/bucket/{id}",
    tag = "Bucket",
    operation_id = "DeleteBucket",
    params(("id" = String, Path, description = "Bucket id")),
    responses(
        (status = 200, description = "Bucket deleted"),
        (status = 400, description = "Bucket not empty"),
        (status = 404, description = "Unknown bucket")
    )
)]
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.buckets.delete(&id, false).await?;
    Ok(Json(serde_json::json!({ "message": "Successfully deleted" })))
}

/// `POST /storage/v1/bucket/{id}/empty` -- remove every object.
#[utoipa::path(
    post,
    path = "/storage/v1/bucket/{id}/empty",
    tag = "Bucket",
    operation_id = "EmptyBucket",
    params(("id" = String, Path, description = "Bucket id")),
    responses(
        (status = 200, description = "Bucket emptied"),
        (status = 404, description = "Unknown bucket")
    )
)]
pub async fn empty_bucket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.buckets.empty(&id).await?;
    Ok(Json(serde_json::json!({ "message": "Successfully emptied" })))
}
