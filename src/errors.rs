//! Wire-facing error types.
//!
//! Every variant maps to a stable error code and HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(ApiError::NotFound { .. })` and get the JSON envelope
//! `{"statusCode": int, "error": code, "message": string}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// Storage API error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed JSON, missing required header or field.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Bucket name is empty or reserved.
    #[error("invalid bucket name: {name}")]
    InvalidName { name: String },

    /// A bucket with the requested name or id already exists.
    #[error("bucket {bucket} already exists")]
    BucketExists { bucket: String },

    /// Delete of a populated bucket without force.
    #[error("bucket {bucket} is not empty")]
    BucketNotEmpty { bucket: String },

    /// Public download requested against a private bucket.
    #[error("bucket is not public")]
    NotPublic,

    /// Bucket, object, or upload session absent.  Also returned for rows
    /// masked by a row-level policy, so callers cannot probe existence.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// A policy predicate denied the operation.
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// Upload without upsert while the target object exists.
    #[error("object already exists")]
    ObjectExists,

    /// Resumable chunk offset disagrees with the server's.
    #[error("upload offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    /// Resumable session past its expiry.
    #[error("upload session has expired")]
    SessionExpired,

    /// Resumable protocol version is not 1.0.0.
    #[error("unsupported resumable protocol version")]
    VersionMismatch,

    /// Payload exceeds the bucket or service size limit.
    #[error("payload exceeds the maximum allowed size of {limit} bytes")]
    TooLarge { limit: u64 },

    /// Content type rejected by the bucket's MIME policy.
    #[error("content type {content_type} is not allowed")]
    MimeNotAllowed { content_type: String },

    /// Catch-all for unexpected internal errors.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Return the stable wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest { .. } => "invalid_request",
            ApiError::InvalidName { .. } => "invalid_name",
            ApiError::BucketExists { .. } => "bucket_exists",
            ApiError::BucketNotEmpty { .. } => "bucket_not_empty",
            ApiError::NotPublic => "not_public",
            ApiError::NotFound { .. } => "not_found",
            ApiError::AccessDenied { .. } => "access_denied",
            ApiError::ObjectExists => "object_exists",
            ApiError::OffsetMismatch { .. } => "offset_mismatch",
            ApiError::SessionExpired => "session_expired",
            ApiError::VersionMismatch => "version_mismatch",
            ApiError::TooLarge { .. } => "too_large",
            ApiError::MimeNotAllowed { .. } => "mime_not_allowed",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            ApiError::BucketExists { .. } => StatusCode::BAD_REQUEST,
            ApiError::BucketNotEmpty { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotPublic => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            ApiError::ObjectExists => StatusCode::CONFLICT,
            ApiError::OffsetMismatch { .. } => StatusCode::CONFLICT,
            ApiError::SessionExpired => StatusCode::GONE,
            ApiError::VersionMismatch => StatusCode::PRECONDITION_FAILED,
            ApiError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MimeNotAllowed { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Shorthand for a `not_found` with a named resource.
    pub fn not_found(resource: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource: resource.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ApiError::Internal(ref err) = self {
            tracing::error!(error = %err, "internal error");
        }

        let body = serde_json::json!({
            "statusCode": status.as_u16(),
            "error": self.code(),
            "message": self.to_string(),
        });

        (
            status,
            [("x-request-id", generate_request_id())],
            Json(body),
        )
            .into_response()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ApiError::InvalidRequest {
                message: "x".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("object").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::AccessDenied {
                message: "x".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ApiError::ObjectExists.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::OffsetMismatch {
                expected: 5,
                got: 0
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::SessionExpired.status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::VersionMismatch.status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ApiError::TooLarge { limit: 1024 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::MimeNotAllowed {
                content_type: "application/pdf".into()
            }
            .status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::NotPublic.code(), "not_public");
        assert_eq!(
            ApiError::BucketExists { bucket: "b".into() }.code(),
            "bucket_exists"
        );
        assert_eq!(ApiError::SessionExpired.code(), "session_expired");
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("boom")).code(),
            "internal"
        );
    }

    #[test]
    fn request_id_is_hex() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
