//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every storage endpoint to its handler and
//! returns a ready-to-serve [`axum::Router`].  Fixed route segments
//! (`list`, `copy`, `move`, `sign`, `info`, `public`, `authenticated`,
//! `upload`) take priority over the `{bucket}` capture, which is why
//! those names are reserved by bucket validation.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, head, options, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::auth;
use crate::errors::generate_request_id;
use crate::handlers::{bucket, object, resumable};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI ------------------------------------------------------------------

/// OpenAPI document assembled from the handler annotations.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "pailstore",
        description = "Self-hostable object storage service"
    ),
    paths(
        bucket::list_buckets,
        bucket::create_bucket,
        bucket::get_bucket,
        bucket::update_bucket,
        bucket::delete_bucket,
        bucket::empty_bucket,
        object::list_objects,
        object::download,
        object::public_download,
        object::head_object,
        object::get_object_info,
        object::update_object_metadata,
        object::upload_object,
        object::delete_object,
        object::batch_delete,
        object::copy_object,
        object::move_object,
        object::create_signed_download,
        object::redeem_signed_download,
        object::create_signed_upload,
        object::redeem_signed_upload,
        resumable::options_handler,
        resumable::create_session,
        resumable::head_session,
        resumable::patch_session,
        resumable::delete_session,
    ),
    tags(
        (name = "Bucket", description = "Bucket management"),
        (name = "Object", description = "Object I/O"),
        (name = "Resumable", description = "Resumable uploads")
    )
)]
struct ApiDoc;

/// Swagger UI HTML page that loads the spec from `/openapi.json`.
const SWAGGER_UI_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>pailstore API - Swagger UI</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css">
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"></script>
  <script>
    SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui',
      presets: [SwaggerUIBundle.presets.apis], layout: 'BaseLayout' });
  </script>
</body>
</html>"#;

async fn openapi_handler() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Router -------------------------------------------------------------------

/// Build the axum [`Router`] with all storage routes.
///
/// The returned router is ready to be passed to `axum::serve`.  Routes
/// are conditionally registered based on `config.observability`.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;
    let health_check_enabled = state.config.observability.health_check;

    // Phase 1: build the stateful router (Router<Arc<AppState>>).
    let mut stateful = Router::new().route("/health", get(health_check));

    if metrics_enabled {
        stateful = stateful.route("/metrics", get(metrics_handler));
    }
    if health_check_enabled {
        stateful = stateful
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler));
    }

    stateful = stateful
        // Bucket endpoints.
        .route(
            "/storage/v1/bucket",
            get(bucket::list_buckets).post(bucket::create_bucket),
        )
        .route(
            "/storage/v1/bucket/:id",
            get(bucket::get_bucket)
                .put(bucket::update_bucket)
                .delete(bucket::delete_bucket),
        )
        .route("/storage/v1/bucket/:id/empty", post(bucket::empty_bucket))
        // Object endpoints with fixed first segments.
        .route("/storage/v1/object/list/:bucket", post(object::list_objects))
        .route("/storage/v1/object/copy", post(object::copy_object))
        .route("/storage/v1/object/move", post(object::move_object))
        .route(
            "/storage/v1/object/info/:bucket/*key",
            get(object::get_object_info).put(object::update_object_metadata),
        )
        .route(
            "/storage/v1/object/public/:bucket/*key",
            get(object::public_download),
        )
        .route(
            "/storage/v1/object/authenticated/:bucket/*key",
            get(object::download),
        )
        .route(
            "/storage/v1/object/sign/:bucket/*key",
            post(object::create_signed_download)
                .get(object::redeem_signed_download)
                .put(object::redeem_signed_upload),
        )
        .route(
            "/storage/v1/object/upload/sign/:bucket/*key",
            post(object::create_signed_upload),
        )
        // Object endpoints keyed by bucket/path.
        .route("/storage/v1/object/:bucket", delete(object::batch_delete))
        .route(
            "/storage/v1/object/:bucket/*key",
            get(object::download)
                .head(object::head_object)
                .post(object::upload_object)
                .put(object::upload_object)
                .delete(object::delete_object),
        )
        // Resumable protocol.
        .route(
            "/storage/v1/upload/resumable",
            options(resumable::options_handler).post(resumable::create_session),
        )
        .route(
            "/storage/v1/upload/resumable/:id",
            head(resumable::head_session)
                .patch(resumable::patch_session)
                .put(resumable::patch_session)
                .delete(resumable::delete_session),
        )
        // API docs.
        .route("/openapi.json", get(openapi_handler))
        .route("/docs", get(|| async { Html(SWAGGER_UI_HTML) }));

    // Phase 2: apply state and layers (converts to Router<()>).
    // Layer ordering: auth runs closest to the handlers, then common
    // headers, with metrics outermost to capture the full lifecycle.
    let mut router = stateful
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth::auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // Browsers talk to this API directly; public downloads and the
        // resumable protocol both need permissive CORS.
        .layer(CorsLayer::permissive());

    if metrics_enabled {
        router = router.layer(middleware::from_fn(metrics_middleware));
    }

    // Disable the default 2MB body size limit (objects can be large;
    // the services enforce the configured caps).
    router.layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds standard response headers to every response: `x-request-id`,
/// `Date`, and `Server`.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // The error renderer may have set a request id already.
    if !headers.contains_key("x-request-id") {
        let request_id = generate_request_id();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("pailstore"));

    response
}

// -- Health check endpoints ---------------------------------------------------

/// `GET /health` -- JSON health status with component checks.
///
/// When `observability.health_check` is enabled, probes the metadata
/// store and storage backend and reports per-component latency.
/// Returns 503 with `"status":"degraded"` if any check fails.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.config.observability.health_check {
        return (StatusCode::OK, Json(serde_json::json!({"status": "ok"})));
    }

    let meta_start = Instant::now();
    let meta_ok = state.db.list_buckets(1, 0, "").await.is_ok();
    let meta_latency = meta_start.elapsed().as_millis() as u64;

    let storage_start = Instant::now();
    let storage_ok = state.storage.exists("__health_probe__").await.is_ok();
    let storage_latency = storage_start.elapsed().as_millis() as u64;

    let all_ok = meta_ok && storage_ok;
    let status_str = if all_ok { "ok" } else { "degraded" };
    let http_status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let component = |ok: bool, latency: u64| {
        serde_json::json!({
            "status": if ok { "ok" } else { "error" },
            "latency_ms": latency,
        })
    };

    let body = serde_json::json!({
        "status": status_str,
        "checks": {
            "metadata": component(meta_ok, meta_latency),
            "storage": component(storage_ok, storage_latency),
        }
    });

    (http_status, Json(body))
}

/// `GET /healthz` -- liveness probe; 200 with empty body.
async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /readyz` -- readiness probe; 200 if both stores respond.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let meta_ok = state.db.list_buckets(1, 0, "").await.is_ok();
    let storage_ok = state.storage.exists("__health_probe__").await.is_ok();

    if meta_ok && storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RolePolicyConfig};
    use crate::metadata::sqlite::SqliteMetadataStore;
    use crate::storage::memory::MemoryBackend;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    fn base_config() -> Config {
        Config::default()
    }

    fn owner_policy_config() -> Config {
        let mut config = base_config();
        config.policy.enabled = true;
        config.policy.roles.insert(
            "authenticated".to_string(),
            RolePolicyConfig {
                select: "owner_id = auth.user_id".to_string(),
                insert: "new_row.owner_id = auth.user_id".to_string(),
                delete: "owner_id = auth.user_id".to_string(),
            },
        );
        config
    }

    fn test_state(config: Config) -> Arc<AppState> {
        let db: Arc<dyn crate::metadata::store::MetadataStore> =
            Arc::new(SqliteMetadataStore::new(":memory:").expect("in-memory store"));
        let storage: Arc<dyn crate::storage::backend::StorageBackend> =
            Arc::new(MemoryBackend::new());
        Arc::new(AppState::build(config, db, storage).expect("state"))
    }

    fn test_app(config: Config) -> (Router, Arc<AppState>) {
        let state = test_state(config);
        (app(state.clone()), state)
    }

    async fn send(router: &Router, req: HttpRequest<Body>) -> axum::response::Response {
        router.clone().oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: axum::response::Response) -> bytes::Bytes {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn mint_jwt(config: &Config, sub: &str) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({
                "sub": sub,
                "role": "authenticated",
                "exp": chrono::Utc::now().timestamp() + 3600,
            }),
            &jsonwebtoken::EncodingKey::from_secret(config.auth.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    fn json_req(method: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    // -- E1: public bucket, upload, public download ---------------------------

    #[tokio::test]
    async fn e1_public_upload_download() {
        let (router, _state) = test_app(base_config());

        let resp = send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "photos", "public": true}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"name": "photos"}));

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/photos/a.txt")
                .header("content-type", "text/plain")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("etag").unwrap(),
            "\"49f68a5c8493ec2c0bf489821c21fc3b\""
        );
        let body = body_json(resp).await;
        assert_eq!(body["etag"], "49f68a5c8493ec2c0bf489821c21fc3b");
        assert_eq!(body["key"], "photos/a.txt");

        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/public/photos/a.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain"
        );
        assert_eq!(&body_bytes(resp).await[..], b"hi");
    }

    // -- E2: RLS masks foreign reads as 404 -----------------------------------

    #[tokio::test]
    async fn e2_rls_masks_foreign_reads() {
        let config = owner_policy_config();
        let (router, _state) = test_app(config.clone());

        send(
            &router,
            json_req("POST", "/storage/v1/bucket", serde_json::json!({"name": "p"})),
        )
        .await;

        let token_u = mint_jwt(&config, "user-u");
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/p/a")
                .header("content-type", "text/plain")
                .header("authorization", format!("Bearer {token_u}"))
                .body(Body::from("mine"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Owner reads their object.
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/p/a")
                .header("authorization", format!("Bearer {token_u}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // A different user sees 404, not 403.
        let token_v = mint_jwt(&config, "user-v");
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/p/a")
                .header("authorization", format!("Bearer {token_v}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "not_found");
    }

    // -- E3: resumable upload in two chunks -----------------------------------

    fn tus_metadata(bucket: &str, object: &str) -> String {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD;
        format!(
            "bucketName {}, objectName {}",
            b64.encode(bucket),
            b64.encode(object)
        )
    }

    #[tokio::test]
    async fn e3_resumable_two_chunks() {
        let (router, _state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "vault", "public": true}),
            ),
        )
        .await;

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/upload/resumable")
                .header("tus-resumable", "1.0.0")
                .header("upload-length", "10")
                .header("upload-metadata", tus_metadata("vault", "data.bin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let location = resp
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(resp.headers().get("upload-offset").unwrap(), "0");

        // First chunk [0, 5).
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .header("content-type", "application/offset+octet-stream")
                .header("upload-offset", "0")
                .body(Body::from("01234"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers().get("upload-offset").unwrap(), "5");

        // HEAD reports the committed offset.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("upload-offset").unwrap(), "5");
        assert_eq!(resp.headers().get("upload-length").unwrap(), "10");

        // Wrong offset is a conflict.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .header("content-type", "application/offset+octet-stream")
                .header("upload-offset", "0")
                .body(Body::from("01234"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // Correct second chunk completes and finalizes.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("PATCH")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .header("content-type", "application/offset+octet-stream")
                .header("upload-offset", "5")
                .body(Body::from("56789"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // Session is gone.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Object holds all ten bytes.
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/public/vault/data.bin")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&body_bytes(resp).await[..], b"0123456789");
    }

    #[tokio::test]
    async fn e3b_version_mismatch_is_412() {
        let (router, _state) = test_app(base_config());
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/upload/resumable")
                .header("tus-resumable", "0.2.2")
                .header("upload-length", "10")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    }

    // -- E4: declared length vs bucket limit ----------------------------------

    #[tokio::test]
    async fn e4_resumable_respects_bucket_limit() {
        let (router, _state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "capped", "file_size_limit": 1024}),
            ),
        )
        .await;

        let create = |length: u64| {
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/upload/resumable")
                .header("tus-resumable", "1.0.0")
                .header("upload-length", length.to_string())
                .header("upload-metadata", tus_metadata("capped", "big.bin"))
                .body(Body::empty())
                .unwrap()
        };

        let resp = send(&router, create(2048)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let resp = send(&router, create(512)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    // -- E5: bucket_not_empty then empty then delete ---------------------------

    #[tokio::test]
    async fn e5_delete_requires_empty() {
        let (router, _state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "photos"}),
            ),
        )
        .await;
        send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/photos/a.txt")
                .header("content-type", "text/plain")
                .body(Body::from("hi"))
                .unwrap(),
        )
        .await;

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("DELETE")
                .uri("/storage/v1/bucket/photos")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "bucket_not_empty");

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/bucket/photos/empty")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("DELETE")
                .uri("/storage/v1/bucket/photos")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // -- E6: expiry sweep --------------------------------------------------------

    #[tokio::test]
    async fn e6_sweeper_reclaims_expired_sessions() {
        let (router, state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "vault"}),
            ),
        )
        .await;

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/upload/resumable")
                .header("tus-resumable", "1.0.0")
                .header("upload-length", "10")
                .header("upload-metadata", tus_metadata("vault", "slow.bin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let location = resp
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let session_id = location.rsplit('/').next().unwrap().to_string();

        // Rewrite the row with an already-lapsed expiry.
        let mut record = state.db.get_session(&session_id).await.unwrap().unwrap();
        state.db.delete_session(&session_id).await.unwrap();
        record.expires_at = "2000-01-01T00:00:00.000Z".to_string();
        state.db.insert_session(record).await.unwrap();

        // Expired but unswept: HEAD reports 410.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::GONE);

        // Sweep removes the row and the staging bytes.
        let now = crate::metadata::store::now_rfc3339();
        let cleaned = state.uploads.sweep_once(&now).await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(state.db.get_session(&session_id).await.unwrap().is_none());
        assert!(!state
            .storage
            .exists(&format!("uploads/{session_id}"))
            .await
            .unwrap());

        // A swept session is indistinguishable from an unknown one.
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri(&location)
                .header("tus-resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- Signed URLs ------------------------------------------------------------

    #[tokio::test]
    async fn signed_download_roundtrip_and_tamper() {
        let (router, _state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "private"}),
            ),
        )
        .await;
        send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/private/secret.txt")
                .header("content-type", "text/plain")
                .body(Body::from("ssh"))
                .unwrap(),
        )
        .await;

        let resp = send(
            &router,
            json_req(
                "POST",
                "/storage/v1/object/sign/private/secret.txt",
                serde_json::json!({"expiresIn": 60}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let signed_url = body_json(resp).await["signedURL"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = send(
            &router,
            HttpRequest::builder()
                .uri(&signed_url)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&body_bytes(resp).await[..], b"ssh");

        // Tampering with the token is rejected.
        let tampered = format!("{signed_url}x");
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri(&tampered)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn signed_upload_roundtrip() {
        let (router, _state) = test_app(base_config());

        send(
            &router,
            json_req(
                "POST",
                "/storage/v1/bucket",
                serde_json::json!({"name": "drop", "public": true}),
            ),
        )
        .await;

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/upload/sign/drop/incoming.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let url = body_json(resp).await["url"].as_str().unwrap().to_string();

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("PUT")
                .uri(&url)
                .header("content-type", "text/plain")
                .body(Body::from("delivered"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/public/drop/incoming.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(&body_bytes(resp).await[..], b"delivered");
    }

    // -- Assorted wire checks ----------------------------------------------------

    #[tokio::test]
    async fn error_envelope_shape() {
        let (router, _state) = test_app(base_config());
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/bucket/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["error"], "not_found");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn upload_then_head_reports_metadata() {
        let (router, _state) = test_app(base_config());
        send(
            &router,
            json_req("POST", "/storage/v1/bucket", serde_json::json!({"name": "b"})),
        )
        .await;
        send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/b/f.txt")
                .header("content-type", "text/plain")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await;

        let resp = send(
            &router,
            HttpRequest::builder()
                .method("HEAD")
                .uri("/storage/v1/object/b/f.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-length").unwrap(), "5");
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
        assert!(resp.headers().contains_key("etag"));
        assert!(resp.headers().contains_key("last-modified"));
    }

    #[tokio::test]
    async fn multipart_upload_uses_file_part() {
        let (router, _state) = test_app(base_config());
        send(
            &router,
            json_req("POST", "/storage/v1/bucket", serde_json::json!({"name": "b"})),
        )
        .await;

        let boundary = "XBOUNDARYX";
        let multipart_body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"f.txt\"\r\n\
             Content-Type: text/markdown\r\n\r\n\
             # heading\r\n\
             --{boundary}--\r\n"
        );
        let resp = send(
            &router,
            HttpRequest::builder()
                .method("POST")
                .uri("/storage/v1/object/b/f.md")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(multipart_body))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/object/info/b/f.md")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let body = body_json(resp).await;
        // The part's own content type wins over sniffing.
        assert_eq!(body["mime_type"], "text/markdown");
        assert_eq!(body["size"], 9);
    }

    #[tokio::test]
    async fn batch_delete_reports_removed_rows() {
        let (router, _state) = test_app(base_config());
        send(
            &router,
            json_req("POST", "/storage/v1/bucket", serde_json::json!({"name": "b"})),
        )
        .await;
        for name in ["x.txt", "y.txt"] {
            send(
                &router,
                HttpRequest::builder()
                    .method("POST")
                    .uri(format!("/storage/v1/object/b/{name}"))
                    .header("content-type", "text/plain")
                    .body(Body::from("1"))
                    .unwrap(),
            )
            .await;
        }

        let resp = send(
            &router,
            json_req(
                "DELETE",
                "/storage/v1/object/b",
                serde_json::json!({"prefixes": ["x.txt", "missing.txt"]}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let removed = body_json(resp).await;
        assert_eq!(removed.as_array().unwrap().len(), 1);
        assert_eq!(removed[0]["name"], "x.txt");
    }

    #[tokio::test]
    async fn healthz_and_metrics_routes_respect_config() {
        let (router, _state) = test_app(base_config());
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let mut config = base_config();
        config.observability.health_check = false;
        config.observability.metrics = false;
        let (router, _state) = test_app(config);
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_api_key_is_denied() {
        let (router, _state) = test_app(base_config());
        let resp = send(
            &router,
            HttpRequest::builder()
                .uri("/storage/v1/bucket")
                .header("apikey", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
