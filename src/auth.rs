//! Caller identity: JWT and API-key parsing.
//!
//! Every request is resolved to a single [`AuthContext`] at the HTTP
//! boundary; downstream services never look at raw claims again.  A
//! bearer JWT yields a user context, a known API key yields a role
//! context, and the service key yields a context with `bypass` set so
//! policy enforcement is skipped.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::AuthConfig;
use crate::errors::ApiError;
use crate::AppState;

/// Role name that grants policy bypass.
pub const SERVICE_ROLE: &str = "service_role";

/// Role assumed when no credentials are presented.
pub const ANON_ROLE: &str = "anon";

/// The parsed identity of a caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Subject claim, if the caller presented a user token.
    pub user_id: Option<String>,
    /// Email claim, if present.
    pub email: Option<String>,
    /// Role the caller acts as.
    pub role: String,
    /// Remaining claims, kept opaque.
    pub claims: HashMap<String, serde_json::Value>,
    /// Privileged callers skip policy enforcement.
    pub bypass: bool,
}

impl AuthContext {
    /// Context for a request with no credentials.
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            email: None,
            role: ANON_ROLE.to_string(),
            claims: HashMap::new(),
            bypass: false,
        }
    }

    /// Context for the service role.
    pub fn service() -> Self {
        Self {
            user_id: None,
            email: None,
            role: SERVICE_ROLE.to_string(),
            claims: HashMap::new(),
            bypass: true,
        }
    }

    /// Context for a named user with the `authenticated` role.
    #[cfg(test)]
    pub fn user(id: &str) -> Self {
        Self {
            user_id: Some(id.to_string()),
            email: None,
            role: "authenticated".to_string(),
            claims: HashMap::new(),
            bypass: false,
        }
    }
}

/// Claim shape accepted from bearer tokens.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: Option<String>,
    email: Option<String>,
    role: Option<String>,
    #[allow(dead_code)]
    exp: i64,
    #[serde(flatten)]
    rest: HashMap<String, serde_json::Value>,
}

/// Resolve request headers to an [`AuthContext`].
///
/// Precedence: bearer JWT, then `apikey` header, then anonymous.  A
/// malformed or expired JWT is rejected rather than downgraded.
pub fn authenticate(headers: &HeaderMap, config: &AuthConfig) -> Result<AuthContext, ApiError> {
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return parse_bearer(bearer, config);
    }

    if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
        return parse_api_key(key, config);
    }

    Ok(AuthContext::anonymous())
}

/// Parse and verify a bearer token, accepting either a JWT or a raw API key.
fn parse_bearer(bearer: &str, config: &AuthConfig) -> Result<AuthContext, ApiError> {
    // SDK clients send the API key as a bearer token too.
    if constant_time_eq(bearer, &config.service_key) || constant_time_eq(bearer, &config.anon_key) {
        return parse_api_key(bearer, config);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;

    let data = decode::<TokenClaims>(
        bearer,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|err| {
        debug!(error = %err, "rejected bearer token");
        ApiError::AccessDenied {
            message: "invalid or expired token".to_string(),
        }
    })?;

    let role = data
        .claims
        .role
        .unwrap_or_else(|| "authenticated".to_string());
    let bypass = role == SERVICE_ROLE;

    Ok(AuthContext {
        user_id: data.claims.sub,
        email: data.claims.email,
        role,
        claims: data.claims.rest,
        bypass,
    })
}

/// Map a raw API key to its role context.
fn parse_api_key(key: &str, config: &AuthConfig) -> Result<AuthContext, ApiError> {
    if constant_time_eq(key, &config.service_key) {
        return Ok(AuthContext::service());
    }
    if constant_time_eq(key, &config.anon_key) {
        return Ok(AuthContext::anonymous());
    }
    Err(ApiError::AccessDenied {
        message: "unknown api key".to_string(),
    })
}

/// Constant-time string comparison for API keys.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// -- Middleware ---------------------------------------------------------------

/// Paths that skip credential parsing entirely.
const AUTH_SKIP_PATHS: &[&str] = &[
    "/health",
    "/healthz",
    "/readyz",
    "/metrics",
    "/docs",
    "/openapi.json",
];

/// Resolve the caller's identity and stash it in request extensions.
///
/// Requests without credentials proceed anonymously; the policy layer
/// decides what an anonymous caller may touch.  Presenting bad
/// credentials is an error, not a downgrade.
pub async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path();

    if AUTH_SKIP_PATHS.iter().any(|skip| path == *skip) {
        return Ok(next.run(req).await);
    }

    let auth = authenticate(req.headers(), &state.config.auth)?;
    req.extensions_mut().insert(auth);
    Ok(next.run(req).await)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret-that-is-long-enough-0123".to_string(),
            anon_key: "anon-key".to_string(),
            service_key: "service-key".to_string(),
        }
    }

    fn mint_jwt(config: &AuthConfig, claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn no_credentials_is_anonymous() {
        let headers = HeaderMap::new();
        let auth = authenticate(&headers, &test_config()).unwrap();
        assert_eq!(auth.role, ANON_ROLE);
        assert!(!auth.bypass);
        assert!(auth.user_id.is_none());
    }

    #[test]
    fn service_api_key_sets_bypass() {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_static("service-key"));
        let auth = authenticate(&headers, &test_config()).unwrap();
        assert_eq!(auth.role, SERVICE_ROLE);
        assert!(auth.bypass);
    }

    #[test]
    fn unknown_api_key_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_static("nope"));
        let err = authenticate(&headers, &test_config()).unwrap_err();
        assert_eq!(err.code(), "access_denied");
    }

    #[test]
    fn bearer_jwt_yields_user_context() {
        let config = test_config();
        let token = mint_jwt(
            &config,
            serde_json::json!({
                "sub": "user-1",
                "email": "u@example.com",
                "role": "authenticated",
                "exp": future_exp(),
                "app_metadata": {"plan": "free"},
            }),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );

        let auth = authenticate(&headers, &config).unwrap();
        assert_eq!(auth.user_id.as_deref(), Some("user-1"));
        assert_eq!(auth.email.as_deref(), Some("u@example.com"));
        assert_eq!(auth.role, "authenticated");
        assert!(!auth.bypass);
        assert!(auth.claims.contains_key("app_metadata"));
    }

    #[test]
    fn service_role_jwt_sets_bypass() {
        let config = test_config();
        let token = mint_jwt(
            &config,
            serde_json::json!({"role": "service_role", "exp": future_exp()}),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );

        let auth = authenticate(&headers, &config).unwrap();
        assert!(auth.bypass);
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let config = test_config();
        let token = mint_jwt(
            &config,
            serde_json::json!({"sub": "user-1", "exp": chrono::Utc::now().timestamp() - 120}),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );

        let err = authenticate(&headers, &config).unwrap_err();
        assert_eq!(err.code(), "access_denied");
    }

    #[test]
    fn tampered_jwt_is_rejected() {
        let config = test_config();
        let mut token = mint_jwt(
            &config,
            serde_json::json!({"sub": "user-1", "exp": future_exp()}),
        );
        token.push('x');
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );

        assert!(authenticate(&headers, &config).is_err());
    }

    #[test]
    fn bearer_api_key_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer service-key"),
        );
        let auth = authenticate(&headers, &test_config()).unwrap();
        assert!(auth.bypass);
    }
}
