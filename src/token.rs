//! Signed URL tokens.
//!
//! Compact HMAC-SHA256 tokens authorizing a single download or upload
//! of one object path.  Wire shape: `base64url(claims).base64url(sig)`
//! where `sig = HMAC-SHA256(secret, payload)`.  Download tokens carry a
//! caller-supplied TTL; upload tokens always live for two hours.
//! Verification failures are distinguished so the surface can report
//! expiry separately from tampering.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Fixed lifetime of upload tokens, in seconds.
pub const UPLOAD_TOKEN_TTL_SECS: u64 = 2 * 60 * 60;

/// Minimum length of the signing secret, in bytes.
const MIN_SECRET_LEN: usize = 32;

/// What a signed token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Download,
    Upload,
}

/// Claims carried by a signed URL token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedToken {
    /// `{bucket}/{object_name}` the token is bound to.
    pub url: String,
    /// Operation the token authorizes.
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// Owner the redeemed operation acts as, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Whether an upload token permits overwriting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upsert: Option<bool>,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Why verification failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token authorizes a different operation")]
    WrongType,
    #[error("token is malformed")]
    Malformed,
}

/// Issues and verifies signed URL tokens.
///
/// The secret is process-wide and injected at construction.
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Build a codec from the signing secret.  Rejects secrets shorter
    /// than 32 bytes.
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "signing secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            );
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// Issue a download token for `url` valid for `ttl_secs`.
    pub fn sign_download(&self, url: &str, ttl_secs: u64) -> anyhow::Result<String> {
        self.sign(url, TokenKind::Download, None, None, ttl_secs)
    }

    /// Issue an upload token for `url` with the fixed two-hour lifetime.
    pub fn sign_upload(
        &self,
        url: &str,
        owner_id: Option<String>,
        upsert: bool,
    ) -> anyhow::Result<String> {
        self.sign(
            url,
            TokenKind::Upload,
            owner_id,
            Some(upsert),
            UPLOAD_TOKEN_TTL_SECS,
        )
    }

    fn sign(
        &self,
        url: &str,
        kind: TokenKind,
        owner_id: Option<String>,
        upsert: Option<bool>,
        ttl_secs: u64,
    ) -> anyhow::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = SignedToken {
            url: url.to_string(),
            kind,
            owner_id,
            upsert,
            iat: now,
            exp: now + ttl_secs as i64,
        };

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload = b64.encode(serde_json::to_vec(&claims)?);
        let signature = b64.encode(self.hmac(payload.as_bytes()));
        Ok(format!("{payload}.{signature}"))
    }

    /// Verify a token and require it to authorize `expected` operations.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<SignedToken, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let presented = b64.decode(signature).map_err(|_| TokenError::Malformed)?;
        let computed = self.hmac(payload.as_bytes());
        if !constant_time_eq(&computed, &presented) {
            return Err(TokenError::BadSignature);
        }

        // Only signed payloads get parsed.
        let decoded = b64.decode(payload).map_err(|_| TokenError::Malformed)?;
        let claims: SignedToken =
            serde_json::from_slice(&decoded).map_err(|_| TokenError::Malformed)?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        if claims.kind != expected {
            return Err(TokenError::WrongType);
        }
        Ok(claims)
    }

    /// Compute HMAC-SHA256 over `data` with the codec secret.
    fn hmac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Compare two signatures in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

// ── Tests ───────────────────────────────────────────────────────────
