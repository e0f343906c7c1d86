//! HTTP surface: wire parsing and dispatch into the services.

pub mod bucket;
pub mod object;
pub mod resumable;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::errors::ApiError;

/// Parse a JSON request body into `T`, mapping failures to the wire
/// `invalid_request` envelope.  An empty body parses as `T::default()`
/// when requested via [`parse_json_or_default`].
pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| ApiError::InvalidRequest {
        message: format!("malformed JSON body: {err}"),
    })
}

/// Like [`parse_json`], but tolerates an entirely empty body.
pub fn parse_json_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    parse_json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn malformed_json_is_invalid_request() {
        let err = parse_json::<HashMap<String, String>>(&Bytes::from_static(b"{nope"))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn empty_body_defaults() {
        let map: HashMap<String, String> = parse_json_or_default(&Bytes::new()).unwrap();
        assert!(map.is_empty());
    }
}
