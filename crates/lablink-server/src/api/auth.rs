//! Request authentication for the HTTP API.

use super::ApiError;
use crate::session::{LeaseInfo, SessionLease};
use axum::http::{header, HeaderMap};
use lablink_core::header_candidates;

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Backend routes: the header must equal the shared secret exactly.
pub fn require_backend(headers: &HeaderMap, api_secret: &str) -> Result<(), ApiError> {
    match authorization(headers) {
        Some(value) if value == api_secret => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Client routes: the header must carry the token of the active, unexpired
/// lease, verbatim or after a `Bearer ` scheme. Returns the matched lease.
pub fn require_client(headers: &HeaderMap, lease: &SessionLease) -> Result<LeaseInfo, ApiError> {
    authorization(headers)
        .and_then(|value| header_candidates(value).find_map(|token| lease.validated(token)))
        .ok_or(ApiError::Unauthorized)
}
