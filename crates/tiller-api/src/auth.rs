//! Request authentication.
//!
//! Non-public endpoints accept `Authorization: Bearer <key>` or
//! `?apikey=<key>`; the key resolves to a [`Scope`] handlers check against
//! the affected app. Local mode bypasses authentication entirely.

use std::collections::HashMap;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use tiller_keys::Scope;

use crate::ApiCtx;

/// Pull the API key out of the bearer header or the `apikey` query param.
pub fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    query.get("apikey").cloned()
}

/// Authenticate a request. Returns the key's scope, or the error response
/// to send (401 for missing/unknown keys, 500 for store failures).
pub fn authenticate(
    ctx: &ApiCtx,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Scope, Response> {
    if ctx.store.config_bool("localMode") {
        return Ok(Scope::All);
    }

    let token = extract_token(headers, query)
        .ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;
    match ctx.keys.validate(&token) {
        Ok(Some(scope)) => Ok(scope),
        Ok(None) => Err(StatusCode::UNAUTHORIZED.into_response()),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()),
    }
}
