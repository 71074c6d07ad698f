//! Request authentication: subject-claim extraction.
//!
//! The reference deployment terminates real JWT verification in front of the
//! service; here only the `sub` claim is extracted from the bearer token's
//! payload segment and placed on the request. A missing or malformed token
//! is rejected with 400. `/healthz` bypasses the check entirely so probes
//! need no credentials.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use ulid::Ulid;

use crate::error::ApiError;

/// Per-request context derived from headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Subject claim from the bearer token.
    pub sub: String,
    /// Request ID for correlation (from `x-correlator` or generated).
    pub request_id: String,
}

fn extract_sub(request: &Request<Body>) -> Result<String, ApiError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::invalid_argument("invalid Bearer token in Authorization header"))?;

    let mut parts = token.split('.');
    let (_header, payload) = match (parts.next(), parts.next()) {
        (Some(h), Some(p)) if !p.is_empty() => (h, p),
        _ => return Err(ApiError::invalid_argument("invalid JWT token format")),
    };

    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| ApiError::invalid_argument("failed to decode JWT payload"))?;

    let claims: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|_| ApiError::invalid_argument("failed to parse JWT payload"))?;

    claims
        .get("sub")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::invalid_argument("sub claim not found in JWT"))
}

/// Middleware extracting the JWT subject claim into a [`RequestContext`].
pub async fn jwt_auth(mut request: Request<Body>, next: Next) -> Response {
    if request.uri().path() == "/healthz" {
        return next.run(request).await;
    }

    let request_id = request
        .headers()
        .get("x-correlator")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Ulid::new().to_string(), str::to_string);

    match extract_sub(&request) {
        Ok(sub) => {
            request
                .extensions_mut()
                .insert(RequestContext { sub, request_id });
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e.message(), "request rejected");
            e.into_response()
        }
    }
}
