// =============================================================================
// Admin token check for the market-switching surface
// =============================================================================
//
// `POST /session/reset` takes `Authorization: Bearer <token>`; the WebSocket
// feed takes `?token=`. Both are checked against `KLINE_ADMIN_TOKEN`, read per
// request. An unset token locks both out.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

const TOKEN_ENV: &str = "KLINE_ADMIN_TOKEN";

#[cfg(test)]
pub(crate) const TEST_TOKEN: &str = "test-admin-token";

/// True when `presented` equals the configured admin token. Every byte is
/// folded in regardless of where the first mismatch sits.
pub fn validate_token(presented: &str) -> bool {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("{TOKEN_ENV} is not set; rejecting admin request");
        return false;
    }
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Handler argument that admits the request only with a valid bearer token.
pub struct AdminGuard;

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AdminGuard {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();

        if validate_token(presented) {
            Ok(AdminGuard)
        } else {
            warn!(path = %parts.uri.path(), "admin token rejected");
            let body = Json(serde_json::json!({ "error": "missing or invalid admin token" }));
            Err((StatusCode::FORBIDDEN, body).into_response())
        }
    }
}
