use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::AppState;

/// Alternative to the bearer header for admin tools that cannot set
/// `Authorization`.
pub const ADMIN_KEY_HEADER: &str = "X-Giftkey-Admin-Key";

/// Gate for administrative routes (key creation/deletion, sweeps, clears).
/// The key lifecycle and relay code never sees the secret; only this layer
/// compares it. With no GIFTKEY_API_KEY configured every request passes.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(request).await;
    };

    let presented = presented_key(request.headers());
    match presented {
        Some(k) if constant_time_eq(k.as_bytes(), expected.as_bytes()) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized — valid GIFTKEY_API_KEY required for this endpoint"})),
        )
            .into_response(),
    }
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer.or_else(|| headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()))
}
