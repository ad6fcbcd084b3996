//! Access key check for the admin API
//!
//! Every protected request must carry `x-access-key` equal to the
//! configured key. An empty configured key rejects everything.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use std::sync::Arc;
use tracing::warn;

use super::models::ErrorResponse;
use super::AppState;

pub const ACCESS_KEY_HEADER: &str = "x-access-key";

pub async fn require_access_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let provided = request
        .headers()
        .get(ACCESS_KEY_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(key) if !state.access_key.is_empty() && key == state.access_key => {
            Ok(next.run(request).await)
        }
        _ => {
            warn!(path = %request.uri().path(), "Rejected admin request with bad access key");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Missing or invalid access key".to_string(),
                    code: Some("UNAUTHORIZED".to_string()),
                }),
            ))
        }
    }
}
