use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use patterns_core::{MediaError, Role};
use serde::Deserialize;
use serde_json::json;

use crate::server::auth::Caller;
use crate::server::error::ApiError;
use crate::server::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/sideload-media", post(sideload))
}

#[derive(Debug, Deserialize)]
pub struct SideloadRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pattern_id: Option<u64>,
}

async fn sideload(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<SideloadRequest>,
) -> Result<Response, ApiError> {
    caller.require(Role::Edit)?;
    if let Some(id) = req.pattern_id {
        tracing::debug!("[SERVER] sideload for pattern {}", id);
    }
    let content = req.content;
    match state.blocking(move |s| s.sideloader.sideload(&content)).await? {
        Ok(report) => Ok(Json(report).into_response()),
        Err(MediaError::EmptyContent) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "message": MediaError::EmptyContent.to_string(),
            })),
        )
            .into_response()),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}
