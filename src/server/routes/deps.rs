use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use patterns_core::deps::DependencyDescriptor;
use patterns_core::{EnsureAllReport, Role, StatusReport};
use serde::Deserialize;

use crate::server::auth::Caller;
use crate::server::error::ApiError;
use crate::server::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dependencies", get(list_dependencies))
        .route("/deps-status", get(status))
        .route("/deps-install", post(install))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub no_cache: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InstallRequest {
    #[serde(default)]
    pub slugs: Vec<String>,
}

fn wants_fresh(flag: Option<&str>) -> bool {
    matches!(
        flag.map(|f| f.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

async fn list_dependencies(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DependencyDescriptor>>, ApiError> {
    Ok(Json(state.blocking(|s| s.api.get_dependencies()).await?))
}

async fn status(
    State(state): State<Arc<AppState>>,
    _caller: Caller,
    Query(params): Query<StatusParams>,
) -> Result<Json<StatusReport>, ApiError> {
    let fresh = wants_fresh(params.no_cache.as_deref());
    let report = state
        .blocking(move |s| {
            if fresh {
                s.resolver.refresh_status()
            } else {
                s.resolver.get_status()
            }
        })
        .await?;
    Ok(Json(report))
}

/// Body is optional; `{"slugs": [...]}` limits the run to those slugs.
async fn install(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<EnsureAllReport>, ApiError> {
    caller.require(Role::Admin)?;
    let req: InstallRequest = if body.iter().all(u8::is_ascii_whitespace) {
        InstallRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    tracing::info!("[SERVER] {} ensures dependencies {:?}", caller.user, req.slugs);
    let report = state
        .blocking(move |s| s.resolver.ensure_all_ready(&req.slugs))
        .await?;
    Ok(Json(report))
}
