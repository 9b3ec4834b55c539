//! Read-through proxy of the remote catalog, plus import and the editor
//! registration view. Catalog rows pass through untouched.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::routing::get;
use axum::{Json, Router};
use patterns_core::params::Query;
use patterns_core::registration::{self, Registrations};
use patterns_core::{PatternQuery, Role};
use serde_json::Value;

use crate::server::auth::Caller;
use crate::server::error::ApiError;
use crate::server::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/manager/patterns", get(list_patterns))
        .route("/manager/patterns/{id}", get(get_pattern).post(import_pattern))
        .route("/manager/categories", get(list_categories))
        .route("/manager/types", get(list_types))
        .route("/manager/search", get(search))
        .route("/registrations", get(registrations))
}

fn parse(raw: Option<String>) -> Query {
    Query::parse(raw.as_deref().unwrap_or(""))
}

async fn list_patterns(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Value>>, ApiError> {
    let args = PatternQuery::from_query(&parse(raw));
    let rows = state.blocking(move |s| s.api.get_patterns_raw(&args)).await?;
    Ok(Json(rows))
}

async fn get_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state
        .blocking(move |s| s.api.get_pattern_raw(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("pattern {} not found", id)))
}

async fn import_pattern(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    caller.require(Role::Edit)?;
    tracing::info!("[SERVER] {} imports pattern {}", caller.user, id);
    let body = state.blocking(move |s| s.api.import_pattern(id)).await?;
    Ok(Json(body))
}

async fn list_categories(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Value>>, ApiError> {
    Ok(Json(state.blocking(|s| s.api.get_categories_raw()).await?))
}

async fn list_types(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Value>>, ApiError> {
    Ok(Json(state.blocking(|s| s.api.get_types_raw()).await?))
}

async fn search(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Value>>, ApiError> {
    let query = parse(raw);
    let q = query
        .get("q")
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("missing parameter: q".to_string()))?;
    let args = PatternQuery::from_query(&query);
    let rows = state.blocking(move |s| s.api.search_raw(&q, &args)).await?;
    Ok(Json(rows))
}

async fn registrations(State(state): State<Arc<AppState>>) -> Result<Json<Registrations>, ApiError> {
    let regs = state
        .blocking(|s| registration::collect(&s.api, s.settings.max_register()))
        .await?;
    Ok(Json(regs))
}
