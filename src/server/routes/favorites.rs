use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use patterns_core::FavoriteAction;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::auth::Caller;
use crate::server::error::ApiError;
use crate::server::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/favorites", get(list_favorites).post(update_favorites))
}

#[derive(Debug, Deserialize)]
pub struct FavoriteRequest {
    pub id: u64,
    #[serde(default)]
    pub action: FavoriteAction,
}

async fn list_favorites(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<Json<Vec<u64>>, ApiError> {
    Ok(Json(state.services.favorites.get(&caller.user)))
}

async fn update_favorites(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<FavoriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = caller.user;
    let list = state
        .blocking(move |s| s.favorites.update(&user, req.action, req.id))
        .await??;
    Ok(Json(json!({ "success": true, "favorites": list })))
}
