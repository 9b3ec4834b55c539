pub mod deps;
pub mod favorites;
pub mod health;
pub mod manager;
pub mod media;

use std::sync::Arc;

use axum::Router;

use super::state::AppState;

/// Everything mounted under `/patterns/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(health::router())
        .merge(manager::router())
        .merge(favorites::router())
        .merge(deps::router())
        .merge(media::router())
}
