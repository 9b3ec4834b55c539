//! Local proxy server. Routes live under `/patterns/v1`; rehosted media is
//! served from `/uploads`.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use patterns_core::Role;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub const API_PREFIX: &str = "/patterns/v1";

pub fn build(state: Arc<AppState>) -> Router {
    let uploads = state.services.settings.read(|s| s.uploads_dir());
    Router::new()
        .nest(API_PREFIX, routes::router())
        .nest_service("/uploads", ServeDir::new(uploads))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            warmup_after_response,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Editors get a background warmup queued once their request is answered.
/// The scheduler skips it when the cache is fresh.
async fn warmup_after_response(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let editor = auth::identify(req.headers(), &state)
        .map(|c| c.role >= Role::Edit)
        .unwrap_or(false);
    let response = next.run(req).await;
    if editor {
        if let Some(scheduler) = &state.scheduler {
            scheduler.submit_warmup();
        }
    }
    response
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> Result<(), String> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| format!("Invalid bind address {}: {}", bind, e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Cannot listen on {}: {}", addr, e))?;
    tracing::info!("[SERVER] listening on http://{}{}", addr, API_PREFIX);

    axum::serve(listener, build(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    if let Some(scheduler) = state.scheduler.clone() {
        let _ = tokio::task::spawn_blocking(move || scheduler.shutdown()).await;
    }
    tracing::info!("[SERVER] stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[SERVER] failed to install Ctrl-C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => tracing::warn!("[SERVER] failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("[SERVER] shutdown signal received");
}
