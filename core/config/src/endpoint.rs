//! HTTP endpoint serving the client configuration.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use gearshed_common::{Error, Result};

use crate::env::EnvSource;
use crate::loader::load_client_config;

/// Path the client configuration is served at.
pub const CONFIG_ROUTE: &str = "/api/config";

/// Router with `GET /api/config`.
///
/// Responds 200 with the active provider's client configuration, or 500
/// with `{"error": message}` when it cannot be loaded.
pub fn router(env: Arc<dyn EnvSource>) -> Router {
    Router::new()
        .route(CONFIG_ROUTE, get(config_handler))
        .with_state(env)
}

async fn config_handler(State(env): State<Arc<dyn EnvSource>>) -> Response {
    match load_client_config(env.as_ref()) {
        Ok(config) => (StatusCode::OK, Json(config)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to load client configuration");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Serve the endpoint on `listener` until the task is cancelled.
pub async fn serve(listener: TcpListener, env: Arc<dyn EnvSource>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, route = CONFIG_ROUTE, "Serving client configuration");
    axum::serve(listener, router(env))
        .await
        .map_err(|e| Error::Backend(format!("Config endpoint stopped: {}", e)))
}
