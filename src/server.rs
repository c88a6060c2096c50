//! HTTP front end for the two stages.
//!
//! Each POST route takes the same JSON event an invocation would and answers
//! with the invocation's status code and body.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/load` | Run the load stage for one individual |
//! | `POST` | `/ingest` | Run the search stage for one individual |
//! | `GET`  | `/health` | Health check (returns version) |

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::invoke::{invoke_ingest, invoke_load, Invocation};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
}

/// Build the router. Exposed for in-process tests.
pub fn router(config: Arc<Config>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/load", post(handle_load))
        .route("/ingest", post(handle_ingest))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { config })
}

/// Serve on `[server] bind` until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()));

    tracing::info!(bind = %bind_addr, "newswatch server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

impl IntoResponse for Invocation {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}

async fn handle_load(State(state): State<AppState>, Json(event): Json<Value>) -> Invocation {
    invoke_load(&state.config, &event).await
}

async fn handle_ingest(State(state): State<AppState>, Json(event): Json<Value>) -> Invocation {
    invoke_ingest(&state.config, &event).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
