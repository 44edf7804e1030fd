use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub data_file: PathBuf,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

/// Build the Axum router for the read API.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/livedata", get(livedata_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve the read API on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Read API listening on http://{}", addr);
    info!("Serving data from: {}", state.data_file.display());

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Read API stopped.");
    Ok(())
}

/// GET /api/livedata
///
/// The persisted array exactly as stored. A missing file and an empty array
/// are distinct: the first is a 404, the second a 200 with `[]`.
async fn livedata_handler(State(state): State<Arc<ApiState>>) -> ApiResult {
    let text = match tokio::fs::read_to_string(&state.data_file).await {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Data file not found. The collector may not have run yet." })),
            ));
        }
        Err(e) => {
            warn!("Reading {} failed: {}", state.data_file.display(), e);
            return Err(unexpected(e.to_string()));
        }
    };

    serde_json::from_str::<Value>(&text).map(Json).map_err(|e| {
        warn!("Data file {} is not valid JSON: {}", state.data_file.display(), e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Error decoding JSON. The data file might be corrupted or empty." })),
        )
    })
}

/// GET /api/health
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Helpers ──

fn unexpected(details: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "An unexpected error occurred.", "details": details })),
    )
}
