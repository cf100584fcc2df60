use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::engine::ItemValue;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Error body for rejected item requests
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/items
#[tracing::instrument(skip(state))]
async fn items(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    (StatusCode::OK, Json(snapshot.as_ref().clone()))
}

fn routing_result(
    result: Result<(), Box<dyn std::error::Error + Send>>,
) -> axum::response::Response {
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Handler for POST /v1/items/:item/command (plain-text command body)
#[tracing::instrument(skip(state))]
async fn item_command(
    State(state): State<Arc<AppState>>,
    Path(item): Path<String>,
    command: String,
) -> impl IntoResponse {
    tracing::debug!("Handling command {} for {}", command, item);
    routing_result(state.engine.send_command(item, command.trim().to_string()))
}

/// Handler for POST /v1/items/:item/state (plain-text state body)
#[tracing::instrument(skip(state))]
async fn item_state(
    State(state): State<Arc<AppState>>,
    Path(item): Path<String>,
    value: String,
) -> impl IntoResponse {
    tracing::debug!("Handling state update {} for {}", value, item);
    routing_result(
        state
            .engine
            .post_update(item, ItemValue::String(value.trim().to_string())),
    )
}

/// Handler for DELETE /v1/items/:item
#[tracing::instrument(skip(state))]
async fn item_remove(
    State(state): State<Arc<AppState>>,
    Path(item): Path<String>,
) -> impl IntoResponse {
    tracing::debug!("Handling removal of {}", item);
    routing_result(state.engine.remove_item(item))
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/items", get(items))
        .route("/v1/items/:item", delete(item_remove))
        .route("/v1/items/:item/command", post(item_command))
        .route("/v1/items/:item/state", post(item_state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., "127.0.0.1")
/// * `port` - The port to listen on (e.g., 8565)
/// * `engine` - The engine whose items are exposed
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
