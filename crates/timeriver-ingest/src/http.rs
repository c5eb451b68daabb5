//! HTTP listener (`www`): health checks and server info.

use std::os::unix::io::AsFd;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, Level};

use crate::config::ListenConfig;
use crate::service::ServiceContext;

const SERVICE_NAME: &str = "timeriver";

/// Serve HTTP on `listener` until `stop` is cancelled.
///
/// axum takes ownership of its listener, so it gets a duplicate descriptor
/// while this task keeps `listener` alive until axum has finished.
pub(crate) async fn serve(listener: Arc<TcpListener>, stop: CancellationToken, ctx: ServiceContext) {
    let owned = match duplicate(&listener) {
        Ok(owned) => owned,
        Err(e) => {
            error!(error = %e, "Failed to duplicate HTTP listener");
            return;
        }
    };

    let app = create_router(ctx);
    let shutdown = async move { stop.cancelled().await };
    if let Err(e) = axum::serve(owned, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "HTTP server error");
    }

    debug!("HTTP server stopped");
    drop(listener);
}

fn duplicate(listener: &TcpListener) -> std::io::Result<TcpListener> {
    let fd = listener.as_fd().try_clone_to_owned()?;
    let std_listener = std::net::TcpListener::from(fd);
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// Create the router with all routes and middleware
pub(crate) fn create_router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/api/v1/server-info", get(server_info_handler))
        .with_state(ctx)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

/// Response for the server info endpoint
#[derive(Debug, Serialize)]
struct ServerInfo {
    service: &'static str,
    version: &'static str,
    listen: ListenConfig,
    active_connections: usize,
}

/// Liveness check (for load balancers)
async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

async fn server_info_handler(State(ctx): State<ServiceContext>) -> impl IntoResponse {
    Json(ServerInfo {
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        listen: ListenConfig::clone(&ctx.listen),
        active_connections: ctx.drain.active_connections(),
    })
}
