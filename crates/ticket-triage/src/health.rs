//! Liveness endpoint for container orchestrators.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::info;

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Bind and serve until the process exits.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health endpoint listening");
    axum::serve(listener, router()).await?;
    Ok(())
}
