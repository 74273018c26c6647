//! HTTP server bootstrap for the command surface.

use anyhow::{Context, Result};
use axum::Router;
use tracing::info;

use crate::api::{self, SharedState};

pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!(port, "vigil API listening");
    axum::serve(listener, build_router(state))
        .await
        .context("API server failed")?;
    Ok(())
}
