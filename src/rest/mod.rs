// rest/mod.rs — Distributor HTTP surface.
//
// Axum server exposing the wire-stable routes:
//   POST   /se/grid/distributor/session
//   POST   /se/grid/distributor/node
//   DELETE /se/grid/distributor/node/{id}
//   POST   /se/grid/distributor/node/{id}/drain
//   GET    /se/grid/distributor/status

pub mod routes;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::GridContext;

pub async fn start_rest_server(ctx: Arc<GridContext>) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", ctx.config.port).parse()?;
    let router = build_router(ctx);

    info!("distributor API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<GridContext>) -> Router {
    Router::new()
        .route(
            "/se/grid/distributor/session",
            post(routes::create_session),
        )
        .route("/se/grid/distributor/node", post(routes::register_node))
        .route(
            "/se/grid/distributor/node/{id}",
            delete(routes::remove_node),
        )
        .route(
            "/se/grid/distributor/node/{id}/drain",
            post(routes::drain_node),
        )
        .route("/se/grid/distributor/status", get(routes::status))
        .with_state(ctx)
}
