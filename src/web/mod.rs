use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod handlers;
pub mod ws;

pub use ws::{ClientMessage, Connection, ConnectionHub, ServerMessage, UploadMode, UploadOutcome};

use crate::AppContext;

pub async fn start_server(ctx: Arc<AppContext>, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = handlers::router(ctx);

    info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
