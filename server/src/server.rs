use std::net::SocketAddr;

use axum::{extract::Request, Router};
use tracing::info;

/// Bind `0.0.0.0:<port>` and serve the router until the process exits.
pub async fn run_server(app: Router, port: u16) -> color_eyre::Result<()> {
    let app = app
        .layer(sentry_tower::SentryHttpLayer::with_transaction())
        .layer(sentry_tower::NewSentryLayer::<Request>::new_from_top());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🐳 listening http://localhost:{}", port);
    axum::serve(listener, app).await?;

    Ok(())
}
