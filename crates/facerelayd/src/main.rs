use anyhow::{Context, Result};
use facerelay_core::{HttpTransport, Relay};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facerelayd starting");

    let config = config::Config::load()?;
    let transport = HttpTransport::new(&config.backend_url, config.timeout())?;
    let relay = Relay::new(transport, config.relay_options());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = %config.backend_url,
        timeout_secs = config.timeout_secs,
        result_key = %config.result_key,
        "facerelayd ready"
    );

    let app = server::router(Arc::new(server::AppState::new(relay, config)));

    // Keep serving until signaled
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("facerelayd shutting down");

    Ok(())
}
