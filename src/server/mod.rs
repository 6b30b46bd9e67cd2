pub mod routes;
pub mod state;
pub mod ws;

use std::net::SocketAddr;
use std::str::FromStr;

pub use state::AppState;

/// Server error types for proper error handling
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    BadAddress(String),

    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("server runtime error: {0}")]
    RuntimeError(String),
}

/// Starts the HTTP/WebSocket server on the configured listen address.
pub async fn start_server(state: AppState, listen_addr: &str) -> Result<(), ServerError> {
    let addr = SocketAddr::from_str(listen_addr)
        .map_err(|_| ServerError::BadAddress(listen_addr.to_string()))?;
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
