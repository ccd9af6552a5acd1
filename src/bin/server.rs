//! Farmsync reference server
//!
//! A minimal farm API that accepts the record writes the sync engine pushes.
//! Records live in memory only.
//!
//! # Configuration
//!
//! Environment variables:
//! - `FARMSYNC_SERVER_PORT`: Port to listen on (default: 8080)
//! - `FARMSYNC_SERVER_TOKENS`: Comma separated bearer tokens (default: none, auth disabled)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `POST|PUT|DELETE /api/{resource}`: Record writes

use farmsync::server::{router, AppState, TokenSet};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    tokens: TokenSet,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("FARMSYNC_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let tokens = std::env::var("FARMSYNC_SERVER_TOKENS")
            .map(|list| TokenSet::parse(&list))
            .unwrap_or_default();

        Self { port, tokens }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farmsync=info,farmsync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    if config.tokens.is_empty() {
        tracing::warn!("No FARMSYNC_SERVER_TOKENS set, accepting unauthenticated writes");
    } else {
        tracing::info!("Loaded {} token(s)", config.tokens.len());
    }

    let app = router(AppState::new(config.tokens)).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
