//! Startup orchestration.
//!
//! Order: metrics exporter, listener bind, signal handler, accept loop.
//! Configuration is validated by the loader before this runs, so any
//! error here is fatal.

use std::net::SocketAddr;

use crate::config::AppConfig;
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::shutdown_on_signal;
use crate::net::listener::Listener;
use crate::observability::metrics;

/// Start every subsystem and serve until a termination signal arrives.
pub async fn run(config: AppConfig) -> Result<(), ServerError> {
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        max_client_hello_size = config.client_hello.max_client_hello_size,
        cache_max_entries = config.cache.max_entries,
        cache_ttl_secs = config.cache.ttl_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(config)?;

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(shutdown_on_signal(shutdown));

    server.run(listener, server_shutdown).await
}
