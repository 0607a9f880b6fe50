//! hello-capture: TLS-terminating front end that records each connection's
//! ClientHello and attaches it to the HTTP requests that connection carries.
//!
//! # Architecture Overview
//!
//! ```text
//!  Client                 ┌───────────────────────────────────────────────────┐
//!  ──────────────────────▶│ net::listener ─▶ capture::interceptor ─▶ net::tls  │
//!                         │                    │ peek + rewind                 │
//!                         │                    ▼                               │
//!                         │              capture::cache ◀── http::lookup       │
//!                         │                                   │                │
//!                         │                                   ▼                │
//!  ◀──────────────────────│          inspection handler | http::proxy ───────┼──▶ Upstream
//!                         └───────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use hello_capture::config::{load_config, AppConfig};
use hello_capture::lifecycle::startup;
use hello_capture::observability::logging;

#[derive(Parser)]
#[command(name = "hello-capture")]
#[command(about = "Capture TLS ClientHellos and attach them to HTTP requests", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };

    logging::init_logging(&config.observability.log_filter);
    tracing::info!("hello-capture v{} starting", env!("CARGO_PKG_VERSION"));

    startup::run(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
