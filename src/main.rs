//! linemux: a line-oriented TCP server
//!
//! One thread waits for socket readiness and multiplexes every client
//! connection through it:
//! - Incoming bytes are split into newline-terminated lines
//! - Each connection gets its own handler context
//! - Overlong lines are delivered as fragments or close the connection
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        handler = ?config.handler,
        max_connections = config.max_connections,
        max_line_size = config.max_line_size,
        overflow_policy = ?config.overflow_policy,
        idle_timeout = ?config.idle_timeout,
        "Starting linemux server"
    );

    runtime::run(config)?;
    Ok(())
}
