//! sort-server binary
//!
//! Accepts integer lists over TCP and replies with each list sorted.
//! Configuration via CLI arguments or TOML file.

use sort_server::config::{Architecture, Config};
use sort_server::{BlockingServer, NonBlockingServer};
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
        architecture = ?config.architecture,
        protocol = ?config.protocol,
        workers = config.pool_size(),
        sort = ?config.sort,
        max_message_bytes = config.max_message_bytes,
        "Starting sort server"
    );

    match config.architecture {
        Architecture::Blocking => run_blocking(&config),
        Architecture::Nonblocking => run_nonblocking(&config),
    }
}

/// Run with a reader and writer thread per connection
fn run_blocking(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using blocking architecture");
    BlockingServer::new(config)?.run()?;
    Ok(())
}

/// Run with mio event loops (epoll on Linux, kqueue on macOS)
fn run_nonblocking(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using non-blocking architecture");
    NonBlockingServer::new(config)?.run()?;
    Ok(())
}
