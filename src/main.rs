//! xxe-targets: HTTP endpoints for exercising XML entity handling
//!
//! Two targets:
//! - Raw input: echo the request body, then its non-blank text nodes
//! - URL or body: echo the document, then the re-serialized DOM, with
//!   external entity expansion switched on by `xxe=true`
//!
//! Plus request bins that capture out-of-band requests, and redirects to
//! local files and cloud metadata addresses.
//!
//! Features:
//! - HTTP/1.1 with keep-alive, pipelining and chunked bodies
//! - Documents fetched from http(s), file URLs or local paths
//! - Configuration via CLI arguments or TOML file

mod bins;
mod capture;
mod config;
mod fetch;
mod protocol;
mod server;
mod targets;
mod xml;

use config::Config;
use server::Server;
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
        listen = %config.listen,
        workers = ?config.workers,
        raw_input = %config.raw_input_route,
        url_or_body = %config.url_or_body_route,
        max_body_size = config.max_body_size,
        fetch_timeout = ?config.fetch_timeout,
        "Starting xxe-targets server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config)?;
    runtime.block_on(server.run())
}
