//! linechat: a line-oriented TCP chat server
//!
//! Clients send newline-terminated messages and get one reply line each:
//! - Keywords: `hello`, `bye`
//! - Slash-commands: `/time`, `/quit`, `/echo <text>`
//! - Plain text is echoed back and appended to a per-IP log file
//!
//! Features:
//! - Sliding idle timeout per connection
//! - Oversized message rejection without dropping the client
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod server;
mod session;
mod sink;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        log_dir = %config.log_dir.display(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        max_message_len = config.max_message_len,
        max_connections = config.max_connections,
        "Starting linechat server"
    );

    Server::new(config).run().await
}
