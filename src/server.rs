//! TCP server for handling chat connections.
//!
//! Accepts connections and hands each one to its own task running the
//! session handler. The accept loop never waits on a session.

use crate::config::Config;
use crate::session::{handle_session, SessionSettings};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Server instance
pub struct Server {
    config: Config,
    settings: Arc<SessionSettings>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let settings = Arc::new(SessionSettings::from(&config));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            settings,
            connection_limit,
        }
    }

    /// Bind the configured address and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    ///
    /// When every session slot is taken the new connection is closed right
    /// away; the loop itself never waits for a slot.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let permit = match self.connection_limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                peer = %peer,
                                max_connections = self.config.max_connections,
                                "Connection limit reached, closing connection"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    info!(peer = %peer, "Client connected");

                    let settings = Arc::clone(&self.settings);

                    tokio::spawn(async move {
                        match handle_session(stream, peer, &settings).await {
                            Ok(end) => debug!(peer = %peer, ?end, "Session finished"),
                            Err(e) => debug!(peer = %peer, error = %e, "Session error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}
