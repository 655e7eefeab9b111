//! Server module
//!
//! Binds the listener and runs the accept loop. Each accepted connection
//! is served on the local task set; the service itself is immutable and
//! shared by reference.

mod connection;
mod listener;

pub use connection::ConnectionSettings;
pub use listener::create_reusable_listener;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::app::Service;
use crate::config::Config;
use crate::logger;

/// Accept connections until the process is stopped.
pub async fn run(
    listener: TcpListener,
    service: Arc<Service>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = ConnectionSettings {
        max_connections: config.server.max_connections,
        timeout_secs: config.server.connection_timeout,
        log_accepts: config.logging.access_log,
    };
    let active_connections = Arc::new(AtomicUsize::new(0));

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                connection::accept_connection(
                    stream,
                    peer_addr,
                    &service,
                    &active_connections,
                    settings,
                );
            }
            Err(e) => {
                logger::log_error(&format!("Failed to accept connection: {e}"));
            }
        }
    }
}
