// Connection handling module
// Accepts and serves a single TCP connection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

use crate::app::Service;
use crate::logger;

/// Per-connection settings pulled out of the configuration at startup.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_connections: Option<u64>,
    pub timeout_secs: u64,
    pub log_accepts: bool,
}

/// Accept a connection, enforcing the connection limit, then serve it in
/// a spawned task.
pub fn accept_connection(
    stream: tokio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    service: &Arc<Service>,
    conn_counter: &Arc<AtomicUsize>,
    settings: ConnectionSettings,
) {
    // Increment first, then check, so two racing accepts cannot both pass
    let prev_count = conn_counter.fetch_add(1, Ordering::SeqCst);

    if let Some(max_conn) = settings.max_connections {
        if prev_count >= usize::try_from(max_conn).unwrap_or(usize::MAX) {
            conn_counter.fetch_sub(1, Ordering::SeqCst);
            logger::log_warning(&format!(
                "Max connections reached: {prev_count}/{max_conn}. Connection rejected."
            ));
            drop(stream);
            return;
        }
    }

    if settings.log_accepts {
        logger::log_connection_accepted(&peer_addr);
    }

    handle_connection(
        stream,
        peer_addr,
        Arc::clone(service),
        Arc::clone(conn_counter),
        settings,
    );
}

/// Serve one connection on the local task set.
///
/// Wraps the stream for hyper, serves HTTP/1.1 requests through the
/// service's dispatch, applies the connection timeout, and decrements the
/// connection counter when done.
fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    service: Arc<Service>,
    conn_counter: Arc<AtomicUsize>,
    settings: ConnectionSettings,
) {
    tokio::task::spawn_local(async move {
        let io = TokioIo::new(stream);
        let timeout_duration = std::time::Duration::from_secs(settings.timeout_secs);

        let mut builder = http1::Builder::new();
        builder.keep_alive(true);

        let conn = builder.serve_connection(
            io,
            service_fn(move |req| {
                let service = Arc::clone(&service);
                async move {
                    Ok::<_, std::convert::Infallible>(service.dispatch(req, peer_addr).await)
                }
            }),
        );

        match tokio::time::timeout(timeout_duration, conn).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => logger::log_connection_error(&err),
            Err(_) => {
                logger::log_warning(&format!(
                    "Connection from {peer_addr} timed out after {} seconds",
                    timeout_duration.as_secs()
                ));
            }
        }

        conn_counter.fetch_sub(1, Ordering::SeqCst);
    });
}
