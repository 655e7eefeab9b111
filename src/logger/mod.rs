//! Logger module
//!
//! Provides logging utilities for the request pipeline including:
//! - Server lifecycle logging
//! - Access logging (combined or json format)
//! - Error and warning logging
//! - File-based logging support

mod format;
pub mod writer;

pub use format::AccessLogEntry;

use crate::config::Config;
use crate::error::PipelineError;
use std::net::SocketAddr;

/// Initialize the logger with configuration
///
/// Should be called once at application startup.
pub fn init(config: &Config) -> std::io::Result<()> {
    writer::init(
        config.logging.access_log_file.as_deref(),
        config.logging.error_log_file.as_deref(),
    )
}

/// Write to info/access log
fn write_info(message: &str) {
    if writer::is_initialized() {
        writer::get().write_info(message);
    } else {
        println!("{message}");
    }
}

/// Write to error log
fn write_error(message: &str) {
    if writer::is_initialized() {
        writer::get().write_error(message);
    } else {
        eprintln!("{message}");
    }
}

pub fn log_server_start(addr: &SocketAddr, config: &Config) {
    write_info("======================================");
    write_info("Server started successfully");
    write_info(&format!("Listening on: http://{addr}"));
    write_info(&format!("Log level: {}", config.logging.level));
    if let Some(workers) = config.server.workers {
        write_info(&format!("Worker threads: {workers}"));
    }
    write_info(&format!("Upload directory: {}", config.upload.directory));
    if let Some(ref path) = config.logging.access_log_file {
        write_info(&format!("Access log: {path}"));
    }
    if let Some(ref path) = config.logging.error_log_file {
        write_info(&format!("Error log: {path}"));
    }
    write_info("======================================\n");
}

pub fn log_connection_accepted(peer_addr: &SocketAddr) {
    write_info(&format!("[Connection] Accepted from: {peer_addr}"));
}

pub fn log_connection_error(err: &impl std::fmt::Debug) {
    write_error(&format!("[ERROR] Failed to serve connection: {err:?}"));
}

pub fn log_error(message: &str) {
    write_error(&format!("[ERROR] {message}"));
}

pub fn log_warning(message: &str) {
    write_error(&format!("[WARN] {message}"));
}

/// Log a pipeline error with its full detail. Only the server-side log
/// carries the error chain; responses get `client_message` instead.
pub fn log_pipeline_error(stage: usize, err: &PipelineError) {
    write_error(&format!("[ERROR] stage {stage}: {err}"));
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        write_error(&format!("[ERROR]   caused by: {inner}"));
        source = inner.source();
    }
}

/// Log a double `next` signal. Never surfaced to the client.
pub fn log_double_next(index: usize) {
    write_error(&format!(
        "[WARN] stage {index} signalled its continuation more than once; first signal kept"
    ));
}

/// Log formatted access log entry
pub fn log_access(entry: &AccessLogEntry, format: &str) {
    write_info(&entry.format(format));
}

pub fn log_upload_saved(filename: &str, bytes: u64) {
    write_info(&format!("[Upload] Saved {filename} ({bytes} bytes)"));
}

pub fn log_upload_failed(filename: &str, err: &std::io::Error) {
    write_error(&format!("[ERROR] Upload of {filename} failed: {err}"));
}
