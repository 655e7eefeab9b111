// Configuration module entry point
// Loads layered configuration from config.toml and SERVER_* environment overrides

mod types;

use std::net::SocketAddr;

// Re-export public types
pub use types::{Config, HttpConfig, LoggingConfig, ServerConfig, UploadConfig};

impl Config {
    /// Load configuration from the default "config" file (without extension).
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from specified file path (without extension)
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("SERVER"))
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.connection_timeout", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.access_log", true)?
            .set_default("http.server_name", "Expressway/0.1")?
            .set_default("http.max_body_size", 10_485_760)? // 10MB
            .set_default("upload.directory", "./uploads")?
            .build()?;

        settings.try_deserialize()
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| format!("Invalid address: {e}"))
    }
}
