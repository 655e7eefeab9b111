//! Error taxonomy for the request pipeline
//!
//! Every fault a stage or handler can raise is a value of `PipelineError`.
//! Each variant carries a status mapping and a client-safe message;
//! internal detail stays in the `Display`/`source` chain, which only the
//! server-side log ever sees.

use std::io;

use thiserror::Error;

/// The faults the pipeline can raise.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No registered route matched the method and path
    #[error("no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Request body carried a content type the endpoint cannot consume
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Request body exceeded the configured limit
    #[error("payload exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// Request body could not be parsed
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// Persisting an uploaded file failed
    #[error("failed to persist {filename}")]
    UploadIo {
        filename: String,
        #[source]
        source: io::Error,
    },

    /// A stage signalled its continuation more than once
    #[error("stage {index} signalled its continuation more than once")]
    DoubleNext { index: usize },

    /// A fault with no more specific classification
    #[error("handler error: {0}")]
    Uncaught(String),
}

impl PipelineError {
    /// HTTP status this error maps to.
    pub const fn status(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } => 404,
            Self::UnsupportedContentType(_) => 415,
            Self::PayloadTooLarge { .. } => 413,
            Self::MalformedBody(_) => 400,
            Self::UploadIo { .. } | Self::DoubleNext { .. } | Self::Uncaught(_) => 500,
        }
    }

    /// Message safe to put in a response body. Client-caused faults echo
    /// what was wrong; server-side faults collapse to a generic line.
    pub fn client_message(&self) -> String {
        match self {
            Self::RouteNotFound { method, path } => format!("Cannot {method} {path}"),
            Self::UnsupportedContentType(ct) => format!("Unsupported content type: {ct}"),
            Self::PayloadTooLarge { limit } => {
                format!("Payload too large (limit: {limit} bytes)")
            }
            Self::MalformedBody(detail) => format!("Bad request: {detail}"),
            Self::UploadIo { .. } | Self::DoubleNext { .. } | Self::Uncaught(_) => {
                "Internal Server Error".to_string()
            }
        }
    }
}
