//! HTTP response building module
//!
//! Provides builders for the response shapes the pipeline emits, decoupled
//! from specific business logic.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Response;

use crate::error::PipelineError;

/// Body type produced by every handler and stage in this crate.
pub type ResponseBody = Full<Bytes>;

/// Build a 200 text/plain response
pub fn build_text_response(content: impl Into<String>) -> Response<ResponseBody> {
    let content = content.into();
    Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(content)))
        .unwrap_or_else(|e| {
            log_build_error("200", &e);
            Response::new(Full::new(Bytes::new()))
        })
}

/// Build a 200 text/html response
pub fn build_html_response(content: impl Into<String>) -> Response<ResponseBody> {
    let content = content.into();
    let content_length = content.len();
    Response::builder()
        .status(200)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Content-Length", content_length)
        .body(Full::new(Bytes::from(content)))
        .unwrap_or_else(|e| {
            log_build_error("HTML", &e);
            Response::new(Full::new(Bytes::new()))
        })
}

/// Build a JSON response with the given status code
pub fn build_json_response(status: u16, value: &serde_json::Value) -> Response<ResponseBody> {
    let body = value.to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|e| {
            log_build_error("JSON", &e);
            Response::new(Full::new(Bytes::new()))
        })
}

/// Build 404 Not Found response
pub fn build_404_response() -> Response<ResponseBody> {
    Response::builder()
        .status(404)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from("404 Not Found")))
        .unwrap_or_else(|e| {
            log_build_error("404", &e);
            Response::new(Full::new(Bytes::from("404 Not Found")))
        })
}

/// Build 413 Payload Too Large response
pub fn build_413_response() -> Response<ResponseBody> {
    Response::builder()
        .status(413)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from("413 Payload Too Large")))
        .unwrap_or_else(|e| {
            log_build_error("413", &e);
            Response::new(Full::new(Bytes::from("413 Payload Too Large")))
        })
}

/// Build the generic 500 response emitted by the default error responder.
/// Carries no internal detail.
pub fn build_500_response() -> Response<ResponseBody> {
    Response::builder()
        .status(500)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from("500 Internal Server Error")))
        .unwrap_or_else(|e| {
            log_build_error("500", &e);
            Response::new(Full::new(Bytes::from("500 Internal Server Error")))
        })
}

/// Build a response directly from a pipeline error, using its status
/// mapping and client-safe message.
pub fn build_error_response(err: &PipelineError) -> Response<ResponseBody> {
    Response::builder()
        .status(err.status())
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(err.client_message())))
        .unwrap_or_else(|e| {
            log_build_error("error", &e);
            build_500_response()
        })
}

/// Log response build error
fn log_build_error(status: &str, error: &hyper::http::Error) {
    crate::logger::log_error(&format!("Failed to build {status} response: {error}"));
}
