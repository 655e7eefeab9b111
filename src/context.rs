//! Request context module
//!
//! Per-request mutable state shared by all stages handling one request.
//! A context is created when the transport hands over a request, mutated in
//! place as the chain runs, and dropped once the response is written. It is
//! visible to exactly one in-flight request.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};

use crate::error::PipelineError;
use crate::response::ResponseBody;

/// Boxed future tied to a request-scoped borrow. Not `Send`: connections
/// are served on a `LocalSet`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// The request body, consumed at most once.
///
/// The server passes the hyper body through untouched so uploads can be
/// streamed chunk by chunk; tests and the urlencoded path use a buffered
/// body instead.
pub enum RequestBody {
    /// Streaming body from a live connection
    Stream(Incoming),
    /// Fully buffered body
    Buffered(Bytes),
    /// Pre-scripted chunk sequence, each read yielding the next entry.
    /// Lets callers without a live connection drive the streaming path,
    /// including mid-body read failures.
    Scripted(VecDeque<Result<Bytes, String>>),
    /// Already consumed
    Taken,
}

/// Outcome of one persisted upload part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Form field the part was bound to
    pub field: String,
    /// Original client-supplied file name (sanitized)
    pub filename: String,
    /// Bytes written to disk
    pub size_bytes: u64,
}

/// Per-request state bag
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    /// Decoded query values
    pub query: HashMap<String, String>,
    raw_query: Option<String>,
    /// Parameters bound by the matched route pattern
    pub params: HashMap<String, String>,
    /// Plain form fields from urlencoded or multipart bodies
    pub form_fields: HashMap<String, String>,
    /// Files persisted by the upload handler
    pub files: Vec<SavedFile>,
    body: RequestBody,
    /// Response written by a stage or handler; set once
    pub response: Option<Response<ResponseBody>>,
    /// Descriptions of errors raised while handling this request, in order
    pub errors: Vec<String>,
}

impl RequestContext {
    /// Build a context from an inbound hyper request.
    pub fn from_request(req: Request<Incoming>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let raw_query = parts.uri.query().map(ToString::to_string);
        let query = raw_query.as_deref().map(parse_query).unwrap_or_default();

        Self {
            method: parts.method,
            path,
            headers: parts.headers,
            remote_addr,
            query,
            raw_query,
            params: HashMap::new(),
            form_fields: HashMap::new(),
            files: Vec::new(),
            body: RequestBody::Stream(body),
            response: None,
            errors: Vec::new(),
        }
    }

    /// Build a context with a buffered body. Used wherever a live
    /// connection is unavailable, primarily in tests.
    pub fn buffered(
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let (path, raw_query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let query = raw_query.as_deref().map(parse_query).unwrap_or_default();

        Self {
            method,
            path,
            headers,
            remote_addr: None,
            query,
            raw_query,
            params: HashMap::new(),
            form_fields: HashMap::new(),
            files: Vec::new(),
            body: RequestBody::Buffered(body),
            response: None,
            errors: Vec::new(),
        }
    }

    /// Build a context whose body yields the given chunk results in order.
    /// Each `Err` entry surfaces as a body read failure, the way a dropped
    /// connection does on a streaming body.
    pub fn from_chunks(
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        chunks: Vec<Result<Bytes, String>>,
    ) -> Self {
        let mut ctx = Self::buffered(method, path_and_query, headers, Bytes::new());
        ctx.body = RequestBody::Scripted(chunks.into());
        ctx
    }

    /// Bound route parameter by name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Decoded query value by name
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Raw query string, without the leading `?`
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Header value as a string, if present and valid
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Full Content-Type header value
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Content-Length header, if present and numeric
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Pull the next body chunk, suspending on the transport. `None` once
    /// the body is exhausted or was already taken.
    pub async fn next_body_chunk(&mut self) -> Result<Option<Bytes>, PipelineError> {
        match &mut self.body {
            RequestBody::Buffered(_) => {
                let RequestBody::Buffered(bytes) =
                    std::mem::replace(&mut self.body, RequestBody::Taken)
                else {
                    unreachable!()
                };
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(bytes))
                }
            }
            RequestBody::Scripted(chunks) => match chunks.pop_front() {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(e)) => {
                    self.body = RequestBody::Taken;
                    Err(PipelineError::Uncaught(format!("body read failed: {e}")))
                }
                None => {
                    self.body = RequestBody::Taken;
                    Ok(None)
                }
            },
            RequestBody::Stream(incoming) => loop {
                match incoming.frame().await {
                    Some(Ok(frame)) => {
                        // Trailer frames are ignored
                        if let Ok(data) = frame.into_data() {
                            return Ok(Some(data));
                        }
                    }
                    Some(Err(e)) => {
                        self.body = RequestBody::Taken;
                        return Err(PipelineError::Uncaught(format!("body read failed: {e}")));
                    }
                    None => {
                        self.body = RequestBody::Taken;
                        return Ok(None);
                    }
                }
            },
            RequestBody::Taken => Ok(None),
        }
    }

    /// Collect the whole body, rejecting anything over `limit` bytes.
    pub async fn collect_body(&mut self, limit: u64) -> Result<Bytes, PipelineError> {
        let mut collected = bytes::BytesMut::new();
        while let Some(chunk) = self.next_body_chunk().await? {
            if (collected.len() + chunk.len()) as u64 > limit {
                return Err(PipelineError::PayloadTooLarge { limit });
            }
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }
}

/// Parse a query or urlencoded form body into decoded name/value pairs.
/// Later duplicates overwrite earlier ones.
pub fn parse_query(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(name), decode_component(value))
        })
        .collect()
}

/// Percent-decode one form component, with `+` as space
fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map_or_else(|_| plus_decoded.clone(), |v| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_parsed_and_decoded() {
        let ctx = RequestContext::buffered(
            Method::GET,
            "/search?q=rust+web&lang=en%2Dus",
            HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(ctx.path, "/search");
        assert_eq!(ctx.query_value("q"), Some("rust web"));
        assert_eq!(ctx.query_value("lang"), Some("en-us"));
        assert_eq!(ctx.raw_query(), Some("q=rust+web&lang=en%2Dus"));
    }

    #[tokio::test]
    async fn buffered_body_is_consumed_once() {
        let mut ctx = RequestContext::buffered(
            Method::POST,
            "/submit",
            HeaderMap::new(),
            Bytes::from_static(b"name=ada"),
        );
        let first = ctx.next_body_chunk().await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"name=ada"[..]));
        assert!(ctx.next_body_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn collect_body_enforces_limit() {
        let mut ctx = RequestContext::buffered(
            Method::POST,
            "/submit",
            HeaderMap::new(),
            Bytes::from_static(b"0123456789"),
        );
        let err = ctx.collect_body(4).await.unwrap_err();
        assert!(matches!(err, PipelineError::PayloadTooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn scripted_body_yields_chunks_then_fails() {
        let mut ctx = RequestContext::from_chunks(
            Method::POST,
            "/upload",
            HeaderMap::new(),
            vec![
                Ok(Bytes::from_static(b"first")),
                Err("connection reset by peer".to_string()),
            ],
        );
        let first = ctx.next_body_chunk().await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"first"[..]));

        let err = ctx.next_body_chunk().await.unwrap_err();
        assert!(matches!(err, PipelineError::Uncaught(_)));
        // The body is spent after a read failure
        assert!(ctx.next_body_chunk().await.unwrap().is_none());
    }

    #[test]
    fn empty_pairs_are_skipped() {
        let parsed = parse_query("a=1&&b=2&");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "2");
    }
}
