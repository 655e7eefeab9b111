//! Routing module
//!
//! Holds registered (method, pattern, handler) entries and resolves
//! requests to handlers. Entries are matched in registration order and the
//! first structural match wins; duplicate or overlapping patterns are
//! permitted, with later entries shadowed.

mod pattern;

pub use pattern::{Pattern, Segment};

use std::sync::Arc;

use hyper::{Method, Response};

use crate::context::{BoxFuture, RequestContext};
use crate::error::PipelineError;
use crate::response::ResponseBody;

/// Result of a terminal handler.
pub type HandlerResult = Result<Response<ResponseBody>, PipelineError>;

/// A terminal request handler. Boxed so route tables can hold handlers of
/// different concrete types; futures are not required to be `Send` because
/// connections run on a `LocalSet`.
pub type Handler = Arc<dyn for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HandlerResult>>;

/// One registered route
pub struct RouteEntry {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// Ordered route table. Mutable only during setup; read-only once the
/// service is built.
#[derive(Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method and pattern. Duplicates are
    /// permitted; the earliest registration wins on match.
    pub fn register(&mut self, method: Method, pattern: &str, handler: Handler) {
        self.entries.push(RouteEntry {
            method,
            pattern: Pattern::parse(pattern),
            handler,
        });
    }

    /// Find the first entry matching the method and path, in registration
    /// order, binding its parameters.
    pub fn find(
        &self,
        method: &Method,
        path: &str,
    ) -> Result<(Handler, Vec<(String, String)>), PipelineError> {
        self.entries
            .iter()
            .filter(|entry| entry.method == *method)
            .find_map(|entry| {
                entry
                    .pattern
                    .matches(path)
                    .map(|params| (Arc::clone(&entry.handler), params))
            })
            .ok_or_else(|| PipelineError::RouteNotFound {
                method: method.to_string(),
                path: path.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
