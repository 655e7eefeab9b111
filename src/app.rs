//! Application builder module
//!
//! Routes and stages are registered on an `App` during setup; `build()`
//! freezes them into an immutable `Service` before the listener starts
//! accepting. There is no mutable global application state: the dispatch
//! table is read-only for the whole serving phase.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::{Body, Incoming};
use hyper::{Method, Request, Response};

use crate::context::RequestContext;
use crate::logger::{self, AccessLogEntry};
use crate::middleware::{Chain, Next, Stage};
use crate::response::{self, ResponseBody};
use crate::router::{Handler, RouteTable};

/// Mutable registration surface, only alive during setup.
pub struct App {
    table: RouteTable,
    chain: Chain,
    access_log: bool,
    access_log_format: String,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            table: RouteTable::new(),
            chain: Chain::new(),
            access_log: false,
            access_log_format: "combined".to_string(),
        }
    }

    /// Enable access logging in the given format.
    #[must_use]
    pub fn access_log(mut self, enabled: bool, format: &str) -> Self {
        self.access_log = enabled;
        self.access_log_format = format.to_string();
        self
    }

    /// Register a route. Duplicates are permitted; first registered wins.
    #[must_use]
    pub fn route(mut self, method: Method, pattern: &str, handler: Handler) -> Self {
        self.table.register(method, pattern, handler);
        self
    }

    /// Append a normal middleware stage. Registration order is execution
    /// order.
    #[must_use]
    pub fn wrap(mut self, stage: Stage) -> Self {
        self.chain.push(stage);
        self
    }

    /// Append an error-stage, invoked only after an error is raised.
    #[must_use]
    pub fn wrap_err<F>(mut self, func: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext, &'a mut Next) -> crate::context::BoxFuture<'a, ()>
            + 'static,
    {
        self.chain.push(Stage::error_handler(func));
        self
    }

    /// Freeze registrations into an immutable service. The routing stage
    /// goes in after the last normal stage, ahead of trailing
    /// error-stages, so handler errors still reach them.
    #[must_use]
    pub fn build(self) -> Arc<Service> {
        let Self {
            table,
            mut chain,
            access_log,
            access_log_format,
        } = self;

        let table = Arc::new(table);
        chain.insert_after_normals(Stage::normal(move |ctx, next| {
            let table = Arc::clone(&table);
            Box::pin(async move {
                match table.find(&ctx.method, &ctx.path) {
                    Ok((handler, params)) => {
                        ctx.params.extend(params);
                        match handler(ctx).await {
                            Ok(resp) => ctx.response = Some(resp),
                            Err(err) => next.fail(err),
                        }
                    }
                    Err(not_found) => {
                        // 404 answers on the normal response path
                        ctx.response = Some(response::build_error_response(&not_found));
                    }
                }
            })
        }));

        Arc::new(Service {
            chain,
            access_log,
            access_log_format,
        })
    }
}

/// Frozen dispatch table; read-only and shared by every connection.
pub struct Service {
    chain: Chain,
    access_log: bool,
    access_log_format: String,
}

impl Service {
    /// Handle one inbound request end to end.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<ResponseBody> {
        let start = Instant::now();
        let mut ctx = RequestContext::from_request(req, Some(remote_addr));

        let mut entry = self.access_log.then(|| {
            let mut entry = AccessLogEntry::new(
                remote_addr.ip().to_string(),
                ctx.method.to_string(),
                ctx.path.clone(),
            );
            entry.query = ctx.raw_query().map(ToString::to_string);
            entry.user_agent = ctx.header("user-agent").map(ToString::to_string);
            entry
        });

        let resp = self.chain.run(&mut ctx).await;

        if let Some(entry) = entry.as_mut() {
            entry.status = resp.status().as_u16();
            entry.body_bytes = usize::try_from(resp.body().size_hint().exact().unwrap_or(0))
                .unwrap_or(usize::MAX);
            entry.request_time_us =
                u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
            logger::log_access(entry, &self.access_log_format);
        }

        resp
    }

    /// Run the chain against an already-built context. Entry point for
    /// tests that have no live connection to build a request from.
    pub async fn dispatch_context(&self, ctx: &mut RequestContext) -> Response<ResponseBody> {
        self.chain.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::build_text_response;
    use hyper::body::Bytes;
    use hyper::header::HeaderMap;
    use std::sync::Arc;

    fn text_handler(body: &'static str) -> Handler {
        Arc::new(move |_ctx| Box::pin(async move { Ok(build_text_response(body)) }))
    }

    async fn body_text(resp: Response<ResponseBody>) -> String {
        use http_body_util::BodyExt;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn routing_stage_answers_registered_route() {
        let service = App::new()
            .route(Method::GET, "/", text_handler("Hello, World!"))
            .build();

        let mut ctx =
            RequestContext::buffered(Method::GET, "/", HeaderMap::new(), Bytes::new());
        let resp = service.dispatch_context(&mut ctx).await;
        assert_eq!(body_text(resp).await, "Hello, World!");
    }

    #[tokio::test]
    async fn unmatched_path_is_404_without_error_stage() {
        let hit = std::rc::Rc::new(std::cell::Cell::new(false));
        let hit_clone = std::rc::Rc::clone(&hit);
        let service = App::new()
            .route(Method::GET, "/", text_handler("home"))
            .wrap_err(move |ctx, _next| {
                let hit = std::rc::Rc::clone(&hit_clone);
                Box::pin(async move {
                    hit.set(true);
                    ctx.response = Some(build_text_response("error stage"));
                })
            })
            .build();

        let mut ctx =
            RequestContext::buffered(Method::GET, "/missing", HeaderMap::new(), Bytes::new());
        let resp = service.dispatch_context(&mut ctx).await;
        assert_eq!(resp.status(), 404);
        assert!(!hit.get());
    }

    #[tokio::test]
    async fn handler_error_reaches_error_stage() {
        let service = App::new()
            .route(
                Method::GET,
                "/boom",
                Arc::new(|_ctx| {
                    Box::pin(async move {
                        Err(crate::error::PipelineError::Uncaught(
                            "Custom error occurred!".to_string(),
                        ))
                    })
                }),
            )
            .wrap_err(|ctx, next| {
                Box::pin(async move {
                    let detail = next
                        .error()
                        .map_or_else(String::new, ToString::to_string);
                    ctx.response =
                        Some(build_text_response(format!("Something broke! {detail}")));
                })
            })
            .build();

        let mut ctx =
            RequestContext::buffered(Method::GET, "/boom", HeaderMap::new(), Bytes::new());
        let resp = service.dispatch_context(&mut ctx).await;
        assert!(body_text(resp).await.contains("Something broke!"));
    }

    #[tokio::test]
    async fn params_are_visible_to_the_handler() {
        let service = App::new()
            .route(
                Method::GET,
                "/users/:id",
                Arc::new(|ctx| {
                    Box::pin(async move {
                        let id = ctx.param("id").unwrap_or_default();
                        Ok(build_text_response(format!("User ID requested: {id}")))
                    })
                }),
            )
            .build();

        let mut ctx =
            RequestContext::buffered(Method::GET, "/users/42", HeaderMap::new(), Bytes::new());
        let resp = service.dispatch_context(&mut ctx).await;
        assert_eq!(body_text(resp).await, "User ID requested: 42");
    }
}
