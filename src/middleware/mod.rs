//! Middleware chain module
//!
//! Executes an ordered list of stages per request. Normal stages either
//! signal their continuation to advance, write a response and stop, or
//! raise an error; raised errors divert traversal to the first error-stage
//! after the failing index, or to the built-in default responder when none
//! remains. The list is immutable once the service is built and the order
//! is never reordered by stage kind.

mod stages;

pub use stages::{body_limit_stage, form_parser_stage};

use std::sync::Arc;

use hyper::Response;

use crate::context::{BoxFuture, RequestContext};
use crate::error::PipelineError;
use crate::logger;
use crate::response::{self, ResponseBody};

/// Whether a stage runs in normal traversal or only after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Normal,
    ErrorHandler,
}

/// Stage callback. Receives the request context and its continuation
/// handle; must signal the handle or write `ctx.response`.
pub type StageFn = Arc<dyn for<'a> Fn(&'a mut RequestContext, &'a mut Next) -> BoxFuture<'a, ()>>;

/// One unit of per-request processing.
pub struct Stage {
    kind: StageKind,
    func: StageFn,
}

impl Stage {
    pub fn normal<F>(func: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext, &'a mut Next) -> BoxFuture<'a, ()> + 'static,
    {
        Self {
            kind: StageKind::Normal,
            func: Arc::new(func),
        }
    }

    pub fn error_handler<F>(func: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext, &'a mut Next) -> BoxFuture<'a, ()> + 'static,
    {
        Self {
            kind: StageKind::ErrorHandler,
            func: Arc::new(func),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }
}

enum Signal {
    Proceed,
    Fail(PipelineError),
}

/// Continuation handle passed to each stage invocation.
///
/// A stage signals at most once; a second `proceed`/`fail` is a
/// programming error, logged server-side while the first signal stays
/// authoritative. Error stages find the active error here.
pub struct Next {
    signal: Option<Signal>,
    doubled: bool,
    active_error: Option<PipelineError>,
}

impl Next {
    fn new(active_error: Option<PipelineError>) -> Self {
        Self {
            signal: None,
            doubled: false,
            active_error,
        }
    }

    /// Advance to the following stage.
    pub fn proceed(&mut self) {
        if self.signal.is_some() {
            self.doubled = true;
        } else {
            self.signal = Some(Signal::Proceed);
        }
    }

    /// Raise an error, diverting traversal to the nearest error-stage.
    pub fn fail(&mut self, err: PipelineError) {
        if self.signal.is_some() {
            self.doubled = true;
        } else {
            self.signal = Some(Signal::Fail(err));
        }
    }

    /// The error being handled. Present only inside error-stages.
    pub fn error(&self) -> Option<&PipelineError> {
        self.active_error.as_ref()
    }
}

/// Traversal state, advanced by the dispatch loop.
enum ChainState {
    /// About to run the next normal stage at or after this index
    Pending(usize),
    /// A stage wrote a response and stopped
    ShortCircuited,
    /// Stage at this index raised an error
    Errored(usize, PipelineError),
    /// No error-stage remains; the default responder answers
    DefaultError(PipelineError),
}

/// Ordered, immutable list of stages executed per request.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Stage>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Insertion order is execution order.
    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Insert a stage right after the last normal stage, ahead of any
    /// trailing error-stages, so errors it raises still reach them.
    pub fn insert_after_normals(&mut self, stage: Stage) {
        let at = self
            .stages
            .iter()
            .rposition(|s| s.kind == StageKind::Normal)
            .map_or(0, |i| i + 1);
        self.stages.insert(at, stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the chain for one request and produce its response.
    ///
    /// Falling off the end of the chain without a response answers 404;
    /// a fully built service ends in the routing stage, which always
    /// responds or raises.
    pub async fn run(&self, ctx: &mut RequestContext) -> Response<ResponseBody> {
        let mut state = ChainState::Pending(0);

        loop {
            state = match state {
                ChainState::Pending(from) => {
                    match self.next_of_kind(from, StageKind::Normal) {
                        Some(index) => self.run_stage(index, None, ctx).await,
                        None => {
                            return ctx
                                .response
                                .take()
                                .unwrap_or_else(response::build_404_response)
                        }
                    }
                }
                ChainState::Errored(index, err) => {
                    logger::log_pipeline_error(index, &err);
                    ctx.errors.push(err.to_string());
                    match self.next_of_kind(index + 1, StageKind::ErrorHandler) {
                        Some(handler_index) => self.run_stage(handler_index, Some(err), ctx).await,
                        None => ChainState::DefaultError(err),
                    }
                }
                ChainState::ShortCircuited => {
                    return ctx
                        .response
                        .take()
                        .unwrap_or_else(response::build_500_response)
                }
                ChainState::DefaultError(err) => {
                    // Default responder: detail stays server-side
                    logger::log_error(&format!("unhandled pipeline error: {err}"));
                    return response::build_500_response();
                }
            };
        }
    }

    /// Run one stage and translate its signal into the next state.
    async fn run_stage(
        &self,
        index: usize,
        active_error: Option<PipelineError>,
        ctx: &mut RequestContext,
    ) -> ChainState {
        let mut next = Next::new(active_error);
        (self.stages[index].func)(ctx, &mut next).await;

        if next.doubled {
            logger::log_double_next(index);
            ctx.errors
                .push(PipelineError::DoubleNext { index }.to_string());
        }

        match next.signal {
            Some(Signal::Proceed) => ChainState::Pending(index + 1),
            Some(Signal::Fail(err)) => ChainState::Errored(index, err),
            None if ctx.response.is_some() => ChainState::ShortCircuited,
            None => ChainState::Errored(
                index,
                PipelineError::Uncaught(format!(
                    "stage {index} finished without signalling or responding"
                )),
            ),
        }
    }

    /// First stage of the given kind at or after `from`.
    fn next_of_kind(&self, from: usize, kind: StageKind) -> Option<usize> {
        self.stages
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, stage)| stage.kind == kind)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::build_text_response;
    use hyper::body::Bytes;
    use hyper::header::HeaderMap;
    use hyper::Method;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_ctx() -> RequestContext {
        RequestContext::buffered(Method::GET, "/", HeaderMap::new(), Bytes::new())
    }

    /// Normal stage that records its tag and proceeds
    fn tracing_stage(tag: &'static str, trace: Rc<RefCell<Vec<&'static str>>>) -> Stage {
        Stage::normal(move |_ctx, next| {
            let trace = Rc::clone(&trace);
            Box::pin(async move {
                trace.borrow_mut().push(tag);
                next.proceed();
            })
        })
    }

    fn responding_stage(body: &'static str) -> Stage {
        Stage::normal(move |ctx, _next| {
            Box::pin(async move {
                ctx.response = Some(build_text_response(body));
            })
        })
    }

    async fn body_text(resp: Response<ResponseBody>) -> String {
        use http_body_util::BodyExt;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn stages_run_in_registration_order() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(tracing_stage("one", Rc::clone(&trace)));
        chain.push(tracing_stage("two", Rc::clone(&trace)));
        chain.push(responding_stage("done"));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(*trace.borrow(), vec!["one", "two"]);
        assert_eq!(body_text(resp).await, "done");
    }

    #[tokio::test]
    async fn short_circuit_skips_later_stages() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(responding_stage("early"));
        chain.push(tracing_stage("unreached", Rc::clone(&trace)));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(body_text(resp).await, "early");
        assert!(trace.borrow().is_empty());
    }

    #[tokio::test]
    async fn error_jumps_to_first_error_stage_after_failing_index() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught("boom".to_string()));
            })
        }));
        // Normal stages between the failure and the error-stage are skipped
        chain.push(tracing_stage("skipped", Rc::clone(&trace)));
        chain.push(Stage::error_handler(|ctx, next| {
            Box::pin(async move {
                let msg = next
                    .error()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                ctx.response = Some(build_text_response(format!("handled: {msg}")));
            })
        }));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert!(trace.borrow().is_empty());
        assert!(body_text(resp).await.contains("handled: handler error: boom"));
    }

    #[tokio::test]
    async fn error_stages_are_skipped_in_normal_traversal() {
        let mut chain = Chain::new();
        chain.push(Stage::error_handler(|ctx, _next| {
            Box::pin(async move {
                ctx.response = Some(build_text_response("should not run"));
            })
        }));
        chain.push(responding_stage("normal path"));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(body_text(resp).await, "normal path");
    }

    #[tokio::test]
    async fn error_stage_proceeding_resumes_normal_traversal() {
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught("recoverable".to_string()));
            })
        }));
        chain.push(Stage::error_handler(|_ctx, next| {
            Box::pin(async move {
                // Declines to answer; normal traversal resumes after it
                next.proceed();
            })
        }));
        chain.push(responding_stage("recovered"));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(body_text(resp).await, "recovered");
    }

    #[tokio::test]
    async fn error_stage_failing_jumps_to_next_error_stage() {
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught("first".to_string()));
            })
        }));
        chain.push(Stage::error_handler(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught("second".to_string()));
            })
        }));
        chain.push(Stage::error_handler(|ctx, next| {
            Box::pin(async move {
                let msg = next
                    .error()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                ctx.response = Some(build_text_response(msg));
            })
        }));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert!(body_text(resp).await.contains("second"));
    }

    #[tokio::test]
    async fn default_responder_answers_500_without_detail() {
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught(
                    "secret internal detail".to_string(),
                ));
            })
        }));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 500);
        let body = body_text(resp).await;
        assert!(!body.contains("secret internal detail"));
    }

    #[tokio::test]
    async fn double_signal_keeps_first_and_is_not_client_visible() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.proceed();
                next.proceed(); // programming error, logged only
            })
        }));
        chain.push(tracing_stage("after", Rc::clone(&trace)));
        chain.push(responding_stage("ok"));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 200);
        // The stage after the doubled signal still runs exactly once
        assert_eq!(*trace.borrow(), vec!["after"]);
        assert_eq!(ctx.errors.len(), 1);
        assert!(ctx.errors[0].contains("more than once"));
    }

    #[tokio::test]
    async fn stalled_stage_becomes_uncaught_error() {
        let mut chain = Chain::new();
        chain.push(Stage::normal(|_ctx, _next| {
            Box::pin(async move {
                // Neither signals nor responds
            })
        }));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 500);
        assert_eq!(ctx.errors.len(), 1);
    }

    #[tokio::test]
    async fn insert_after_normals_precedes_trailing_error_stages() {
        let mut chain = Chain::new();
        chain.push(tracing_stage("first", Rc::new(RefCell::new(Vec::new()))));
        chain.push(Stage::error_handler(|ctx, next| {
            Box::pin(async move {
                let msg = next
                    .error()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                ctx.response = Some(build_text_response(format!("caught: {msg}")));
            })
        }));
        // Lands between the normal stage and the error-stage
        chain.insert_after_normals(Stage::normal(|_ctx, next| {
            Box::pin(async move {
                next.fail(PipelineError::Uncaught("late failure".to_string()));
            })
        }));

        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert!(body_text(resp).await.contains("late failure"));
    }

    #[tokio::test]
    async fn empty_chain_answers_404() {
        let chain = Chain::new();
        let mut ctx = test_ctx();
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 404);
    }
}
