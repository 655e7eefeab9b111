use std::path::PathBuf;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Method, Response};

use expressway::app::{App, Service};
use expressway::config::Config;
use expressway::error::PipelineError;
use expressway::middleware::{body_limit_stage, form_parser_stage};
use expressway::response::{build_html_response, build_text_response};
use expressway::upload::{upload_handler, DiskStore};
use expressway::{logger, server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load()?;
    logger::init(&cfg)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if let Some(workers) = cfg.server.workers {
        runtime_builder.worker_threads(workers);
    }
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cfg))
}

async fn async_main(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = cfg.socket_addr()?;
    let listener = server::create_reusable_listener(addr)?;

    if cfg.upload.create_dir {
        tokio::fs::create_dir_all(&cfg.upload.directory).await?;
    }

    let service = build_app(&cfg);
    logger::log_server_start(&addr, &cfg);

    // LocalSet so connection tasks may hold non-Send handler futures
    let local = tokio::task::LocalSet::new();
    local.run_until(server::run(listener, service, &cfg)).await
}

/// Wire up the demo application: plain routes, parameterized routes, a
/// form echo, the multipart upload endpoint, and an error stage.
fn build_app(cfg: &Config) -> Arc<Service> {
    let max_body = cfg.http.max_body_size;
    let upload_dir = PathBuf::from(&cfg.upload.directory);

    App::new()
        .access_log(cfg.logging.access_log, &cfg.logging.access_log_format)
        .wrap(body_limit_stage(max_body))
        .wrap(form_parser_stage(max_body))
        .route(
            Method::GET,
            "/",
            Arc::new(|_ctx| Box::pin(async move { Ok(build_text_response("Hello, World!")) })),
        )
        .route(
            Method::GET,
            "/search",
            Arc::new(|ctx| {
                Box::pin(async move {
                    let query = ctx.query_value("q").unwrap_or_default();
                    Ok(build_text_response(format!("You searched for: {query}")))
                })
            }),
        )
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
        .route(
            Method::GET,
            "/users/:id/books/:bookId",
            Arc::new(|ctx| {
                Box::pin(async move {
                    let id = ctx.param("id").unwrap_or_default();
                    let book = ctx.param("bookId").unwrap_or_default();
                    Ok(build_text_response(format!("User: {id}, Book: {book}")))
                })
            }),
        )
        .route(
            Method::POST,
            "/submit",
            Arc::new(|ctx| {
                Box::pin(async move {
                    let name = ctx.form_fields.get("name").cloned().unwrap_or_default();
                    let email = ctx.form_fields.get("email").cloned().unwrap_or_default();
                    Ok(build_html_response(format!(
                        "<h2>Thank you, {name}!</h2>\n\
                         <p>Your email <b>{email}</b> has been received.</p>\n\
                         <a href=\"/\">Go Back</a>"
                    )))
                })
            }),
        )
        .route(
            Method::GET,
            "/upload",
            Arc::new(|_ctx| {
                Box::pin(async move {
                    Ok(build_html_response(
                        "<h2>Upload a File</h2>\n\
                         <form action=\"/upload\" method=\"POST\" enctype=\"multipart/form-data\">\n\
                         <input type=\"file\" name=\"file\" />\n\
                         <button type=\"submit\">Upload</button>\n\
                         </form>",
                    ))
                })
            }),
        )
        .route(
            Method::POST,
            "/upload",
            upload_handler(Arc::new(DiskStore::new()), upload_dir, max_body),
        )
        .route(
            Method::GET,
            "/boom",
            Arc::new(|_ctx| {
                Box::pin(async move {
                    Err(PipelineError::Uncaught("Custom error occurred!".to_string()))
                })
            }),
        )
        .wrap_err(|ctx, next| {
            Box::pin(async move {
                let status = next.error().map_or(500, PipelineError::status);
                let message = next
                    .error()
                    .map_or_else(String::new, PipelineError::client_message);
                ctx.response = Some(
                    Response::builder()
                        .status(status)
                        .header("Content-Type", "text/plain; charset=utf-8")
                        .body(Full::new(Bytes::from(format!("Something broke! {message}"))))
                        .unwrap_or_else(|_| expressway::response::build_500_response()),
                );
            })
        })
        .build()
}
