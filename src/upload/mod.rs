//! Upload subsystem
//!
//! Terminal handler for multipart form uploads. File parts are streamed
//! chunk by chunk into the filesystem collaborator as the body arrives;
//! plain fields are collected into the request context. Each file part is
//! processed independently and the response aggregates per-file outcomes.

pub mod multipart;
mod store;

pub use store::{DiskSink, DiskStore, FileSink, FileStore};

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::{RequestContext, SavedFile};
use crate::error::PipelineError;
use crate::logger;
use crate::response;
use crate::router::{Handler, HandlerResult};

use multipart::{MultipartEvent, MultipartParser, PartHeaders};

/// Cap on one plain form field inside a multipart body
const MAX_FIELD_BYTES: usize = 64 * 1024;

/// One file part that could not be persisted
#[derive(Debug, Clone)]
struct FailedFile {
    field: String,
    filename: String,
}

/// Build the upload terminal handler.
///
/// Persists every file part to `<directory>/<original_name>` through the
/// given store, enforcing `max_body_bytes` across the whole body.
pub fn upload_handler<S>(store: Arc<S>, directory: PathBuf, max_body_bytes: u64) -> Handler
where
    S: FileStore + 'static,
{
    Arc::new(move |ctx| {
        let store = Arc::clone(&store);
        let directory = directory.clone();
        Box::pin(async move { run_upload(ctx, &store, directory, max_body_bytes).await })
    })
}

/// Part currently being consumed from the parser
enum CurrentPart<S: FileStore> {
    /// A file part with an open sink
    File {
        field: String,
        filename: String,
        sink: S::Sink,
    },
    /// A plain form field being accumulated
    Field { name: String, value: Vec<u8> },
    /// A part being drained without effect (failed sink, bogus filename)
    Skipped,
}

async fn run_upload<S>(
    ctx: &mut RequestContext,
    store: &Arc<S>,
    directory: PathBuf,
    max_body_bytes: u64,
) -> HandlerResult
where
    S: FileStore,
{
    let content_type = ctx.content_type().unwrap_or("").to_string();
    if !content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("multipart/form-data")
    {
        let shown = if content_type.is_empty() {
            "(none)".to_string()
        } else {
            content_type
        };
        return Err(PipelineError::UnsupportedContentType(shown));
    }

    let Some(boundary) = multipart::boundary_from_content_type(&content_type) else {
        // User input, answered inline
        let err = PipelineError::MalformedBody("multipart body without boundary".to_string());
        return Ok(response::build_error_response(&err));
    };

    if let Err(e) = store.ensure_dir(&directory).await {
        return Err(PipelineError::UploadIo {
            filename: directory.display().to_string(),
            source: e,
        });
    }

    let mut parser = MultipartParser::new(&boundary);
    let mut current: Option<CurrentPart<S>> = None;
    let mut saved: Vec<SavedFile> = Vec::new();
    let mut failed: Vec<FailedFile> = Vec::new();
    let mut first_io_error: Option<PipelineError> = None;
    let mut total_bytes: u64 = 0;

    loop {
        let chunk = match ctx.next_body_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                // Client went away or the transport failed: abort the
                // in-flight write so no partial file is left behind
                abort_current(&mut current).await;
                return Err(e);
            }
        };

        total_bytes += chunk.len() as u64;
        if total_bytes > max_body_bytes {
            abort_current(&mut current).await;
            let err = PipelineError::PayloadTooLarge {
                limit: max_body_bytes,
            };
            return Ok(response::build_error_response(&err));
        }

        if let Err(e) = parser.push(&chunk) {
            abort_current(&mut current).await;
            let err = PipelineError::MalformedBody(e.to_string());
            return Ok(response::build_error_response(&err));
        }

        while let Some(event) = parser.next_event() {
            match event {
                MultipartEvent::PartHeaders(headers) => {
                    current = Some(
                        open_part(
                            store,
                            &directory,
                            headers,
                            &mut failed,
                            &mut first_io_error,
                        )
                        .await,
                    );
                }
                MultipartEvent::Data(data) => {
                    // The only error here is an oversized form field: user
                    // input, answered inline
                    if let Err(err) =
                        feed_part(&mut current, &data, &mut failed, &mut first_io_error).await
                    {
                        abort_current(&mut current).await;
                        return Ok(response::build_error_response(&err));
                    }
                }
                MultipartEvent::PartEnd => {
                    close_part(ctx, &mut current, &mut saved, &mut failed, &mut first_io_error)
                        .await;
                }
                MultipartEvent::Finished => {}
            }
        }
    }

    if parser.finish().is_err() {
        abort_current(&mut current).await;
        let err = PipelineError::MalformedBody("truncated multipart body".to_string());
        return Ok(response::build_error_response(&err));
    }

    if saved.is_empty() && failed.is_empty() {
        // User input condition, never the error-stage path
        return Ok(response::build_text_response("No file uploaded!"));
    }

    if saved.is_empty() {
        // Every part failed; surface the underlying fault
        return Err(first_io_error.unwrap_or_else(|| {
            PipelineError::Uncaught("all upload parts failed".to_string())
        }));
    }

    let names: Vec<&str> = saved.iter().map(|f| f.filename.as_str()).collect();
    let report = serde_json::json!({
        "message": format!("File uploaded successfully: {}", names.join(", ")),
        "uploaded": saved
            .iter()
            .map(|f| {
                serde_json::json!({
                    "field": f.field,
                    "filename": f.filename,
                    "size_bytes": f.size_bytes,
                })
            })
            .collect::<Vec<_>>(),
        "failed": failed
            .iter()
            .map(|f| {
                serde_json::json!({
                    "field": f.field,
                    "filename": f.filename,
                    "error": "write failed",
                })
            })
            .collect::<Vec<_>>(),
    });
    Ok(response::build_json_response(200, &report))
}

/// Begin a new part: open a sink for file parts, a buffer for fields.
async fn open_part<S>(
    store: &Arc<S>,
    directory: &std::path::Path,
    headers: PartHeaders,
    failed: &mut Vec<FailedFile>,
    first_io_error: &mut Option<PipelineError>,
) -> CurrentPart<S>
where
    S: FileStore,
{
    let Some(raw_name) = headers.filename else {
        return CurrentPart::Field {
            name: headers.field,
            value: Vec::new(),
        };
    };

    // A file input submitted empty arrives as filename=""
    let Some(filename) = sanitize_filename(&raw_name) else {
        return CurrentPart::Skipped;
    };

    let dest = directory.join(&filename);
    match store.create(&dest).await {
        Ok(sink) => CurrentPart::File {
            field: headers.field,
            filename,
            sink,
        },
        Err(e) => {
            logger::log_upload_failed(&filename, &e);
            record_io_error(first_io_error, &filename, e);
            failed.push(FailedFile {
                field: headers.field,
                filename,
            });
            CurrentPart::Skipped
        }
    }
}

/// Feed payload bytes into the current part.
async fn feed_part<S>(
    current: &mut Option<CurrentPart<S>>,
    data: &[u8],
    failed: &mut Vec<FailedFile>,
    first_io_error: &mut Option<PipelineError>,
) -> Result<(), PipelineError>
where
    S: FileStore,
{
    let write_err = match current.as_mut() {
        Some(CurrentPart::File { sink, .. }) => match sink.write(data).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        },
        Some(CurrentPart::Field { value, .. }) => {
            if value.len() + data.len() > MAX_FIELD_BYTES {
                return Err(PipelineError::MalformedBody(
                    "multipart form field too large".to_string(),
                ));
            }
            value.extend_from_slice(data);
            return Ok(());
        }
        Some(CurrentPart::Skipped) | None => return Ok(()),
    };

    // This part is lost; keep draining so later parts survive
    if let Some(CurrentPart::File {
        field,
        filename,
        sink,
    }) = current.take()
    {
        sink.abort().await;
        logger::log_upload_failed(&filename, &write_err);
        record_io_error(first_io_error, &filename, write_err);
        failed.push(FailedFile { field, filename });
        *current = Some(CurrentPart::Skipped);
    }
    Ok(())
}

/// Close out the current part, committing sinks and recording fields.
async fn close_part<S>(
    ctx: &mut RequestContext,
    current: &mut Option<CurrentPart<S>>,
    saved: &mut Vec<SavedFile>,
    failed: &mut Vec<FailedFile>,
    first_io_error: &mut Option<PipelineError>,
) where
    S: FileStore,
{
    match current.take() {
        Some(CurrentPart::File {
            field,
            filename,
            sink,
        }) => match sink.finish().await {
            Ok(size_bytes) => {
                logger::log_upload_saved(&filename, size_bytes);
                let record = SavedFile {
                    field,
                    filename,
                    size_bytes,
                };
                ctx.files.push(record.clone());
                saved.push(record);
            }
            Err(e) => {
                logger::log_upload_failed(&filename, &e);
                record_io_error(first_io_error, &filename, e);
                failed.push(FailedFile { field, filename });
            }
        },
        Some(CurrentPart::Field { name, value }) => {
            let text = String::from_utf8_lossy(&value).into_owned();
            ctx.form_fields.insert(name, text);
        }
        Some(CurrentPart::Skipped) | None => {}
    }
}

async fn abort_current<S>(current: &mut Option<CurrentPart<S>>)
where
    S: FileStore,
{
    if let Some(CurrentPart::File { sink, .. }) = current.take() {
        sink.abort().await;
    }
}

fn record_io_error(slot: &mut Option<PipelineError>, filename: &str, source: std::io::Error) {
    if slot.is_none() {
        *slot = Some(PipelineError::UploadIo {
            filename: filename.to_string(),
            source,
        });
    }
}

/// Reduce a client-supplied file name to its final path component.
fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use hyper::header::{HeaderMap, HeaderValue};
    use hyper::Method;

    #[test]
    fn filenames_are_reduced_to_their_last_component() {
        assert_eq!(
            sanitize_filename("../../etc/passwd"),
            Some("passwd".to_string())
        );
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\cv.pdf"),
            Some("cv.pdf".to_string())
        );
        assert_eq!(sanitize_filename("plain.txt"), Some("plain.txt".to_string()));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn non_multipart_content_type_is_unsupported() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let mut ctx = RequestContext::buffered(
            Method::POST,
            "/upload",
            headers,
            Bytes::from_static(b"{}"),
        );

        let store = Arc::new(DiskStore::new());
        let err = run_upload(&mut ctx, &store, PathBuf::from("/tmp"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedContentType(_)));
    }

    #[tokio::test]
    async fn missing_boundary_is_answered_inline() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("multipart/form-data"),
        );
        let mut ctx =
            RequestContext::buffered(Method::POST, "/upload", headers, Bytes::from_static(b""));

        let store = Arc::new(DiskStore::new());
        let resp = run_upload(&mut ctx, &store, PathBuf::from("/tmp"), 1024)
            .await
            .expect("inline response, not an error");
        assert_eq!(resp.status(), 400);
    }
}
