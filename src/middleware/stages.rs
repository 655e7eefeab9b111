//! Built-in stages
//!
//! Cross-cutting stages most applications mount ahead of routing: body
//! size enforcement and urlencoded form parsing.

use super::Stage;
use crate::context::{parse_query, RequestContext};
use crate::error::PipelineError;
use crate::logger;
use crate::response;

/// Reject requests whose declared Content-Length exceeds `max_body_bytes`
/// with a 413 on the normal response path. Bodies without a declared
/// length are enforced later, where they are actually read.
pub fn body_limit_stage(max_body_bytes: u64) -> Stage {
    Stage::normal(move |ctx, next| {
        Box::pin(async move {
            if let Some(declared) = ctx.content_length() {
                if declared > max_body_bytes {
                    logger::log_warning(&format!(
                        "Request body too large: {declared} bytes (max: {max_body_bytes})"
                    ));
                    ctx.response = Some(response::build_413_response());
                    return;
                }
            }
            next.proceed();
        })
    })
}

/// Parse `application/x-www-form-urlencoded` bodies into
/// `ctx.form_fields`, then continue. Other content types pass through
/// untouched so the upload handler can stream them itself.
pub fn form_parser_stage(max_body_bytes: u64) -> Stage {
    Stage::normal(move |ctx, next| {
        Box::pin(async move {
            if is_urlencoded(ctx) {
                match ctx.collect_body(max_body_bytes).await {
                    Ok(body) => match std::str::from_utf8(&body) {
                        Ok(text) => ctx.form_fields.extend(parse_query(text)),
                        Err(_) => {
                            // User input, answered inline
                            let err = PipelineError::MalformedBody(
                                "form body is not valid UTF-8".to_string(),
                            );
                            ctx.response = Some(response::build_error_response(&err));
                            return;
                        }
                    },
                    Err(err @ PipelineError::PayloadTooLarge { .. }) => {
                        ctx.response = Some(response::build_error_response(&err));
                        return;
                    }
                    Err(err) => {
                        next.fail(err);
                        return;
                    }
                }
            }
            next.proceed();
        })
    })
}

fn is_urlencoded(ctx: &RequestContext) -> bool {
    ctx.content_type().is_some_and(|ct| {
        ct.split(';')
            .next()
            .unwrap_or("")
            .trim()
            .eq_ignore_ascii_case("application/x-www-form-urlencoded")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Chain;
    use crate::response::build_text_response;
    use hyper::body::Bytes;
    use hyper::header::{HeaderMap, HeaderValue};
    use hyper::Method;

    fn form_ctx(body: &'static [u8]) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        headers.insert("content-length", HeaderValue::from(body.len()));
        RequestContext::buffered(Method::POST, "/submit", headers, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn form_fields_are_parsed_and_decoded() {
        let mut chain = Chain::new();
        chain.push(form_parser_stage(1024));
        chain.push(Stage::normal(|ctx, _next| {
            Box::pin(async move {
                let name = ctx.form_fields.get("name").cloned().unwrap_or_default();
                ctx.response = Some(build_text_response(format!("Thank you, {name}!")));
            })
        }));

        let mut ctx = form_ctx(b"name=Ada+Lovelace&email=ada%40example.com");
        let _resp = chain.run(&mut ctx).await;
        assert_eq!(ctx.form_fields["name"], "Ada Lovelace");
        assert_eq!(ctx.form_fields["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn oversized_declared_body_is_rejected_with_413() {
        let mut chain = Chain::new();
        chain.push(body_limit_stage(8));
        chain.push(Stage::normal(|ctx, _next| {
            Box::pin(async move {
                ctx.response = Some(build_text_response("should not run"));
            })
        }));

        let mut ctx = form_ctx(b"name=far-too-long-for-the-limit");
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 413);
    }

    #[tokio::test]
    async fn non_form_bodies_pass_through_untouched() {
        let mut chain = Chain::new();
        chain.push(form_parser_stage(1024));
        chain.push(Stage::normal(|ctx, _next| {
            Box::pin(async move {
                // Body must still be available downstream
                let chunk = ctx.next_body_chunk().await.unwrap();
                assert!(chunk.is_some());
                ctx.response = Some(build_text_response("ok"));
            })
        }));

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let mut ctx = RequestContext::buffered(
            Method::POST,
            "/raw",
            headers,
            Bytes::from_static(b"raw bytes"),
        );
        let resp = chain.run(&mut ctx).await;
        assert_eq!(resp.status(), 200);
        assert!(ctx.form_fields.is_empty());
    }
}
