//! Streaming multipart/form-data parser
//!
//! Push-based state machine: the caller feeds body chunks in as they
//! arrive on the transport and drains events out. Part data is emitted
//! incrementally so a file part is never buffered whole; only a tail
//! shorter than the boundary delimiter is held back between chunks.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Cap on one part's header block; anything bigger is hostile input
const MAX_PART_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("malformed multipart stream: {0}")]
    Malformed(&'static str),
    #[error("multipart stream ended before the closing boundary")]
    Truncated,
}

/// Parsed headers of one part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    /// `name` parameter of Content-Disposition
    pub field: String,
    /// `filename` parameter, present for file parts
    pub filename: Option<String>,
    /// Part Content-Type, if declared
    pub content_type: Option<String>,
}

/// Events drained from the parser, in stream order
#[derive(Debug)]
pub enum MultipartEvent {
    /// A new part began
    PartHeaders(PartHeaders),
    /// A slice of the current part's payload
    Data(Bytes),
    /// The current part is complete
    PartEnd,
    /// The closing boundary was seen; no more events follow
    Finished,
}

enum State {
    /// Before the first boundary
    Preamble,
    /// Right after a boundary line, deciding close vs. next part
    AfterBoundary { first: bool },
    /// Reading a part's header block
    Headers,
    /// Reading a part's payload
    Body,
    /// Closing boundary seen; remaining input is epilogue
    Done,
}

/// Extract the `boundary` parameter from a Content-Type header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Incremental multipart parser for one request body.
pub struct MultipartParser {
    /// `\r\n--<boundary>`
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
    events: VecDeque<MultipartEvent>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            buf: BytesMut::new(),
            state: State::Preamble,
            events: VecDeque::new(),
        }
    }

    /// Feed one body chunk, queueing any events it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), MultipartError> {
        self.buf.extend_from_slice(chunk);
        self.process()
    }

    /// Drain the next queued event.
    pub fn next_event(&mut self) -> Option<MultipartEvent> {
        self.events.pop_front()
    }

    /// Must be called at end of input; fails if the closing boundary was
    /// never seen.
    pub fn finish(&self) -> Result<(), MultipartError> {
        match self.state {
            State::Done => Ok(()),
            _ => Err(MultipartError::Truncated),
        }
    }

    fn process(&mut self) -> Result<(), MultipartError> {
        loop {
            match self.state {
                State::Preamble => {
                    // The first boundary may open the body without the
                    // leading CRLF the delimiter carries
                    let bare = &self.delimiter[2..];
                    if self.buf.len() >= bare.len() && self.buf.starts_with(bare) {
                        let _ = self.buf.split_to(bare.len());
                        self.state = State::AfterBoundary { first: true };
                        continue;
                    }
                    match find(&self.buf, &self.delimiter) {
                        Some(pos) => {
                            // Anything before the first boundary is preamble
                            let _ = self.buf.split_to(pos + self.delimiter.len());
                            self.state = State::AfterBoundary { first: true };
                        }
                        None => {
                            self.discard_preamble();
                            return Ok(());
                        }
                    }
                }
                State::AfterBoundary { first } => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if self.buf.starts_with(b"--") {
                        if !first {
                            self.events.push_back(MultipartEvent::PartEnd);
                        }
                        self.events.push_back(MultipartEvent::Finished);
                        self.buf.clear();
                        self.state = State::Done;
                        return Ok(());
                    }
                    if self.buf.starts_with(b"\r\n") {
                        let _ = self.buf.split_to(2);
                        if !first {
                            self.events.push_back(MultipartEvent::PartEnd);
                        }
                        self.state = State::Headers;
                        continue;
                    }
                    return Err(MultipartError::Malformed("invalid boundary suffix"));
                }
                State::Headers => match find(&self.buf, b"\r\n\r\n") {
                    Some(pos) => {
                        let block = self.buf.split_to(pos + 4);
                        let headers = parse_part_headers(&block[..pos])?;
                        self.events.push_back(MultipartEvent::PartHeaders(headers));
                        self.state = State::Body;
                    }
                    None => {
                        if self.buf.len() > MAX_PART_HEADER_BYTES {
                            return Err(MultipartError::Malformed("part headers too long"));
                        }
                        return Ok(());
                    }
                },
                State::Body => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            let data = self.buf.split_to(pos).freeze();
                            self.events.push_back(MultipartEvent::Data(data));
                        }
                        let _ = self.buf.split_to(self.delimiter.len());
                        self.state = State::AfterBoundary { first: false };
                    }
                    None => {
                        // Hold back a possible partial delimiter
                        let safe = self.buf.len().saturating_sub(self.delimiter.len() - 1);
                        if safe > 0 {
                            let data = self.buf.split_to(safe).freeze();
                            self.events.push_back(MultipartEvent::Data(data));
                        }
                        return Ok(());
                    }
                },
                State::Done => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    /// Drop preamble bytes that can no longer start a delimiter match.
    fn discard_preamble(&mut self) {
        let keep = self.delimiter.len() - 1;
        if self.buf.len() > keep {
            let _ = self.buf.split_to(self.buf.len() - keep);
        }
    }
}

/// Naive subsequence search; needles here are short boundary strings.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parse one part's header block into `PartHeaders`.
fn parse_part_headers(block: &[u8]) -> Result<PartHeaders, MultipartError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| MultipartError::Malformed("part headers are not valid UTF-8"))?;

    let mut field = None;
    let mut filename = None;
    let mut content_type = None;

    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(MultipartError::Malformed("header line without colon"));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                let Some((key, raw)) = param.trim().split_once('=') else {
                    continue;
                };
                let unquoted = raw.trim().trim_matches('"').to_string();
                match key.trim() {
                    "name" => field = Some(unquoted),
                    "filename" => filename = Some(unquoted),
                    _ => {}
                }
            }
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    field.map_or(
        Err(MultipartError::Malformed(
            "part without a Content-Disposition name",
        )),
        |field| {
            Ok(PartHeaders {
                field,
                filename,
                content_type,
            })
        },
    )
}
