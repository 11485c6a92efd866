//! Incremental SSE (Server-Sent Events) parsing for upstream response bodies.
//!
//! Field handling follows the
//! [WHATWG event-stream format](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use std::collections::VecDeque;
use std::fmt;

use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;

use crate::error::CanonicalError;

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// `data: [DONE]`, the OpenAI-style terminal frame.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

// ---------------------------------------------------------------------------
// SseParser
// ---------------------------------------------------------------------------

/// Field state of the frame currently being assembled.
#[derive(Debug, Default)]
struct FrameFields {
    event_type: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl FrameFields {
    fn apply(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if self.has_data {
                out.push(SseEvent {
                    event: self.event_type.take(),
                    data: std::mem::take(&mut self.data),
                    id: self.last_event_id.clone(),
                });
                self.has_data = false;
            } else {
                self.event_type = None;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                } else {
                    self.has_data = true;
                }
                self.data.push_str(value);
            }
            "event" => self.event_type = Some(value.to_owned()),
            "id" => self.last_event_id = Some(value.to_owned()),
            // `retry` and unknown fields are ignored.
            _ => {}
        }
    }
}

/// Incremental SSE line parser.
///
/// Feed it text chunks cut at arbitrary boundaries; it yields fully-assembled
/// [`SseEvent`] frames.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    fields: FrameFields,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events to `out`.
    ///
    /// - `event:` sets the type of the next frame
    /// - `data:` lines are joined with `\n` (one leading space stripped)
    /// - an empty line dispatches the frame
    /// - `:` lines are comments
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let scan_start = self.read_offset;
        let mut processed_up_to = scan_start;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            self.fields
                .apply(line.strip_suffix('\r').unwrap_or(line), out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Dispatch whatever is pending at end of body, for backends that close
    /// the connection without a trailing blank line.
    pub fn finish(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let line = &self.buffer[self.read_offset..];
            self.fields
                .apply(line.strip_suffix('\r').unwrap_or(line), out);
        }
        self.buffer.clear();
        self.read_offset = 0;
        self.fields.apply("", out);
    }
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Bytes-to-text decoding that keeps a code point cut by a chunk boundary
/// until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn feed(&mut self, bytes: &[u8], parser: &mut SseParser, out: &mut Vec<SseEvent>) {
        if self.pending.is_empty() {
            match std::str::from_utf8(bytes) {
                Ok(text) => parser.feed_into(text, out),
                Err(err) if err.error_len().is_none() => {
                    let (valid, rest) = bytes.split_at(err.valid_up_to());
                    parser.feed_into(&String::from_utf8_lossy(valid), out);
                    self.pending.extend_from_slice(rest);
                }
                Err(_) => {
                    tracing::debug!("invalid UTF-8 in upstream body, replacing");
                    parser.feed_into(&String::from_utf8_lossy(bytes), out);
                }
            }
            return;
        }

        self.pending.extend_from_slice(bytes);
        let pending = std::mem::take(&mut self.pending);
        match std::str::from_utf8(&pending) {
            Ok(text) => parser.feed_into(text, out),
            Err(err) if err.error_len().is_none() => {
                let (valid, rest) = pending.split_at(err.valid_up_to());
                parser.feed_into(&String::from_utf8_lossy(valid), out);
                self.pending.extend_from_slice(rest);
            }
            Err(_) => {
                tracing::debug!("invalid UTF-8 in upstream body, replacing");
                parser.feed_into(&String::from_utf8_lossy(&pending), out);
            }
        }
    }

    fn finish(&mut self, parser: &mut SseParser, out: &mut Vec<SseEvent>) {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            parser.feed_into(&String::from_utf8_lossy(&pending), out);
        }
        parser.finish(out);
    }
}

struct FrameStreamState<S> {
    body: std::pin::Pin<Box<S>>,
    parser: SseParser,
    carry: Utf8Carry,
    parsed: Vec<SseEvent>,
    pending: VecDeque<SseEvent>,
    done: bool,
}

/// Split a byte stream into SSE events.
///
/// A body read error is surfaced as [`CanonicalError::Transport`] and ends
/// the stream; events already parsed are yielded first.
pub fn sse_frame_stream<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<SseEvent, CanonicalError>> + Send
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = FrameStreamState {
        body: Box::pin(byte_stream),
        parser: SseParser::new(),
        carry: Utf8Carry::default(),
        parsed: Vec::with_capacity(8),
        pending: VecDeque::with_capacity(8),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state
                        .carry
                        .feed(&bytes, &mut state.parser, &mut state.parsed);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((
                        Err(CanonicalError::Transport(format!(
                            "upstream body read failed: {err}"
                        ))),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    state.carry.finish(&mut state.parser, &mut state.parsed);
                }
            }
            state.pending.extend(state.parsed.drain(..));
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
