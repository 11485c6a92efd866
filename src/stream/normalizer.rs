use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::CanonicalError;
use crate::protocol::canonical::{CanonicalEvent, Delta};
use crate::stream::tag_splitter::{TagSpan, TagSplitter};
use crate::stream::tool_calls::{AssemblyMode, ToolCallAssembler};
use crate::stream::usage::UsageAccumulator;

/// When side-channel reasoning is allowed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningGate {
    /// Every reasoning fragment is emitted.
    #[default]
    Always,
    /// Reasoning that arrives after the first visible text or tool-call
    /// content is dropped.
    BeforeVisibleOutput,
}

/// Per-adapter behavior switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizerOptions {
    /// Inline tag whose contents are reasoning, e.g. `think`.
    pub reasoning_tag: Option<String>,
    pub reasoning_gate: ReasoningGate,
    pub tool_call_mode: AssemblyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerPhase {
    Idle,
    Streaming,
    Draining,
    Closed,
}

/// Single-pass driver turning upstream deltas into canonical events.
///
/// The instance owns stream-scoped state and is spent once it reaches
/// [`NormalizerPhase::Closed`].
#[derive(Debug)]
pub struct StreamNormalizer {
    options: NormalizerOptions,
    splitter: Option<TagSplitter>,
    tools: ToolCallAssembler,
    usage: UsageAccumulator,
    phase: NormalizerPhase,
    visible_output_seen: bool,
    spans: Vec<TagSpan>,
}

impl StreamNormalizer {
    #[must_use]
    pub fn new(options: NormalizerOptions, usage: UsageAccumulator) -> Self {
        let splitter = options.reasoning_tag.as_deref().map(TagSplitter::new);
        let tools = ToolCallAssembler::new(options.tool_call_mode);
        Self {
            options,
            splitter,
            tools,
            usage,
            phase: NormalizerPhase::Idle,
            visible_output_seen: false,
            spans: Vec::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> NormalizerPhase {
        self.phase
    }

    #[must_use]
    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Start the latency clock ahead of the first delta, e.g. right before
    /// the upstream request is sent. Later calls are no-ops.
    pub fn start_clock(&mut self) {
        self.usage.start_clock();
    }

    /// Process one delta, appending the events it produces to `out`.
    pub fn push_delta(&mut self, delta: Delta, out: &mut Vec<CanonicalEvent>) {
        match self.phase {
            NormalizerPhase::Idle => self.begin_streaming(),
            NormalizerPhase::Streaming => {}
            NormalizerPhase::Draining | NormalizerPhase::Closed => {
                tracing::warn!(phase = ?self.phase, "delta pushed after end of stream, ignored");
                return;
            }
        }

        if delta.is_empty() {
            tracing::debug!("skipping delta without recognized fields");
            return;
        }

        self.usage.observe_token(delta.has_visible_content());

        let Delta {
            content,
            reasoning,
            tool_calls,
            finish,
            usage,
        } = delta;

        if let Some(reasoning) = reasoning.filter(|text| !text.is_empty()) {
            self.emit_side_channel_reasoning(reasoning, out);
        }

        if let Some(content) = content.filter(|text| !text.is_empty()) {
            self.emit_content(&content, out);
        }

        if !tool_calls.is_empty() || finish.is_some() {
            if tool_calls.iter().any(|fragment| fragment.has_payload()) {
                self.visible_output_seen = true;
            }
            self.tools.ingest_into(tool_calls, finish.is_some(), out);
        }

        if let Some(usage) = usage {
            self.usage.observe_usage(usage);
        }
    }

    /// End-of-stream flush: trailing tag buffer, open tool calls, then the
    /// usage snapshot if one was observed.
    pub fn finish(&mut self, out: &mut Vec<CanonicalEvent>) {
        match self.phase {
            NormalizerPhase::Idle => self.begin_streaming(),
            NormalizerPhase::Streaming => {}
            NormalizerPhase::Draining | NormalizerPhase::Closed => return,
        }
        self.transition(NormalizerPhase::Draining);

        self.flush_splitter(out);
        self.tools.finalize_all_into(out);
        if let Some(snapshot) = self.usage.finish() {
            crate::observability::log_stream_usage(&self.usage.model().id, &snapshot);
            out.push(CanonicalEvent::Usage(snapshot));
        }

        self.transition(NormalizerPhase::Closed);
    }

    /// Best-effort flush after a transport failure. Buffered text and
    /// reasoning are released; open tool calls and usage are dropped.
    pub fn abort(&mut self, out: &mut Vec<CanonicalEvent>) {
        match self.phase {
            NormalizerPhase::Idle => self.begin_streaming(),
            NormalizerPhase::Streaming => {}
            NormalizerPhase::Draining | NormalizerPhase::Closed => return,
        }
        self.transition(NormalizerPhase::Draining);

        self.flush_splitter(out);
        let dropped = self.tools.discard();
        if dropped > 0 {
            tracing::warn!(dropped, "discarding unfinished tool calls after stream failure");
        }

        self.transition(NormalizerPhase::Closed);
    }

    /// Drive a delta stream to completion.
    ///
    /// The next delta is pulled only after every event from the previous one
    /// has been yielded. A delta error ends the stream after the abort flush.
    pub fn normalize<S>(
        mut self,
        deltas: S,
    ) -> impl Stream<Item = Result<CanonicalEvent, CanonicalError>>
    where
        S: Stream<Item = Result<Delta, CanonicalError>>,
    {
        self.start_clock();
        let state = NormalizeState {
            normalizer: self,
            deltas: Box::pin(deltas),
            pending: VecDeque::new(),
            scratch: Vec::new(),
            error: None,
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if let Some(err) = state.error.take() {
                    return Some((Err(err), state));
                }
                if state.exhausted {
                    return None;
                }

                match state.deltas.next().await {
                    Some(Ok(delta)) => state.normalizer.push_delta(delta, &mut state.scratch),
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "upstream stream failed");
                        state.normalizer.abort(&mut state.scratch);
                        state.error = Some(err);
                        state.exhausted = true;
                    }
                    None => {
                        state.normalizer.finish(&mut state.scratch);
                        state.exhausted = true;
                    }
                }
                state.pending.extend(state.scratch.drain(..));
            }
        })
    }

    fn begin_streaming(&mut self) {
        self.usage.start_clock();
        self.transition(NormalizerPhase::Streaming);
    }

    fn transition(&mut self, next: NormalizerPhase) {
        tracing::debug!(from = ?self.phase, to = ?next, "normalizer phase");
        self.phase = next;
    }

    fn emit_side_channel_reasoning(&mut self, reasoning: String, out: &mut Vec<CanonicalEvent>) {
        if self.options.reasoning_gate == ReasoningGate::BeforeVisibleOutput
            && self.visible_output_seen
        {
            tracing::debug!(len = reasoning.len(), "suppressing reasoning after visible output");
            return;
        }
        out.push(CanonicalEvent::Reasoning { value: reasoning });
    }

    fn emit_content(&mut self, content: &str, out: &mut Vec<CanonicalEvent>) {
        let Some(splitter) = self.splitter.as_mut() else {
            self.visible_output_seen = true;
            out.push(CanonicalEvent::text(content));
            return;
        };

        self.spans.clear();
        splitter.update_into(content, &mut self.spans);
        self.drain_spans(out);
    }

    fn flush_splitter(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(splitter) = self.splitter.as_mut() {
            self.spans.clear();
            self.spans.extend(splitter.finish());
            self.drain_spans(out);
        }
    }

    fn drain_spans(&mut self, out: &mut Vec<CanonicalEvent>) {
        for span in self.spans.drain(..) {
            if span.matched {
                out.push(CanonicalEvent::Reasoning { value: span.data });
            } else {
                self.visible_output_seen = true;
                out.push(CanonicalEvent::Text { value: span.data });
            }
        }
    }
}

struct NormalizeState<S> {
    normalizer: StreamNormalizer,
    deltas: Pin<Box<S>>,
    pending: VecDeque<CanonicalEvent>,
    scratch: Vec<CanonicalEvent>,
    error: Option<CanonicalError>,
    exhausted: bool,
}
