use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::protocol::canonical::{CanonicalEvent, MalformedToolCall, ToolCallFragment};
use crate::util::next_call_id;

/// How a backend addresses concurrently-building tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyMode {
    /// At most one call is open; a fragment for a new index finalizes it.
    #[default]
    Sequential,
    /// Calls are keyed strictly by index and stay open until the finish
    /// marker or end of stream.
    Interleaved,
}

/// Accumulator for one logical tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub index: usize,
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn open(index: usize) -> Self {
        Self {
            index,
            id: None,
            name: String::new(),
            arguments: String::new(),
        }
    }
}

/// Reconstructs tool invocations from index-addressed fragments.
///
/// Arguments are only parsed once a call is finalized, and every index that
/// ever received a fragment is finalized exactly once.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    mode: AssemblyMode,
    /// Open calls in the order their index was first seen.
    open: SmallVec<[PendingToolCall; 2]>,
    finalized: FxHashSet<usize>,
}

impl ToolCallAssembler {
    #[must_use]
    pub fn new(mode: AssemblyMode) -> Self {
        Self {
            mode,
            open: SmallVec::new(),
            finalized: FxHashSet::default(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> AssemblyMode {
        self.mode
    }

    #[must_use]
    pub fn open_calls(&self) -> &[PendingToolCall] {
        &self.open
    }

    #[must_use]
    pub fn has_open_calls(&self) -> bool {
        !self.open.is_empty()
    }

    /// Ingest the fragments of one delta and return the resulting events.
    pub fn ingest<I>(&mut self, fragments: I, finish_marker: bool) -> Vec<CanonicalEvent>
    where
        I: IntoIterator<Item = ToolCallFragment>,
    {
        let mut out = Vec::new();
        self.ingest_into(fragments, finish_marker, &mut out);
        out
    }

    /// Ingest the fragments of one delta, appending events to `out`.
    ///
    /// Fragments are applied before the finish marker, so a call whose only
    /// fragment rides on the finishing delta is still finalized.
    pub fn ingest_into<I>(
        &mut self,
        fragments: I,
        finish_marker: bool,
        out: &mut Vec<CanonicalEvent>,
    ) where
        I: IntoIterator<Item = ToolCallFragment>,
    {
        for fragment in fragments {
            self.apply_fragment(fragment, out);
        }
        if finish_marker {
            self.finalize_all_into(out);
        }
    }

    /// Finalize every call that is still open. Used at end of stream.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        self.finalize_all_into(&mut out);
        out
    }

    /// Finalize every open call, appending the terminal events to `out`.
    pub fn finalize_all_into(&mut self, out: &mut Vec<CanonicalEvent>) {
        for call in self.open.drain(..) {
            self.finalized.insert(call.index);
            out.push(finalize_call(call));
        }
    }

    /// Drop open calls without finalizing them. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.open.len();
        self.open.clear();
        dropped
    }

    fn apply_fragment(&mut self, fragment: ToolCallFragment, out: &mut Vec<CanonicalEvent>) {
        let index = fragment.index;
        if self.finalized.contains(&index) {
            tracing::warn!(
                index,
                "dropping tool-call fragment for an index that was already finalized"
            );
            return;
        }

        let slot = match self.mode {
            AssemblyMode::Sequential => {
                if self.open.last().is_some_and(|call| call.index != index) {
                    self.finalize_all_into(out);
                }
                if self.open.is_empty() {
                    tracing::debug!(index, "opening tool call");
                    self.open.push(PendingToolCall::open(index));
                }
                self.open.len() - 1
            }
            AssemblyMode::Interleaved => {
                if let Some(pos) = self.open.iter().position(|call| call.index == index) {
                    pos
                } else {
                    tracing::debug!(index, "opening tool call");
                    self.open.push(PendingToolCall::open(index));
                    self.open.len() - 1
                }
            }
        };

        let call = &mut self.open[slot];
        if let Some(id) = fragment.id.as_deref() {
            match call.id.as_deref() {
                None => call.id = Some(id.to_owned()),
                Some(existing) if existing != id => {
                    tracing::warn!(
                        index,
                        existing,
                        ignored = id,
                        "tool call id changed mid-call"
                    );
                }
                Some(_) => {}
            }
        }
        if let Some(name) = fragment.name.as_deref() {
            call.name.push_str(name);
        }
        if let Some(arguments) = fragment.arguments.as_deref() {
            call.arguments.push_str(arguments);
        }

        if fragment.has_payload() {
            out.push(CanonicalEvent::ToolCallPartial {
                index,
                id: fragment.id,
                name: fragment.name.filter(|name| !name.is_empty()),
                arguments_fragment: fragment.arguments.filter(|args| !args.is_empty()),
            });
        }
    }
}

fn finalize_call(call: PendingToolCall) -> CanonicalEvent {
    let PendingToolCall {
        index,
        id,
        name,
        arguments,
    } = call;
    let id = id.unwrap_or_else(next_call_id);

    match parse_arguments(&arguments) {
        Ok(parsed) => CanonicalEvent::ToolCallEnd {
            index,
            id,
            name,
            arguments: parsed,
        },
        Err(err) => {
            tracing::warn!(
                index,
                call_id = %id,
                tool = %name,
                error = %err,
                "tool call arguments are not valid JSON"
            );
            CanonicalEvent::ToolCallError(MalformedToolCall {
                index,
                id,
                name,
                raw_arguments: arguments,
                message: err.to_string(),
            })
        }
    }
}

/// Parse a finalized arguments buffer. An empty buffer means "no arguments".
fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}
