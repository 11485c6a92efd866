use rustc_hash::FxHashMap;

use crate::error::CanonicalError;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicErrorBody, AnthropicStreamEvent, AnthropicUsage,
};
use crate::protocol::canonical::{Delta, RawUsage, ToolCallFragment};
use crate::protocol::mapping::anthropic_stop_to_canonical;
use crate::protocol::{non_empty, parse_frame, DeltaDecoder};
use crate::stream::SseEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse { tool_index: usize },
    Other,
}

/// Stateful decoder for Anthropic Messages streams.
///
/// Anthropic addresses content by block index, and text, thinking and
/// `tool_use` blocks share one index space. The decoder records each block's
/// kind on `content_block_start` so `input_json_delta` frames can be routed to
/// a dense tool-call index. Open blocks are keyed by their wire index. Usage is
/// merged across `message_start` and `message_delta`, since each frame only
/// carries part of it.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    blocks: FxHashMap<usize, BlockKind>,
    tool_count: usize,
    usage: AnthropicUsage,
}

impl AnthropicStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one typed stream event.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Upstream`] for an in-band `error` event.
    pub fn decode_event(
        &mut self,
        event: AnthropicStreamEvent,
    ) -> Result<Option<Delta>, CanonicalError> {
        let delta = match event {
            AnthropicStreamEvent::MessageStart { message } => match message.usage {
                Some(usage) => Delta::usage(self.merge_usage(usage)),
                None => return Ok(None),
            },
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.open_block(index, content_block),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                self.block_delta(index, delta)
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                self.blocks.remove(&index);
                return Ok(None);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => Delta {
                finish: delta
                    .stop_reason
                    .as_deref()
                    .map(anthropic_stop_to_canonical),
                usage: usage.map(|usage| self.merge_usage(usage)),
                ..Delta::default()
            },
            AnthropicStreamEvent::Error { error } => return Err(upstream_error(error)),
            AnthropicStreamEvent::MessageStop {}
            | AnthropicStreamEvent::Ping {}
            | AnthropicStreamEvent::Unknown => return Ok(None),
        };
        Ok(non_empty(delta))
    }

    fn open_block(&mut self, index: usize, block: AnthropicContentBlock) -> Delta {
        let (kind, delta) = match block {
            AnthropicContentBlock::Text { text } => (
                BlockKind::Text,
                if text.is_empty() {
                    Delta::default()
                } else {
                    Delta::text(text)
                },
            ),
            AnthropicContentBlock::Thinking { thinking } => (
                BlockKind::Thinking,
                if thinking.is_empty() {
                    Delta::default()
                } else {
                    Delta::reasoning(thinking)
                },
            ),
            AnthropicContentBlock::ToolUse { id, name } => {
                let tool_index = self.tool_count;
                self.tool_count += 1;
                (
                    BlockKind::ToolUse { tool_index },
                    Delta::tool_call(ToolCallFragment {
                        index: tool_index,
                        id: Some(id),
                        name: Some(name),
                        arguments: None,
                    }),
                )
            }
            AnthropicContentBlock::Unknown => (BlockKind::Other, Delta::default()),
        };
        self.blocks.insert(index, kind);
        delta
    }

    fn block_delta(&mut self, index: usize, delta: AnthropicDelta) -> Delta {
        match delta {
            AnthropicDelta::TextDelta { text } => Delta::text(text),
            AnthropicDelta::ThinkingDelta { thinking } => Delta::reasoning(thinking),
            AnthropicDelta::InputJsonDelta { partial_json } => {
                let Some(BlockKind::ToolUse { tool_index }) = self.blocks.get(&index) else {
                    tracing::debug!(index, "input_json_delta outside a tool_use block");
                    return Delta::default();
                };
                Delta::tool_call(ToolCallFragment {
                    index: *tool_index,
                    arguments: Some(partial_json),
                    ..ToolCallFragment::default()
                })
            }
            AnthropicDelta::Unknown => Delta::default(),
        }
    }

    fn merge_usage(&mut self, update: AnthropicUsage) -> RawUsage {
        let merged = &mut self.usage;
        merged.input_tokens = update.input_tokens.or(merged.input_tokens);
        merged.output_tokens = update.output_tokens.or(merged.output_tokens);
        merged.cache_creation_input_tokens = update
            .cache_creation_input_tokens
            .or(merged.cache_creation_input_tokens);
        merged.cache_read_input_tokens = update
            .cache_read_input_tokens
            .or(merged.cache_read_input_tokens);

        let cache_write_tokens = merged.cache_creation_input_tokens.unwrap_or(0);
        let cache_read_tokens = merged.cache_read_input_tokens.unwrap_or(0);
        // Anthropic's input_tokens excludes both cache buckets.
        RawUsage {
            input_tokens: merged.input_tokens.unwrap_or(0) + cache_write_tokens + cache_read_tokens,
            output_tokens: merged.output_tokens.unwrap_or(0),
            cache_read_tokens,
            cache_write_tokens,
        }
    }
}

impl DeltaDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Option<Delta>, CanonicalError> {
        if event.data.is_empty() {
            return Ok(None);
        }
        match parse_frame::<AnthropicStreamEvent>("anthropic", &event.data) {
            Some(parsed) => self.decode_event(parsed),
            None => Ok(None),
        }
    }
}

fn upstream_error(error: AnthropicErrorBody) -> CanonicalError {
    let status = match error.type_.as_str() {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    };
    CanonicalError::Upstream {
        status,
        message: error.message,
    }
}
