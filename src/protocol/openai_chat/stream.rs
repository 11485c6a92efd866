use smallvec::SmallVec;

use crate::error::CanonicalError;
use crate::protocol::canonical::{Delta, RawUsage, ToolCallFragment};
use crate::protocol::mapping::openai_finish_to_canonical;
use crate::protocol::{non_empty, parse_frame, DeltaDecoder};
use crate::stream::SseEvent;

use super::{OpenAiErrorBody, OpenAiStreamChunk, OpenAiStreamToolCall, OpenAiUsage};

const DEFAULT_ERROR_STATUS: u16 = 502;

/// Decoder for `OpenAI` Chat Completions compatible streams.
///
/// Stateless: every chunk is already a sparse patch over the response.
#[derive(Debug, Default)]
pub struct OpenAiChatDecoder;

impl OpenAiChatDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DeltaDecoder for OpenAiChatDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Option<Delta>, CanonicalError> {
        if event.is_done() || event.data.is_empty() {
            return Ok(None);
        }
        let Some(chunk) = parse_frame::<OpenAiStreamChunk>("openai", &event.data) else {
            return Ok(None);
        };
        decode_openai_stream_chunk(chunk)
    }
}

/// Decode one parsed chunk. Only the first choice is consumed.
///
/// # Errors
///
/// Returns [`CanonicalError::Upstream`] for an in-band `error` object.
pub fn decode_openai_stream_chunk(
    chunk: OpenAiStreamChunk,
) -> Result<Option<Delta>, CanonicalError> {
    if let Some(error) = chunk.error {
        return Err(upstream_error(error));
    }

    let mut delta = Delta {
        usage: chunk.usage.map(raw_usage),
        ..Delta::default()
    };

    if let Some(choice) = chunk.choices.into_iter().next() {
        let wire = choice.delta;
        delta.content = wire.content;
        delta.reasoning = wire.reasoning_content.or(wire.reasoning);
        if let Some(tool_calls) = wire.tool_calls {
            delta.tool_calls = tool_fragments(tool_calls);
        }
        delta.finish = choice
            .finish_reason
            .as_deref()
            .map(openai_finish_to_canonical);
    }

    Ok(non_empty(delta))
}

fn tool_fragments(tool_calls: Vec<OpenAiStreamToolCall>) -> SmallVec<[ToolCallFragment; 1]> {
    tool_calls
        .into_iter()
        .enumerate()
        .map(|(position, call)| {
            let (name, arguments) = call
                .function
                .map(|function| (function.name, function.arguments))
                .unwrap_or_default();
            ToolCallFragment {
                index: call.index.map_or(position, |index| index as usize),
                id: call.id.filter(|id| !id.is_empty()),
                name,
                arguments,
            }
        })
        .collect()
}

fn raw_usage(usage: OpenAiUsage) -> RawUsage {
    // prompt_tokens already includes cached tokens.
    let cache_read_tokens = usage
        .prompt_tokens_details
        .and_then(|details| details.cached_tokens)
        .or(usage.prompt_cache_hit_tokens)
        .unwrap_or(0);
    RawUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_tokens,
        cache_write_tokens: 0,
    }
}

fn upstream_error(error: OpenAiErrorBody) -> CanonicalError {
    let status = match &error.code {
        Some(serde_json::Value::Number(code)) => code.as_u64(),
        Some(serde_json::Value::String(code)) => code.parse().ok(),
        _ => None,
    }
    .and_then(|code| u16::try_from(code).ok())
    .filter(|code| (400..=599).contains(code))
    .unwrap_or(DEFAULT_ERROR_STATUS);
    CanonicalError::Upstream {
        status,
        message: error.message,
    }
}
