use smallvec::SmallVec;

use crate::error::CanonicalError;
use crate::protocol::canonical::{Delta, RawUsage, ToolCallFragment};
use crate::protocol::gemini::{GeminiErrorBody, GeminiStreamChunk, GeminiUsageMetadata};
use crate::protocol::mapping::gemini_finish_to_canonical;
use crate::protocol::{non_empty, parse_frame, DeltaDecoder};
use crate::stream::SseEvent;
use crate::util::next_call_id;

/// Decoder for Gemini `streamGenerateContent?alt=sse` streams.
///
/// Gemini sends every function call whole, with no index or (usually) id. The
/// decoder hands out a stream-wide running index and synthesizes missing ids,
/// so each call arrives as one front-loaded fragment.
#[derive(Debug, Default)]
pub struct GeminiStreamDecoder {
    next_tool_index: usize,
}

impl GeminiStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one parsed chunk. Only the first candidate is consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Upstream`] for an in-band `error` object.
    pub fn decode_chunk(
        &mut self,
        chunk: GeminiStreamChunk,
    ) -> Result<Option<Delta>, CanonicalError> {
        if let Some(error) = chunk.error {
            return Err(upstream_error(error));
        }

        let mut delta = Delta {
            usage: chunk.usage_metadata.map(raw_usage),
            ..Delta::default()
        };

        if let Some(candidate) = chunk.candidates.into_iter().next() {
            let mut text: Option<String> = None;
            let mut thoughts: Option<String> = None;
            let mut fragments = SmallVec::new();

            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(call) = part.function_call {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    let id = call
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(next_call_id);
                    let arguments = call
                        .args
                        .and_then(|args| serde_json::to_string(&args).ok())
                        .unwrap_or_else(|| String::from("{}"));
                    fragments.push(ToolCallFragment {
                        index,
                        id: Some(id),
                        name: Some(call.name),
                        arguments: Some(arguments),
                    });
                } else if let Some(part_text) = part.text {
                    let slot = if part.thought { &mut thoughts } else { &mut text };
                    slot.get_or_insert_with(String::new).push_str(&part_text);
                }
            }

            delta.content = text;
            delta.reasoning = thoughts;
            delta.tool_calls = fragments;
            delta.finish = candidate
                .finish_reason
                .as_deref()
                .map(gemini_finish_to_canonical);
        }

        Ok(non_empty(delta))
    }
}

impl DeltaDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Option<Delta>, CanonicalError> {
        if event.data.is_empty() {
            return Ok(None);
        }
        match parse_frame::<GeminiStreamChunk>("gemini", &event.data) {
            Some(chunk) => self.decode_chunk(chunk),
            None => Ok(None),
        }
    }
}

fn raw_usage(usage: GeminiUsageMetadata) -> RawUsage {
    RawUsage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
        cache_read_tokens: usage.cached_content_token_count,
        cache_write_tokens: 0,
    }
}

fn upstream_error(error: GeminiErrorBody) -> CanonicalError {
    let status = error
        .code
        .filter(|code| (400..=599).contains(code))
        .unwrap_or(500);
    let message = match error.status {
        Some(rpc_status) if !error.message.is_empty() => format!("{rpc_status}: {}", error.message),
        Some(rpc_status) => rpc_status,
        None => error.message,
    };
    CanonicalError::Upstream { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::FinishReason;

    fn feed(
        decoder: &mut GeminiStreamDecoder,
        data: &str,
    ) -> Result<Option<Delta>, CanonicalError> {
        decoder.decode(&SseEvent {
            data: data.to_owned(),
            ..SseEvent::default()
        })
    }

    #[test]
    fn thought_parts_are_reasoning() {
        let mut decoder = GeminiStreamDecoder::new();
        let delta = feed(
            &mut decoder,
            r#"{"candidates":[{"content":{"role":"model","parts":[
                {"text":"considering","thought":true},
                {"text":"Hel"},{"text":"lo"}
            ]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(delta.reasoning.as_deref(), Some("considering"));
        assert_eq!(delta.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn function_calls_get_running_indices_and_ids() {
        let mut decoder = GeminiStreamDecoder::new();
        let first = feed(
            &mut decoder,
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"ls","args":{"path":"/"}}}]}}]}"#,
        )
        .unwrap()
        .unwrap();
        let second = feed(
            &mut decoder,
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"id":"fc_9","name":"cat"}}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap()
        .unwrap();

        let call = &first.tool_calls[0];
        assert_eq!(call.index, 0);
        assert!(call.id.as_deref().is_some_and(|id| id.starts_with("call_")));
        assert_eq!(call.name.as_deref(), Some("ls"));
        assert_eq!(call.arguments.as_deref(), Some(r#"{"path":"/"}"#));

        let call = &second.tool_calls[0];
        assert_eq!(call.index, 1);
        assert_eq!(call.id.as_deref(), Some("fc_9"));
        assert_eq!(call.arguments.as_deref(), Some("{}"));
        assert_eq!(second.finish, Some(FinishReason::Stop));
    }

    #[test]
    fn usage_counts_thoughts_as_output() {
        let mut decoder = GeminiStreamDecoder::new();
        let delta = feed(
            &mut decoder,
            r#"{"usageMetadata":{"promptTokenCount":50,"candidatesTokenCount":7,"thoughtsTokenCount":3,"cachedContentTokenCount":40}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            delta.usage,
            Some(RawUsage {
                input_tokens: 50,
                output_tokens: 10,
                cache_read_tokens: 40,
                cache_write_tokens: 0,
            })
        );
    }

    #[test]
    fn in_band_error_keeps_code() {
        let mut decoder = GeminiStreamDecoder::new();
        let err = feed(
            &mut decoder,
            r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CanonicalError::Upstream { status: 429, ref message }
                if message == "RESOURCE_EXHAUSTED: quota"
        ));
    }

    #[test]
    fn empty_candidate_is_skipped() {
        let mut decoder = GeminiStreamDecoder::new();
        assert_eq!(
            feed(&mut decoder, r#"{"candidates":[{"content":{"parts":[]}}]}"#).unwrap(),
            None
        );
    }
}
