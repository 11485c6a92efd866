use crate::protocol::anthropic::{AnthropicMessage, AnthropicRequest, AnthropicTool};
use crate::protocol::canonical::ChatRequest;
use crate::protocol::mapping::chat_role_to_anthropic;

/// Used when neither the request nor the service config caps output.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Encode a chat request into the Anthropic Messages API streaming format.
///
/// `max_tokens` is mandatory for Anthropic; the request value wins over
/// `default_max_tokens`.
#[must_use]
pub fn encode_anthropic_request(
    model: &str,
    request: &ChatRequest,
    default_max_tokens: Option<u64>,
) -> AnthropicRequest {
    let messages = request
        .messages
        .iter()
        .map(|msg| AnthropicMessage {
            role: chat_role_to_anthropic(msg.role),
            content: msg.content.clone(),
        })
        .collect();

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        )
    };

    AnthropicRequest {
        model: model.to_owned(),
        max_tokens: request
            .max_tokens
            .or(default_max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        system: request.system.clone(),
        messages,
        tools,
        stream: true,
    }
}
