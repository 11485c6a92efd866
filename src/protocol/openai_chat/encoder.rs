use crate::protocol::canonical::ChatRequest;
use crate::protocol::mapping::chat_role_to_openai;

use super::{OpenAiChatRequest, OpenAiMessage, OpenAiStreamOptions, OpenAiTool, OpenAiToolFunction};

/// Encode a chat request into the `OpenAI` Chat Completions streaming format.
#[must_use]
pub fn encode_openai_chat_request(
    model: &str,
    request: &ChatRequest,
    default_max_tokens: Option<u64>,
) -> OpenAiChatRequest {
    let capacity = request.messages.len() + usize::from(request.system.is_some());
    let mut messages = Vec::with_capacity(capacity);
    if let Some(system) = &request.system {
        messages.push(OpenAiMessage {
            role: "system",
            content: system.clone(),
        });
    }
    messages.extend(request.messages.iter().map(|msg| OpenAiMessage {
        role: chat_role_to_openai(msg.role),
        content: msg.content.clone(),
    }));

    let tools = (!request.tools.is_empty()).then(|| {
        request
            .tools
            .iter()
            .map(|tool| OpenAiTool {
                type_: "function",
                function: OpenAiToolFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect()
    });

    OpenAiChatRequest {
        model: model.to_owned(),
        messages,
        tools,
        stream: true,
        stream_options: OpenAiStreamOptions {
            include_usage: true,
        },
        max_tokens: request.max_tokens.or(default_max_tokens),
    }
}
