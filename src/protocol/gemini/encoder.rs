use crate::protocol::canonical::ChatRequest;
use crate::protocol::gemini::{
    GeminiContent, GeminiFunctionDeclaration, GeminiGenerationConfig, GeminiRequest,
    GeminiTextPart, GeminiToolDeclaration,
};
use crate::protocol::mapping::chat_role_to_gemini;

/// Encode a chat request into the Gemini `streamGenerateContent` body.
///
/// The model is part of the URL, not the body.
#[must_use]
pub fn encode_gemini_request(
    request: &ChatRequest,
    default_max_tokens: Option<u64>,
) -> GeminiRequest {
    let contents = request
        .messages
        .iter()
        .map(|msg| GeminiContent {
            role: Some(chat_role_to_gemini(msg.role)),
            parts: vec![GeminiTextPart {
                text: msg.content.clone(),
            }],
        })
        .collect();

    let system_instruction = request.system.as_ref().map(|system| GeminiContent {
        role: None,
        parts: vec![GeminiTextPart {
            text: system.clone(),
        }],
    });

    let tools = (!request.tools.is_empty()).then(|| {
        vec![GeminiToolDeclaration {
            function_declarations: request
                .tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }]
    });

    let generation_config = request
        .max_tokens
        .or(default_max_tokens)
        .map(|max| GeminiGenerationConfig {
            max_output_tokens: Some(max),
        });

    GeminiRequest {
        contents,
        tools,
        system_instruction,
        generation_config,
    }
}
