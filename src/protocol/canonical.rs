use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// The dialect family an upstream backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAiChat,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    /// Parse the provider name used in configuration files.
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "openai" => Some(Self::OpenAiChat),
            "anthropic" => Some(Self::Anthropic),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    #[must_use]
    pub fn config_name(self) -> &'static str {
        match self {
            Self::OpenAiChat => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

/// Reason the upstream stopped generating.
///
/// Any finish reason doubles as the finish marker for the tool-call section of
/// the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

/// Raw token counts as last reported by the upstream.
///
/// `input_tokens` is inclusive of cache reads and writes. Adapters whose
/// backend reports the cache buckets separately fold them in at decode time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// One index-addressed piece of a streamed tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl ToolCallFragment {
    /// Whether the fragment carries anything worth echoing downstream.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.id.is_some()
            || non_empty_text(self.name.as_deref())
            || non_empty_text(self.arguments.as_deref())
    }
}

fn non_empty_text(value: Option<&str>) -> bool {
    value.is_some_and(|text| !text.is_empty())
}

/// One upstream streaming message, already validated into a sparse patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: SmallVec<[ToolCallFragment; 1]>,
    pub finish: Option<FinishReason>,
    pub usage: Option<RawUsage>,
}

impl Delta {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: Some(reasoning.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        let mut delta = Self::default();
        delta.tool_calls.push(fragment);
        delta
    }

    #[must_use]
    pub fn usage(usage: RawUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_finish(mut self, finish: FinishReason) -> Self {
        self.finish = Some(finish);
        self
    }

    /// A delta with none of the recognized fields. Such deltas are skipped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_empty()
            && self.finish.is_none()
            && self.usage.is_none()
    }

    /// Whether the delta carries text, reasoning, or tool-call content.
    #[must_use]
    pub fn has_visible_content(&self) -> bool {
        non_empty_text(self.content.as_deref())
            || non_empty_text(self.reasoning.as_deref())
            || self.tool_calls.iter().any(ToolCallFragment::has_payload)
    }
}

/// Usage and latency metrics for one completed stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost: f64,
    pub tokens_per_second: f64,
    pub first_token_latency_ms: u64,
    pub total_latency_ms: u64,
}

/// A finalized tool call whose arguments buffer did not parse as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
    pub message: String,
}

/// A single provider-independent stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Text {
        value: String,
    },
    Reasoning {
        value: String,
    },
    ToolCallPartial {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_fragment: Option<String>,
    },
    ToolCallEnd {
        index: usize,
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallError(MalformedToolCall),
    Usage(UsageSnapshot),
}

impl CanonicalEvent {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    #[must_use]
    pub fn reasoning(value: impl Into<String>) -> Self {
        Self::Reasoning {
            value: value.into(),
        }
    }
}

/// Static model metadata handed to the pricing collaborator.
///
/// Prices are USD per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
    #[serde(default)]
    pub cache_write_price: f64,
    #[serde(default)]
    pub cache_read_price: f64,
}

impl ModelInfo {
    #[must_use]
    pub fn unpriced(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Role of a message in a [`ChatRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Minimal, dialect-independent request shape the adapters encode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_delta_is_unrecognized() {
        assert!(Delta::default().is_empty());
        assert!(!Delta::text("").is_empty());
        assert!(!Delta::default().with_finish(FinishReason::Stop).is_empty());
    }

    #[test]
    fn visible_content_ignores_empty_fragments() {
        assert!(!Delta::text("").has_visible_content());
        assert!(Delta::reasoning("hm").has_visible_content());
        let bare = Delta::tool_call(ToolCallFragment {
            index: 0,
            arguments: Some(String::new()),
            ..ToolCallFragment::default()
        });
        assert!(!bare.has_visible_content());
        let opening = Delta::tool_call(ToolCallFragment {
            index: 0,
            id: Some("call_1".into()),
            ..ToolCallFragment::default()
        });
        assert!(opening.has_visible_content());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(CanonicalEvent::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "value": "hi"}));

        let json = serde_json::to_value(CanonicalEvent::ToolCallPartial {
            index: 2,
            id: None,
            name: Some("run".into()),
            arguments_fragment: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "tool_call_partial", "index": 2, "name": "run"})
        );
    }

    #[test]
    fn provider_kind_config_names() {
        for kind in [
            ProviderKind::OpenAiChat,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
        ] {
            assert_eq!(
                ProviderKind::from_config_name(kind.config_name()),
                Some(kind)
            );
        }
        assert_eq!(ProviderKind::from_config_name("cohere"), None);
    }
}
