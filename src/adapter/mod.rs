//! Provider adapters: one per upstream dialect family.
//!
//! An adapter turns a [`ChatRequest`] into a prepared HTTP request, decodes
//! the SSE response into validated [`Delta`]s, and picks the
//! [`NormalizerOptions`] that fit the backend's quirks.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{future, Stream, StreamExt};

use crate::config::{ReasoningTagSetting, UpstreamServiceConfig};
use crate::error::CanonicalError;
use crate::protocol::anthropic::encoder::encode_anthropic_request;
use crate::protocol::anthropic::stream::AnthropicStreamDecoder;
use crate::protocol::canonical::{CanonicalEvent, ChatRequest, Delta, ModelInfo, ProviderKind};
use crate::protocol::gemini::encoder::encode_gemini_request;
use crate::protocol::gemini::stream::GeminiStreamDecoder;
use crate::protocol::openai_chat::encoder::encode_openai_chat_request;
use crate::protocol::openai_chat::stream::OpenAiChatDecoder;
use crate::protocol::DeltaDecoder;
use crate::stream::{
    sse_frame_stream, AssemblyMode, NormalizerOptions, ReasoningGate, SseEvent, StreamNormalizer,
    UsageAccumulator,
};
use crate::transport::HttpTransport;
use crate::util::trim_base_url;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_REASONING_TAG: &str = "think";
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Validated deltas from one upstream response.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, CanonicalError>> + Send>>;

/// Canonical events for one chat turn.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<CanonicalEvent, CanonicalError>> + Send>>;

/// A fully prepared upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    pub proxy: Option<String>,
}

/// Adapter bound to one configured upstream service.
#[derive(Debug, Clone)]
pub struct ProviderAdapter {
    kind: ProviderKind,
    name: String,
    base_url: String,
    model: String,
    max_tokens: Option<u64>,
    proxy: Option<String>,
    headers: http::HeaderMap,
    options: NormalizerOptions,
    model_info: ModelInfo,
}

impl ProviderAdapter {
    /// Build an adapter from a service entry.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Config`] for an unknown provider or a header
    /// value (API key, API version) that is not valid in HTTP.
    pub fn from_config(service: &UpstreamServiceConfig) -> Result<Self, CanonicalError> {
        let kind = ProviderKind::from_config_name(&service.provider).ok_or_else(|| {
            CanonicalError::Config(format!(
                "upstream service '{}' has unknown provider '{}'",
                service.name, service.provider
            ))
        })?;

        let options = NormalizerOptions {
            reasoning_tag: match &service.reasoning_tag {
                ReasoningTagSetting::DialectDefault => default_reasoning_tag(kind),
                ReasoningTagSetting::Disabled => None,
                ReasoningTagSetting::Tag(tag) => Some(tag.clone()),
            },
            reasoning_gate: service.reasoning_gate.unwrap_or(ReasoningGate::Always),
            tool_call_mode: service.tool_call_mode.unwrap_or(AssemblyMode::Sequential),
        };

        Ok(Self {
            kind,
            name: service.name.clone(),
            base_url: trim_base_url(&service.base_url).to_owned(),
            model: service.model.clone(),
            max_tokens: service.max_tokens,
            proxy: service
                .proxy
                .as_deref()
                .map(str::trim)
                .filter(|proxy| !proxy.is_empty())
                .map(str::to_owned),
            headers: build_provider_headers(kind, service)?,
            options,
            model_info: service.model_info(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn normalizer_options(&self) -> &NormalizerOptions {
        &self.options
    }

    #[must_use]
    pub fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    /// Streaming endpoint for this service.
    #[must_use]
    pub fn request_url(&self) -> String {
        let base = &self.base_url;
        match self.kind {
            ProviderKind::OpenAiChat => format!("{base}/chat/completions"),
            ProviderKind::Anthropic => format!("{base}/messages"),
            ProviderKind::Gemini => {
                format!("{base}/models/{}:streamGenerateContent?alt=sse", self.model)
            }
        }
    }

    /// Encode `request` for this dialect.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Internal`] if the body fails to serialize.
    pub fn build_request(&self, request: &ChatRequest) -> Result<UpstreamRequest, CanonicalError> {
        let body = match self.kind {
            ProviderKind::OpenAiChat => serde_json::to_vec(&encode_openai_chat_request(
                &self.model,
                request,
                self.max_tokens,
            )),
            ProviderKind::Anthropic => serde_json::to_vec(&encode_anthropic_request(
                &self.model,
                request,
                self.max_tokens,
            )),
            ProviderKind::Gemini => {
                serde_json::to_vec(&encode_gemini_request(request, self.max_tokens))
            }
        }
        .map_err(|err| CanonicalError::Internal(format!("failed to encode request body: {err}")))?;

        Ok(UpstreamRequest {
            url: self.request_url(),
            headers: self.headers.clone(),
            body: Bytes::from(body),
            proxy: self.proxy.clone(),
        })
    }

    /// Fresh per-stream decoder for this dialect.
    #[must_use]
    pub fn decoder(&self) -> Box<dyn DeltaDecoder> {
        match self.kind {
            ProviderKind::OpenAiChat => Box::new(OpenAiChatDecoder::new()),
            ProviderKind::Anthropic => Box::new(AnthropicStreamDecoder::new()),
            ProviderKind::Gemini => Box::new(GeminiStreamDecoder::new()),
        }
    }

    /// Send `request` and return the decoded delta stream.
    ///
    /// # Errors
    ///
    /// Returns [`CanonicalError::Upstream`] for a non-2xx response and
    /// [`CanonicalError::Transport`] when the request cannot be sent.
    pub async fn open_deltas(
        &self,
        transport: &HttpTransport,
        request: &ChatRequest,
    ) -> Result<DeltaStream, CanonicalError> {
        let prepared = self.build_request(request)?;
        tracing::debug!(
            upstream = %self.name,
            provider = %self.kind,
            url = %prepared.url,
            "opening upstream stream"
        );

        let response = transport
            .send_stream(
                &prepared.url,
                &prepared.headers,
                prepared.body,
                prepared.proxy.as_deref(),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| CanonicalError::Transport(format!("Failed to read error body: {e}")))?;
            let message = sanitize_upstream_error(&body);
            tracing::warn!(
                upstream = %self.name,
                status = status.as_u16(),
                error = %message,
                "upstream rejected request"
            );
            return Err(CanonicalError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        Ok(decode_deltas(
            sse_frame_stream(response.bytes_stream()),
            self.decoder(),
        ))
    }

    /// Stream one chat turn as canonical events.
    ///
    /// The usage clock starts before the request is sent, so first-token
    /// latency includes connection setup and upstream queueing.
    ///
    /// # Errors
    ///
    /// Failures before the response body starts (non-2xx, connect errors)
    /// are returned here; failures mid-stream arrive as the stream's last
    /// item.
    pub async fn stream_chat(
        &self,
        transport: &HttpTransport,
        request: &ChatRequest,
        usage: UsageAccumulator,
    ) -> Result<EventStream, CanonicalError> {
        let mut normalizer = StreamNormalizer::new(self.options.clone(), usage);
        normalizer.start_clock();
        let deltas = self.open_deltas(transport, request).await?;
        Ok(Box::pin(normalizer.normalize(deltas)))
    }
}

/// Run SSE frames through a dialect decoder, dropping frames that decode to
/// nothing.
pub fn decode_deltas<S>(frames: S, mut decoder: Box<dyn DeltaDecoder>) -> DeltaStream
where
    S: Stream<Item = Result<SseEvent, CanonicalError>> + Send + 'static,
{
    Box::pin(frames.filter_map(move |frame| {
        let decoded = match frame {
            Ok(event) => decoder.decode(&event).transpose(),
            Err(err) => Some(Err(err)),
        };
        future::ready(decoded)
    }))
}

fn default_reasoning_tag(kind: ProviderKind) -> Option<String> {
    match kind {
        ProviderKind::OpenAiChat => Some(OPENAI_REASONING_TAG.to_owned()),
        ProviderKind::Anthropic | ProviderKind::Gemini => None,
    }
}

fn build_provider_headers(
    kind: ProviderKind,
    service: &UpstreamServiceConfig,
) -> Result<http::HeaderMap, CanonicalError> {
    let header_value = |value: &str, what: &str| {
        http::HeaderValue::from_str(value).map_err(|_| {
            CanonicalError::Config(format!(
                "upstream service '{}' has an invalid {what}",
                service.name
            ))
        })
    };

    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        http::header::ACCEPT,
        http::HeaderValue::from_static("text/event-stream"),
    );

    let key = service.api_key.as_str();
    match kind {
        ProviderKind::OpenAiChat => {
            let mut value = header_value(&format!("Bearer {key}"), "api_key")?;
            value.set_sensitive(true);
            headers.insert(http::header::AUTHORIZATION, value);
        }
        ProviderKind::Anthropic => {
            let mut value = header_value(key, "api_key")?;
            value.set_sensitive(true);
            headers.insert("x-api-key", value);
            let version = service
                .api_version
                .as_deref()
                .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
            headers.insert("anthropic-version", header_value(version, "api_version")?);
        }
        ProviderKind::Gemini => {
            let mut value = header_value(key, "api_key")?;
            value.set_sensitive(true);
            headers.insert("x-goog-api-key", value);
        }
    }

    Ok(headers)
}

/// Pull a readable message out of an upstream error body.
///
/// Understands `{"error":{"message":…}}` (OpenAI, Anthropic, Gemini), Gemini's
/// array-wrapped variant and `{"error":"…"}`; anything else is returned as
/// lossy text. The result is capped at a few hundred bytes.
pub(crate) fn sanitize_upstream_error(body: &[u8]) -> String {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            let json = match json {
                serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
                other => other,
            };
            let error = json.get("error")?;
            error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .or_else(|| error.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_owned());
    truncate_message(message)
}

fn truncate_message(mut message: String) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    message.push_str("...");
    message
}
