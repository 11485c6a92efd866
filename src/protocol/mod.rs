pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod mapping;
pub mod openai_chat;

use crate::error::CanonicalError;
use crate::stream::SseEvent;

use canonical::Delta;

/// Turns one upstream SSE event into at most one validated [`Delta`].
///
/// Decoders own whatever per-stream state their dialect needs (open block
/// kinds, running usage). `Ok(None)` means the event carried nothing the
/// normalizer cares about: keep-alives, bookkeeping frames, `[DONE]`.
pub trait DeltaDecoder: Send {
    /// # Errors
    ///
    /// Returns [`CanonicalError::Upstream`] when the upstream reports an error
    /// in-band.
    fn decode(&mut self, event: &SseEvent) -> Result<Option<Delta>, CanonicalError>;
}

/// Parse a JSON frame body, logging and skipping frames that do not parse.
pub(crate) fn parse_frame<T: serde::de::DeserializeOwned>(
    dialect: &'static str,
    data: &str,
) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(dialect, error = %err, "skipping unparseable stream frame");
            None
        }
    }
}

/// Drop an all-empty delta so it never reaches the normalizer.
pub(crate) fn non_empty(delta: Delta) -> Option<Delta> {
    (!delta.is_empty()).then_some(delta)
}
