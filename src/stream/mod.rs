pub mod normalizer;
pub mod sse;
pub mod tag_splitter;
pub mod tool_calls;
pub mod usage;

pub use normalizer::{NormalizerOptions, NormalizerPhase, ReasoningGate, StreamNormalizer};
pub use sse::{sse_frame_stream, SseEvent, SseParser};
pub use tag_splitter::{TagSpan, TagSplitter};
pub use tool_calls::{AssemblyMode, PendingToolCall, ToolCallAssembler};
pub use usage::{
    Clock, ManualClock, NoPricing, PerMillionPricing, Pricing, SystemClock, UsageAccumulator,
};
