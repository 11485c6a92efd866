use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::protocol::canonical::{ModelInfo, RawUsage, UsageSnapshot};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Millisecond wall-clock source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Monotonic clock anchored at construction time.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Injected cost function.
///
/// `uncached_input` already excludes cache reads and writes.
pub trait Pricing: Send + Sync {
    fn cost(
        &self,
        model: &ModelInfo,
        uncached_input: u64,
        output: u64,
        cache_write: u64,
        cache_read: u64,
    ) -> f64;
}

impl<F> Pricing for F
where
    F: Fn(&ModelInfo, u64, u64, u64, u64) -> f64 + Send + Sync,
{
    fn cost(
        &self,
        model: &ModelInfo,
        uncached_input: u64,
        output: u64,
        cache_write: u64,
        cache_read: u64,
    ) -> f64 {
        self(model, uncached_input, output, cache_write, cache_read)
    }
}

/// Prices from [`ModelInfo`], in USD per million tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerMillionPricing;

impl Pricing for PerMillionPricing {
    #[allow(clippy::cast_precision_loss)]
    fn cost(
        &self,
        model: &ModelInfo,
        uncached_input: u64,
        output: u64,
        cache_write: u64,
        cache_read: u64,
    ) -> f64 {
        let micro = uncached_input as f64 * model.input_price
            + output as f64 * model.output_price
            + cache_write as f64 * model.cache_write_price
            + cache_read as f64 * model.cache_read_price;
        micro / 1_000_000.0
    }
}

/// Always free.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPricing;

impl Pricing for NoPricing {
    fn cost(&self, _: &ModelInfo, _: u64, _: u64, _: u64, _: u64) -> f64 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Tracks token counts and timestamps for one stream and derives the final
/// [`UsageSnapshot`].
pub struct UsageAccumulator {
    model: ModelInfo,
    pricing: Arc<dyn Pricing>,
    clock: Arc<dyn Clock>,
    start_ms: Option<u64>,
    first_token_ms: Option<u64>,
    last_usage: Option<RawUsage>,
}

impl fmt::Debug for UsageAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageAccumulator")
            .field("model", &self.model.id)
            .field("start_ms", &self.start_ms)
            .field("first_token_ms", &self.first_token_ms)
            .field("last_usage", &self.last_usage)
            .finish_non_exhaustive()
    }
}

impl UsageAccumulator {
    #[must_use]
    pub fn new(model: ModelInfo, pricing: Arc<dyn Pricing>, clock: Arc<dyn Clock>) -> Self {
        Self {
            model,
            pricing,
            clock,
            start_ms: None,
            first_token_ms: None,
            last_usage: None,
        }
    }

    /// Accumulator on the system clock with [`PerMillionPricing`].
    #[must_use]
    pub fn with_system_clock(model: ModelInfo) -> Self {
        Self::new(
            model,
            Arc::new(PerMillionPricing),
            Arc::new(SystemClock::new()),
        )
    }

    #[must_use]
    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.start_ms.is_some()
    }

    /// Record the stream start. Only the first call counts.
    pub fn start_clock(&mut self) {
        if self.start_ms.is_none() {
            self.start_ms = Some(self.clock.now_ms());
        }
    }

    /// Called once per delta; the first visible one fixes the first-token time.
    pub fn observe_token(&mut self, has_visible_content: bool) {
        if !has_visible_content || self.first_token_ms.is_some() {
            return;
        }
        self.start_clock();
        self.first_token_ms = Some(self.clock.now_ms());
    }

    /// Backends resend cumulative totals, so the newest report replaces the
    /// previous one.
    pub fn observe_usage(&mut self, usage: RawUsage) {
        self.last_usage = Some(usage);
    }

    #[must_use]
    pub fn has_usage(&self) -> bool {
        self.last_usage.is_some()
    }

    /// Compute the snapshot. Returns `None` when no usage was ever observed,
    /// and on every call after the first.
    pub fn finish(&mut self) -> Option<UsageSnapshot> {
        let usage = self.last_usage.take()?;
        let end_ms = self.clock.now_ms();
        let start_ms = self.start_ms.unwrap_or(end_ms);

        let total_latency_ms = end_ms.saturating_sub(start_ms);
        let first_token_latency_ms = self
            .first_token_ms
            .map_or(total_latency_ms, |first| first.saturating_sub(start_ms));
        let tokens_per_second = tokens_per_second(
            usage.output_tokens,
            total_latency_ms,
            first_token_latency_ms,
        );

        let cached_input = usage
            .cache_read_tokens
            .saturating_add(usage.cache_write_tokens);
        let uncached_input = usage.input_tokens.saturating_sub(cached_input);
        let cost = self.pricing.cost(
            &self.model,
            uncached_input,
            usage.output_tokens,
            usage.cache_write_tokens,
            usage.cache_read_tokens,
        );

        Some(UsageSnapshot {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_write_tokens: usage.cache_write_tokens,
            cost,
            tokens_per_second,
            first_token_latency_ms,
            total_latency_ms,
        })
    }
}

/// Decode throughput, excluding time-to-first-token when there is enough
/// data to do so.
#[allow(clippy::cast_precision_loss)]
fn tokens_per_second(output_tokens: u64, total_ms: u64, first_token_ms: u64) -> f64 {
    if output_tokens > 1 && total_ms > first_token_ms {
        (output_tokens - 1) as f64 * 1000.0 / (total_ms - first_token_ms) as f64
    } else if output_tokens > 0 && total_ms > 0 {
        output_tokens as f64 * 1000.0 / total_ms as f64
    } else {
        0.0
    }
}
