//! Time primitives.
//!
//! Two clocks coexist in the engine: `event_time_ms` (the exchange clock,
//! milliseconds UTC) is canonical; `received_time_ns` (nanoseconds UTC) is a
//! secondary tie-break only, never used for windowing or funding decisions.
//! `EngineClock` never reads wall-clock time — all time in a run comes from
//! the replayed event stream.

use std::fmt;

/// Milliseconds since Unix epoch. i64 covers the full supported time range.
pub type EventTimeMs = i64;

/// Nanoseconds since Unix epoch, used only for tie-breaking.
pub type ReceivedTimeNs = i64;

pub const MS_PER_SEC: i64 = 1_000;
pub const NS_PER_MS: i64 = 1_000_000;
pub const NS_PER_SEC: i64 = 1_000_000_000;

/// The engine's notion of "now", advanced only by the replayed event stream
/// or by tick emission. Never backed by `SystemTime`/`Instant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineClock {
    now_ms: EventTimeMs,
}

impl EngineClock {
    #[inline]
    pub fn new(start_ms: EventTimeMs) -> Self {
        Self { now_ms: start_ms }
    }

    #[inline]
    pub fn now_ms(&self) -> EventTimeMs {
        self.now_ms
    }

    /// Advance the clock forward. Regression here is a programming error:
    /// callers use this for internally-derived forward motion (tick grid
    /// emission) where the new value is already known to be `>=` the
    /// current one.
    #[inline]
    pub fn advance_to(&mut self, new_ms: EventTimeMs) {
        debug_assert!(
            new_ms >= self.now_ms,
            "EngineClock: cannot go backward from {} to {}",
            self.now_ms,
            new_ms
        );
        self.now_ms = new_ms;
    }

    /// Set the clock to an incoming event's `event_time_ms` unconditionally,
    /// including backward, per §4.4 step 2: when
    /// `strict_event_time_monotonic` is off, a regression is tolerated (not a
    /// programming error) and the engine loop has already decided, before
    /// calling this, whether to fail fast instead.
    #[inline]
    pub fn set_now_ms(&mut self, new_ms: EventTimeMs) {
        self.now_ms = new_ms;
    }
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for EngineClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.now_ms)
    }
}

/// Parse an RFC3339 timestamp into `event_time_ms`, for adapters that need
/// to translate human-readable dataset timestamps.
pub fn parse_timestamp_ms(s: &str) -> Option<EventTimeMs> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc).timestamp_millis())
}
