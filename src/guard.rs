//! Book guard.
//!
//! Trips the trading window closed when the book looks unreliable: spread
//! blown out, crossed, stale, or a sequence mismatch was just observed.
//! Mirrors the trip conditions the teacher's `l2_delta::BookError` variants
//! name, but as a stateful cooldown gate rather than a hard error: a tripped
//! guard blocks new submits for a configured cooldown window rather than
//! failing the run.

use crate::book::{DeltaResult, L2Book};
use crate::clock::EventTimeMs;
use tracing::{debug, warn};

/// Reasons a guard trip can be attributed to, surfaced in
/// `EngineError::GuardBlocked` messages and trace logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    CrossedBook,
    SpreadTooWide,
    Stale,
    SequenceMismatch,
    Warmup,
}

impl TripReason {
    fn as_str(&self) -> &'static str {
        match self {
            TripReason::CrossedBook => "crossed book",
            TripReason::SpreadTooWide => "spread exceeds max_spread_bps",
            TripReason::Stale => "book update stale",
            TripReason::SequenceMismatch => "sequence mismatch on last delta",
            TripReason::Warmup => "book has not yet received both sides",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BookGuardConfig {
    /// Absolute spread ceiling, in price units. `f64::INFINITY` disables it.
    pub max_spread: f64,
    /// Maximum tolerated bid/ask spread, in basis points of mid.
    pub max_spread_bps: f64,
    /// Maximum age, in ms, since the book's last update before it is
    /// considered stale.
    pub max_staleness_ms: i64,
    /// How long a trip blocks new submits for, from the event time of the
    /// trip.
    pub cooldown_ms: i64,
    /// Count of depth updates required before submits are allowed at all.
    pub warmup_depth_updates: u32,
    /// Whether a sequence mismatch forces the engine to rebuild the book
    /// from the next snapshot-equivalent update.
    pub reset_on_mismatch: bool,
    /// Whether a crossed book forces the engine to rebuild the book from the
    /// next snapshot-equivalent update.
    pub reset_on_crossed: bool,
}

impl Default for BookGuardConfig {
    fn default() -> Self {
        Self {
            max_spread: f64::INFINITY,
            max_spread_bps: 100.0,
            max_staleness_ms: 5_000,
            cooldown_ms: 1_000,
            warmup_depth_updates: 0,
            reset_on_mismatch: false,
            reset_on_crossed: false,
        }
    }
}

/// Per-symbol guard state. One instance per symbol, owned by the engine
/// alongside its `L2Book`.
#[derive(Debug, Clone)]
pub struct BookGuard {
    config: BookGuardConfig,
    /// Event time, in ms, until which the guard stays tripped. `None` means
    /// not currently tripped.
    tripped_until_ms: Option<EventTimeMs>,
    last_reason: Option<TripReason>,
    depth_updates_seen: u32,
    /// Set when the most recent trip requests the engine rebuild the book
    /// from the next snapshot-equivalent update, per `reset_on_mismatch` /
    /// `reset_on_crossed`. Consumed (and cleared) by `take_reset_request`.
    reset_requested: bool,
}

impl BookGuard {
    pub fn new(config: BookGuardConfig) -> Self {
        Self {
            config,
            tripped_until_ms: None,
            last_reason: None,
            depth_updates_seen: 0,
            reset_requested: false,
        }
    }

    /// Re-evaluate trip conditions against the current book state and the
    /// result of the delta that was just applied. Extends an active trip's
    /// cooldown only if a *new* trip condition fires; re-observing the same
    /// already-tripped condition does not restart the cooldown clock.
    pub fn on_delta_applied(&mut self, book: &L2Book, delta: &DeltaResult, now_ms: EventTimeMs) {
        self.depth_updates_seen += 1;

        if delta.sequence_mismatch {
            self.trip(TripReason::SequenceMismatch, now_ms);
            if self.config.reset_on_mismatch {
                self.reset_requested = true;
            }
            return;
        }
        if delta.crossed || book.is_crossed() {
            self.trip(TripReason::CrossedBook, now_ms);
            if self.config.reset_on_crossed {
                self.reset_requested = true;
            }
            return;
        }
        self.evaluate_passive(book, now_ms);
    }

    /// Re-evaluate staleness/warmup/spread without a delta having just
    /// landed, e.g. at tick boundaries.
    pub fn evaluate_passive(&mut self, book: &L2Book, now_ms: EventTimeMs) {
        if book.best_bid().is_none() || book.best_ask().is_none() {
            self.trip(TripReason::Warmup, now_ms);
            return;
        }
        if self.depth_updates_seen < self.config.warmup_depth_updates {
            self.trip(TripReason::Warmup, now_ms);
            return;
        }
        if now_ms - book.last_update_ms > self.config.max_staleness_ms {
            self.trip(TripReason::Stale, now_ms);
            return;
        }
        if let Some(spread) = book.spread() {
            if spread > self.config.max_spread {
                self.trip(TripReason::SpreadTooWide, now_ms);
                return;
            }
        }
        if let Some(spread_bps) = book.spread_bps() {
            if spread_bps > self.config.max_spread_bps {
                self.trip(TripReason::SpreadTooWide, now_ms);
                return;
            }
        }
        self.maybe_clear(now_ms);
    }

    /// Consume and clear a pending book-reset request from the most recent
    /// trip. The engine calls this after observing a trip to decide whether
    /// to rebuild the affected `L2Book`.
    pub fn take_reset_request(&mut self) -> bool {
        std::mem::replace(&mut self.reset_requested, false)
    }

    fn trip(&mut self, reason: TripReason, now_ms: EventTimeMs) {
        let already_tripped_same_reason =
            self.is_tripped(now_ms) && self.last_reason == Some(reason);
        if already_tripped_same_reason {
            debug!(reason = reason.as_str(), "guard: trip condition persists");
            return;
        }
        warn!(reason = reason.as_str(), now_ms, "guard: tripped");
        self.tripped_until_ms = Some(now_ms + self.config.cooldown_ms);
        self.last_reason = Some(reason);
    }

    fn maybe_clear(&mut self, now_ms: EventTimeMs) {
        if let Some(until) = self.tripped_until_ms {
            if now_ms >= until {
                self.tripped_until_ms = None;
                self.last_reason = None;
            }
        }
    }

    pub fn is_tripped(&self, now_ms: EventTimeMs) -> bool {
        matches!(self.tripped_until_ms, Some(until) if now_ms < until)
    }

    pub fn last_reason(&self) -> Option<TripReason> {
        self.last_reason
    }

    /// Human-readable veto message for `EngineError::GuardBlocked`.
    pub fn block_reason(&self) -> String {
        match self.last_reason {
            Some(reason) => reason.as_str().to_string(),
            None => "unknown".to_string(),
        }
    }
}
