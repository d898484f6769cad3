//! Event, order, fill, and position data model.
//!
//! All timestamps are 64-bit integers; prices and quantities are
//! double-precision floats; fees and PnL are denominated in a single quote
//! currency ("USDT"). This module has no dependency on any other engine
//! module.

use crate::clock::{EventTimeMs, ReceivedTimeNs};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell. Multiplying a signed position delta by this
    /// sign turns an (side, quantity) pair into a signed quantity delta.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Order type for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good til cancelled.
    Gtc,
    /// Immediate or cancel: fill what you can, cancel the residue.
    Ioc,
    /// Fill or kill: must fill entirely or reject with no book mutation.
    Fok,
}

/// Whether a fill added or removed liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Maker,
    Taker,
}

/// A single `(price, quantity)` update within a depth delta. A quantity of
/// zero removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQty {
    pub price: f64,
    pub qty: f64,
}

impl PriceQty {
    #[inline]
    pub fn new(price: f64, qty: f64) -> Self {
        Self { price, qty }
    }
}

/// A sparse L2 depth delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub transaction_time_ms: Option<EventTimeMs>,
    pub symbol: String,
    pub first_update_id: Option<u64>,
    pub final_update_id: u64,
    pub prev_final_update_id: Option<u64>,
    pub bid_updates: Vec<PriceQty>,
    pub ask_updates: Vec<PriceQty>,
}

/// A public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    /// `true` means the aggressor was a seller (a downtick).
    pub is_buyer_maker: bool,
}

/// A mark-price / funding snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub symbol: String,
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: f64,
    pub next_funding_time_ms: EventTimeMs,
}

/// 24h ticker snapshot. Latched in context; no other engine side effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickerValues {
    pub last_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub symbol: String,
    pub values: TickerValues,
}

/// Open interest snapshot. Latched in context; no other engine side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub symbol: String,
    pub open_interest: f64,
}

/// Liquidation print. Latched in context; no other engine side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub event_time_ms: EventTimeMs,
    pub received_time_ns: Option<ReceivedTimeNs>,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
}

/// The canonical tagged event variant the core dispatches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Depth(DepthUpdate),
    Trade(Trade),
    Mark(MarkPrice),
    Ticker(Ticker),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
}

impl Event {
    #[inline]
    pub fn event_time_ms(&self) -> EventTimeMs {
        match self {
            Event::Depth(e) => e.event_time_ms,
            Event::Trade(e) => e.event_time_ms,
            Event::Mark(e) => e.event_time_ms,
            Event::Ticker(e) => e.event_time_ms,
            Event::OpenInterest(e) => e.event_time_ms,
            Event::Liquidation(e) => e.event_time_ms,
        }
    }

    #[inline]
    pub fn received_time_ns(&self) -> Option<ReceivedTimeNs> {
        match self {
            Event::Depth(e) => e.received_time_ns,
            Event::Trade(e) => e.received_time_ns,
            Event::Mark(e) => e.received_time_ns,
            Event::Ticker(e) => e.received_time_ns,
            Event::OpenInterest(e) => e.received_time_ns,
            Event::Liquidation(e) => e.received_time_ns,
        }
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        match self {
            Event::Depth(e) => &e.symbol,
            Event::Trade(e) => &e.symbol,
            Event::Mark(e) => &e.symbol,
            Event::Ticker(e) => &e.symbol,
            Event::OpenInterest(e) => &e.symbol,
            Event::Liquidation(e) => &e.symbol,
        }
    }

    /// Type priority for the §4.1 tie-break: Depth < Trade < Mark < Ticker <
    /// OpenInterest < Liquidation.
    #[inline]
    fn type_priority(&self) -> u8 {
        match self {
            Event::Depth(_) => 0,
            Event::Trade(_) => 1,
            Event::Mark(_) => 2,
            Event::Ticker(_) => 3,
            Event::OpenInterest(_) => 4,
            Event::Liquidation(_) => 5,
        }
    }

    /// Type-specific identifier ascending: `final_update_id` for depth,
    /// `trade_id` for trades, 0 (no further tie-break needed) otherwise.
    #[inline]
    fn type_id(&self) -> u64 {
        match self {
            Event::Depth(e) => e.final_update_id,
            Event::Trade(e) => e.trade_id,
            _ => 0,
        }
    }
}

/// A merge-ready tie-break key for an `Event` arriving from a given input
/// stream index. See `crate::merge` for how this is used by the k-way
/// merge's priority structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TieBreakKey {
    pub event_time_ms: EventTimeMs,
    /// Missing `received_time_ns` sorts last, so `None` is mapped to
    /// `i64::MAX` here rather than compared as `Option`.
    received_sort: i64,
    type_priority: u8,
    type_id: u64,
    pub source_index: usize,
}

impl TieBreakKey {
    pub fn for_event(event: &Event, source_index: usize) -> Self {
        Self {
            event_time_ms: event.event_time_ms(),
            received_sort: event.received_time_ns().unwrap_or(i64::MAX),
            type_priority: event.type_priority(),
            type_id: event.type_id(),
            source_index,
        }
    }
}

impl PartialOrd for TieBreakKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TieBreakKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.event_time_ms
            .cmp(&other.event_time_ms)
            .then_with(|| self.received_sort.cmp(&other.received_sort))
            .then_with(|| self.type_priority.cmp(&other.type_priority))
            .then_with(|| self.type_id.cmp(&other.type_id))
            .then_with(|| self.source_index.cmp(&other.source_index))
    }
}

/// Caller-supplied order identifier, unique across the broker's lifetime.
pub type OrderId = u64;

/// An order submitted by the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub limit_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl Order {
    pub fn market(id: OrderId, symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn limit(
        id: OrderId,
        symbol: impl Into<String>,
        side: Side,
        quantity: f64,
        limit_price: f64,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(limit_price),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }

    pub fn time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }
}

/// A single fill. The fill list is append-only for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub liquidity: Liquidity,
    pub event_time_ms: EventTimeMs,
}

/// Per-symbol position state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Signed: positive long, negative short.
    pub net_qty: f64,
    pub avg_entry_price: f64,
    pub last_mark_price: Option<f64>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_qty.abs() < 1e-12
    }
}
