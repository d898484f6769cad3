//! L2 order book.
//!
//! Per-symbol bid/ask price ladders updated by sparse deltas, plus the
//! derived queries a broker and strategy need: best bid/ask, mid, and
//! impact VWAP. Backed by `BTreeMap` for O(log n) insert/remove and O(1)
//! best-of access, the same shape as the teacher's `OrderedPrice`-wrapped
//! ladder.

use crate::clock::EventTimeMs;
use crate::model::{PriceQty, Side};
use std::collections::BTreeMap;

/// Price key that sorts bids descending (best = highest) and asks ascending
/// (best = lowest) via the `is_bid` flag baked into `Ord`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedPrice {
    price: f64,
    is_bid: bool,
}

impl Eq for OrderedPrice {}

impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.is_bid {
            other
                .price
                .partial_cmp(&self.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        } else {
            self.price
                .partial_cmp(&other.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

/// Result of applying a depth delta, used by the book guard to detect
/// sequence gaps and crossed books without re-walking the ladder.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaResult {
    pub levels_added: usize,
    pub levels_updated: usize,
    pub levels_removed: usize,
    pub sequence_mismatch: bool,
    pub crossed: bool,
}

/// Per-symbol L2 order book.
#[derive(Debug, Clone)]
pub struct L2Book {
    pub symbol: String,
    bids: BTreeMap<OrderedPrice, f64>,
    asks: BTreeMap<OrderedPrice, f64>,
    pub last_update_ms: EventTimeMs,
    pub last_final_update_id: Option<u64>,
}

impl L2Book {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_ms: 0,
            last_final_update_id: None,
        }
    }

    /// Apply a sparse depth delta. Order of application within the update is
    /// irrelevant to the resulting state: each `(price, qty)` either sets or
    /// removes its level independently.
    pub fn apply_depth_update(
        &mut self,
        bid_updates: &[PriceQty],
        ask_updates: &[PriceQty],
        final_update_id: u64,
        prev_final_update_id: Option<u64>,
        event_time_ms: EventTimeMs,
    ) -> DeltaResult {
        let mut result = DeltaResult::default();

        if let Some(prev) = prev_final_update_id {
            if let Some(last_seen) = self.last_final_update_id {
                if prev != last_seen {
                    result.sequence_mismatch = true;
                }
            }
        }

        Self::apply_side(&mut self.bids, bid_updates, true, &mut result);
        Self::apply_side(&mut self.asks, ask_updates, false, &mut result);

        self.last_update_ms = event_time_ms;
        self.last_final_update_id = Some(final_update_id);

        if let (Some(bb), Some(ba)) = (self.best_bid(), self.best_ask()) {
            result.crossed = bb >= ba;
        }

        result
    }

    fn apply_side(
        side_map: &mut BTreeMap<OrderedPrice, f64>,
        updates: &[PriceQty],
        is_bid: bool,
        result: &mut DeltaResult,
    ) {
        for update in updates {
            let key = OrderedPrice {
                price: update.price,
                is_bid,
            };
            if update.qty <= 0.0 {
                if side_map.remove(&key).is_some() {
                    result.levels_removed += 1;
                }
            } else if side_map.insert(key, update.qty).is_some() {
                result.levels_updated += 1;
            } else {
                result.levels_added += 1;
            }
        }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next().map(|k| k.price)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|k| k.price)
    }

    pub fn best_bid_qty(&self) -> Option<f64> {
        self.bids.iter().next().map(|(_, q)| *q)
    }

    pub fn best_ask_qty(&self) -> Option<f64> {
        self.asks.iter().next().map(|(_, q)| *q)
    }

    /// Visible quantity at a specific price on the given side, used by the
    /// broker's maker queue-ahead initialization.
    pub fn qty_at(&self, side: Side, price: f64) -> f64 {
        let map = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        map.get(&OrderedPrice {
            price,
            is_bid: matches!(side, Side::Buy),
        })
        .copied()
        .unwrap_or(0.0)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        match (self.spread(), self.mid()) {
            (Some(s), Some(m)) if m > 0.0 => Some(s / m * 10_000.0),
            _ => None,
        }
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b >= a,
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Walk the opposite side of a taker order (buy walks asks ascending,
    /// sell walks bids descending) mutating the ladder in place, consuming
    /// up to `quantity` of depth. Returns `(avg_price, filled_qty)`. This is
    /// self-impact: subsequent queries against this book see the depleted
    /// state.
    pub fn consume(&mut self, side: Side, quantity: f64) -> (f64, f64) {
        let map = match side {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        };

        let mut remaining = quantity;
        let mut notional = 0.0;
        let mut filled = 0.0;
        let mut drained = Vec::new();

        for (key, qty) in map.iter_mut() {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(*qty);
            notional += take * key.price;
            filled += take;
            remaining -= take;
            *qty -= take;
            if *qty <= 0.0 {
                drained.push(*key);
            }
        }
        for key in drained {
            map.remove(&key);
        }

        let avg_price = if filled > 0.0 { notional / filled } else { 0.0 };
        (avg_price, filled)
    }

    /// Non-mutating simulation of `consume`, used by FOK to decide whether
    /// the full quantity is achievable before touching the book.
    pub fn simulate_consume(&self, side: Side, quantity: f64) -> (f64, f64) {
        let map = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };

        let mut remaining = quantity;
        let mut notional = 0.0;
        let mut filled = 0.0;

        for (key, qty) in map.iter() {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(*qty);
            notional += take * key.price;
            filled += take;
            remaining -= take;
        }

        let avg_price = if filled > 0.0 { notional / filled } else { 0.0 };
        (avg_price, filled)
    }

    /// Volume-weighted average price required to execute `target_notional`
    /// against the opposite side. Buy walks asks ascending; sell walks bids
    /// descending. `max_levels` caps how many price levels are inspected; if
    /// that cap yields insufficient depth, the full book is retried before
    /// the result is declared undefined. `eps_notional` absorbs
    /// floating-point residue at the `target_notional` boundary.
    pub fn impact_vwap(
        &self,
        side: Side,
        target_notional: f64,
        max_levels: Option<usize>,
        eps_notional: f64,
    ) -> Option<(f64, f64)> {
        if let Some(levels) = max_levels {
            if let Some(result) = self.walk_vwap(side, target_notional, Some(levels), eps_notional)
            {
                return Some(result);
            }
            // Capped walk fell short: retry with the full book before
            // declaring undefined.
            return self.walk_vwap(side, target_notional, None, eps_notional);
        }
        self.walk_vwap(side, target_notional, None, eps_notional)
    }

    fn walk_vwap(
        &self,
        side: Side,
        target_notional: f64,
        max_levels: Option<usize>,
        eps_notional: f64,
    ) -> Option<(f64, f64)> {
        let map = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };

        let mut notional = 0.0;
        let mut qty = 0.0;
        let mut levels_seen = 0usize;

        for (key, level_qty) in map.iter() {
            if let Some(cap) = max_levels {
                if levels_seen >= cap {
                    break;
                }
            }
            notional += key.price * level_qty;
            qty += level_qty;
            levels_seen += 1;
            if notional + eps_notional >= target_notional {
                let vwap = notional / qty;
                return Some((vwap, notional));
            }
        }

        if qty > 0.0 && notional + eps_notional >= target_notional {
            Some((notional / qty, notional))
        } else {
            None
        }
    }
}

/// Per-symbol book collection. Books are created lazily on first
/// observation of their symbol and live for the engine run.
#[derive(Debug, Default)]
pub struct BookManager {
    books: std::collections::HashMap<String, L2Book>,
}

impl BookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, symbol: &str) -> &mut L2Book {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| L2Book::new(symbol))
    }

    pub fn get(&self, symbol: &str) -> Option<&L2Book> {
        self.books.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut L2Book> {
        self.books.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.books.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &L2Book)> {
        self.books.iter()
    }
}
