//! Simulated broker.
//!
//! Owns pending submits, active resting (maker) orders, pending cancels, and
//! the append-only fill list. Taker fills consume the live `L2Book` in
//! place (self-impact); maker fills are driven by the trade tape through a
//! queue-ahead estimate, grounded in the teacher's `queue_model`. Latency is
//! modeled as a fixed schedule offset from submit/cancel time, not a
//! distribution.

use crate::book::{BookManager, L2Book};
use crate::clock::EventTimeMs;
use crate::error::EngineError;
use crate::model::{Fill, Liquidity, Order, OrderId, OrderType, Side, TimeInForce, Trade};
use tracing::{debug, warn};

/// How a `post_only` order reacts when activation would make it marketable
/// (i.e. it would cross the book). Open Question (c) in the source spec;
/// resolved here as an explicit config switch rather than a silent pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOnlyPolicy {
    /// Reject the order outright (the documented base case).
    Reject,
    /// Reprice to the best non-marketable price on the correct side and
    /// rest it there instead.
    Reprice,
}

impl Default for PostOnlyPolicy {
    fn default() -> Self {
        PostOnlyPolicy::Reject
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub submit_latency_ms: i64,
    pub cancel_latency_ms: i64,
    pub taker_fee_frac: f64,
    pub maker_fee_frac: f64,
    pub maker_queue_ahead_factor: f64,
    pub maker_queue_ahead_extra_qty: f64,
    pub maker_trade_participation: f64,
    pub post_only_marketable_policy: PostOnlyPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            submit_latency_ms: 0,
            cancel_latency_ms: 0,
            taker_fee_frac: 0.0004,
            maker_fee_frac: 0.0002,
            maker_queue_ahead_factor: 1.0,
            maker_queue_ahead_extra_qty: 0.0,
            maker_trade_participation: 1.0,
            post_only_marketable_policy: PostOnlyPolicy::Reject,
        }
    }
}

/// An order whose submit latency has not yet elapsed.
#[derive(Debug, Clone)]
struct PendingSubmit {
    order: Order,
    activate_at_ms: EventTimeMs,
    seq: u64,
}

/// An order scheduled to be cancelled once its latency elapses.
#[derive(Debug, Clone, Copy)]
struct PendingCancel {
    order_id: OrderId,
    cancel_at_ms: EventTimeMs,
    seq: u64,
}

/// A resting limit order tracked by the maker queue model.
#[derive(Debug, Clone)]
pub struct ActiveMaker {
    pub order: Order,
    pub remaining_qty: f64,
    queue_ahead_qty: f64,
    /// Set after the first post-activation depth observation; the
    /// queue-ahead estimate is never refreshed again afterward.
    refreshed: bool,
}

/// A rejection surfaced back to the submitting call site. Not a hard error:
/// the engine keeps running.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReject {
    pub order_id: OrderId,
    pub reason: EngineError,
}

#[derive(Debug, Default)]
pub struct SimulatedBroker {
    config: BrokerConfig,
    pending_submits: Vec<PendingSubmit>,
    pending_cancels: Vec<PendingCancel>,
    active_makers: Vec<ActiveMaker>,
    pub fills: Vec<Fill>,
    pub rejects: Vec<OrderReject>,
    next_seq: u64,
}

impl SimulatedBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    fn validate(order: &Order) -> Result<(), EngineError> {
        if order.quantity <= 0.0 {
            return Err(EngineError::InvalidOrder(
                "quantity must be positive".into(),
            ));
        }
        if order.order_type == OrderType::Market && order.post_only {
            return Err(EngineError::InvalidOrder(
                "market order cannot be post_only".into(),
            ));
        }
        if order.order_type == OrderType::Limit && order.limit_price.is_none() {
            return Err(EngineError::InvalidOrder(
                "limit order missing limit_price".into(),
            ));
        }
        Ok(())
    }

    /// Whether filling `order` in its stated direction would grow the
    /// absolute size of a position currently at `position_qty` — a flat
    /// position is grown by any fill, a position is grown further by a fill
    /// on the same side, and shrunk (or flipped) by a fill on the opposite
    /// side.
    fn increases_absolute_position(order: &Order, position_qty: f64) -> bool {
        if position_qty == 0.0 {
            return true;
        }
        order.side.sign().signum() == position_qty.signum()
    }

    /// Schedule `order` for activation at `now_ms + submit_latency_ms`.
    /// Validation failures are returned immediately and never scheduled.
    pub fn submit(
        &mut self,
        order: Order,
        book: Option<&L2Book>,
        now_ms: EventTimeMs,
    ) -> Result<(), EngineError> {
        Self::validate(&order)?;
        if book.is_none() {
            return Err(EngineError::UnknownSymbol(order.symbol));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_submits.push(PendingSubmit {
            order,
            activate_at_ms: now_ms + self.config.submit_latency_ms,
            seq,
        });
        Ok(())
    }

    /// Schedule a cancel at `now_ms + cancel_latency_ms`. Idempotent:
    /// cancelling an id that doesn't (or no longer) exists is a no-op
    /// success.
    pub fn cancel(&mut self, order_id: OrderId, now_ms: EventTimeMs) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_cancels.push(PendingCancel {
            order_id,
            cancel_at_ms: now_ms + self.config.cancel_latency_ms,
            seq,
        });
    }

    pub fn active_makers(&self) -> &[ActiveMaker] {
        &self.active_makers
    }

    /// Invalidate all pending (not yet activated) submits for `symbol`,
    /// called by the engine when its book guard trips. Active makers are
    /// left resting.
    pub fn invalidate_pending_for_symbol(&mut self, symbol: &str) {
        self.pending_submits.retain(|p| p.order.symbol != symbol);
    }

    /// Activate due submits and process due cancels, in scheduled-time
    /// order (ties broken by insertion order). Spans every symbol with
    /// pending activity, not just the symbol of the event that advanced the
    /// clock: `books` is the full per-symbol collection, and
    /// `position_qty_fn` looks up a symbol's current signed net position for
    /// `reduce_only` enforcement at activation.
    pub fn on_time(
        &mut self,
        now_ms: EventTimeMs,
        books: &mut BookManager,
        position_qty_fn: impl Fn(&str) -> f64,
    ) {
        self.pending_cancels
            .sort_by_key(|c| (c.cancel_at_ms, c.seq));
        let mut remaining_cancels = Vec::new();
        for cancel in std::mem::take(&mut self.pending_cancels) {
            if cancel.cancel_at_ms <= now_ms {
                self.active_makers.retain(|m| m.order.id != cancel.order_id);
                self.pending_submits.retain(|p| p.order.id != cancel.order_id);
            } else {
                remaining_cancels.push(cancel);
            }
        }
        self.pending_cancels = remaining_cancels;

        self.pending_submits
            .sort_by_key(|p| (p.activate_at_ms, p.seq));
        let due: Vec<PendingSubmit> = {
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for pending in std::mem::take(&mut self.pending_submits) {
                if pending.activate_at_ms <= now_ms {
                    due.push(pending);
                } else {
                    remaining.push(pending);
                }
            }
            self.pending_submits = remaining;
            due
        };

        for pending in due {
            let position_qty = position_qty_fn(&pending.order.symbol);
            let book = books.get_or_create(&pending.order.symbol);
            self.activate(pending.order, book, now_ms, position_qty);
        }
    }

    fn activate(&mut self, order: Order, book: &mut L2Book, now_ms: EventTimeMs, position_qty: f64) {
        if order.reduce_only && Self::increases_absolute_position(&order, position_qty) {
            self.rejects.push(OrderReject {
                order_id: order.id,
                reason: EngineError::InvalidOrder(
                    "reduce_only order would increase absolute position".into(),
                ),
            });
            return;
        }

        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        let is_marketable = match order.order_type {
            OrderType::Market => true,
            OrderType::Limit => {
                let limit_price = order.limit_price.expect("validated at submit");
                match order.side {
                    Side::Buy => best_ask.map(|ask| limit_price >= ask).unwrap_or(false),
                    Side::Sell => best_bid.map(|bid| limit_price <= bid).unwrap_or(false),
                }
            }
        };

        if is_marketable && order.post_only {
            match self.config.post_only_marketable_policy {
                PostOnlyPolicy::Reject => {
                    self.rejects.push(OrderReject {
                        order_id: order.id,
                        reason: EngineError::InvalidOrder(
                            "post_only order would be marketable".into(),
                        ),
                    });
                    return;
                }
                PostOnlyPolicy::Reprice => {
                    let repriced = self.reprice_to_non_marketable(&order, best_bid, best_ask);
                    self.rest_maker(repriced, book, now_ms);
                    return;
                }
            }
        }

        if is_marketable {
            self.fill_taker(order, book, now_ms);
        } else {
            self.rest_maker(order, book, now_ms);
        }
    }

    fn reprice_to_non_marketable(
        &self,
        order: &Order,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
    ) -> Order {
        let mut repriced = order.clone();
        let tick = 0.01;
        repriced.limit_price = match order.side {
            Side::Buy => best_ask.map(|ask| ask - tick),
            Side::Sell => best_bid.map(|bid| bid + tick),
        };
        repriced
    }

    fn fill_taker(&mut self, order: Order, book: &mut L2Book, now_ms: EventTimeMs) {
        if order.time_in_force == TimeInForce::Fok {
            let (_, filled) = book.simulate_consume(order.side, order.quantity);
            if filled + 1e-9 < order.quantity {
                self.rejects.push(OrderReject {
                    order_id: order.id,
                    reason: EngineError::InsufficientLiquidity,
                });
                return;
            }
        }

        let (avg_price, filled_qty) = book.consume(order.side, order.quantity);
        if filled_qty <= 0.0 {
            self.rejects.push(OrderReject {
                order_id: order.id,
                reason: EngineError::InsufficientLiquidity,
            });
            return;
        }

        let notional = avg_price * filled_qty;
        let fee = notional.abs() * self.config.taker_fee_frac;
        debug!(
            order_id = order.id,
            filled_qty, avg_price, fee, "broker: taker fill"
        );
        self.fills.push(Fill {
            order_id: order.id,
            symbol: order.symbol,
            side: order.side,
            price: avg_price,
            quantity: filled_qty,
            fee,
            liquidity: Liquidity::Taker,
            event_time_ms: now_ms,
        });
        // residual (IOC/Market): silently cancelled, no further action.
    }

    fn rest_maker(&mut self, order: Order, book: &L2Book, _now_ms: EventTimeMs) {
        if order.time_in_force == TimeInForce::Fok {
            // A non-marketable FOK limit can never fill; reject immediately.
            self.rejects.push(OrderReject {
                order_id: order.id,
                reason: EngineError::InsufficientLiquidity,
            });
            return;
        }
        if order.time_in_force == TimeInForce::Ioc {
            // A non-marketable IOC limit is the 100%-residual case of "IOC
            // partial fills are not errors": it simply produces zero fills
            // and vanishes, same as a taker IOC's uncrossed residue.
            return;
        }
        let limit_price = order.limit_price.expect("validated at submit");
        let visible_qty = book.qty_at(order.side, limit_price);
        let queue_ahead_qty =
            self.config.maker_queue_ahead_factor * visible_qty + self.config.maker_queue_ahead_extra_qty;

        self.active_makers.push(ActiveMaker {
            remaining_qty: order.quantity,
            order,
            queue_ahead_qty,
            refreshed: false,
        });
    }

    /// Refresh queue-ahead estimates for the first post-activation depth
    /// observation only, per the conservative refresh-once rule.
    pub fn on_depth_update(&mut self, symbol: &str, book: &L2Book) {
        for maker in self.active_makers.iter_mut() {
            if maker.order.symbol != symbol || maker.refreshed {
                continue;
            }
            let limit_price = maker.order.limit_price.expect("maker orders are limits");
            let visible_qty = book.qty_at(maker.order.side, limit_price);
            maker.queue_ahead_qty = self.config.maker_queue_ahead_factor * visible_qty
                + self.config.maker_queue_ahead_extra_qty;
            maker.refreshed = true;
        }
    }

    /// Drive maker fills off a trade print. A buy limit ages on downticks
    /// at or through its price; a sell limit ages on upticks at or through
    /// its price.
    pub fn on_trade(&mut self, trade: &Trade, now_ms: EventTimeMs) {
        let participation = self.config.maker_trade_participation * trade.quantity;
        let mut filled_indices = Vec::new();

        for (idx, maker) in self.active_makers.iter_mut().enumerate() {
            if maker.order.symbol != trade.symbol {
                continue;
            }
            let limit_price = match maker.order.limit_price {
                Some(p) => p,
                None => continue,
            };
            let ages = match maker.order.side {
                Side::Buy => trade.price <= limit_price,
                Side::Sell => trade.price >= limit_price,
            };
            if !ages {
                continue;
            }

            let mut consume = participation;
            if maker.queue_ahead_qty > 0.0 {
                let take = consume.min(maker.queue_ahead_qty);
                maker.queue_ahead_qty -= take;
                consume -= take;
            }
            if consume <= 0.0 {
                continue;
            }

            let fill_qty = consume.min(maker.remaining_qty);
            if fill_qty <= 0.0 {
                continue;
            }
            maker.remaining_qty -= fill_qty;

            let notional = limit_price * fill_qty;
            let fee = notional.abs() * self.config.maker_fee_frac;
            self.fills.push(Fill {
                order_id: maker.order.id,
                symbol: maker.order.symbol.clone(),
                side: maker.order.side,
                price: limit_price,
                quantity: fill_qty,
                fee,
                liquidity: Liquidity::Maker,
                event_time_ms: now_ms,
            });

            if maker.remaining_qty <= 1e-12 {
                filled_indices.push(idx);
            }
        }

        for idx in filled_indices.into_iter().rev() {
            self.active_makers.remove(idx);
        }
    }

    /// The engine calls this when a book guard trips, to drop pending
    /// submits for the affected symbol. Active makers are left resting
    /// unless the caller separately cancels them.
    pub fn on_guard_tripped(&mut self, symbol: &str) {
        warn!(symbol, "broker: guard tripped, invalidating pending submits");
        self.invalidate_pending_for_symbol(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceQty;

    fn books_with_asks(levels: &[(f64, f64)]) -> BookManager {
        let mut books = BookManager::new();
        let asks: Vec<PriceQty> = levels.iter().map(|(p, q)| PriceQty::new(*p, *q)).collect();
        books.get_or_create("X").apply_depth_update(&[], &asks, 1, None, 0);
        books
    }

    fn no_position(_symbol: &str) -> f64 {
        0.0
    }

    #[test]
    fn market_taker_self_impact_scenario() {
        let mut books = books_with_asks(&[(101.0, 1.0), (102.0, 5.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig {
            submit_latency_ms: 0,
            taker_fee_frac: 0.0004,
            ..Default::default()
        });
        let order = Order::market(1, "X", Side::Buy, 3.0);
        broker.submit(order, books.get("X"), 2000).unwrap();
        broker.on_time(2000, &mut books, no_position);

        assert_eq!(broker.fills.len(), 1);
        let fill = &broker.fills[0];
        let expected_avg = (101.0 * 1.0 + 102.0 * 2.0) / 3.0;
        assert!((fill.price - expected_avg).abs() < 1e-6);
        assert_eq!(fill.quantity, 3.0);
        assert!((fill.fee - 3.0 * expected_avg * 0.0004).abs() < 1e-6);
        let book = books.get("X").unwrap();
        assert_eq!(book.best_ask(), Some(102.0));
        assert_eq!(book.best_ask_qty(), Some(3.0));
    }

    #[test]
    fn fok_rejects_without_mutating_book_when_insufficient() {
        let mut books = books_with_asks(&[(101.0, 1.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let order = Order::market(1, "X", Side::Buy, 5.0).time_in_force(TimeInForce::Fok);
        broker.submit(order, books.get("X"), 0).unwrap();
        broker.on_time(0, &mut books, no_position);

        assert!(broker.fills.is_empty());
        assert_eq!(broker.rejects.len(), 1);
        assert_eq!(broker.rejects[0].reason, EngineError::InsufficientLiquidity);
        assert_eq!(books.get("X").unwrap().best_ask_qty(), Some(1.0));
    }

    #[test]
    fn maker_queue_fill_scenario() {
        let mut books = BookManager::new();
        books
            .get_or_create("X")
            .apply_depth_update(&[PriceQty::new(100.0, 2.0)], &[], 1, None, 0);
        let mut broker = SimulatedBroker::new(BrokerConfig {
            maker_queue_ahead_factor: 1.0,
            maker_trade_participation: 1.0,
            maker_fee_frac: 0.0,
            ..Default::default()
        });
        // Force queue_ahead to 2 directly via a resting order at a level with qty=2.
        let order = Order::limit(1, "X", Side::Buy, 1.0, 100.0);
        broker.submit(order, books.get("X"), 0).unwrap();
        broker.on_time(0, &mut books, no_position);
        assert_eq!(broker.active_makers().len(), 1);
        assert_eq!(broker.active_makers()[0].queue_ahead_qty, 2.0);

        let trade_a = Trade {
            event_time_ms: 10,
            received_time_ns: None,
            symbol: "X".into(),
            trade_id: 1,
            price: 100.0,
            quantity: 1.5,
            is_buyer_maker: false,
        };
        broker.on_trade(&trade_a, 10);
        assert!(broker.fills.is_empty());
        assert_eq!(broker.active_makers()[0].queue_ahead_qty, 0.5);

        let trade_b = Trade {
            event_time_ms: 20,
            received_time_ns: None,
            symbol: "X".into(),
            trade_id: 2,
            price: 100.0,
            quantity: 1.5,
            is_buyer_maker: false,
        };
        broker.on_trade(&trade_b, 20);
        assert_eq!(broker.fills.len(), 1);
        assert_eq!(broker.fills[0].price, 100.0);
        assert_eq!(broker.fills[0].quantity, 1.0);
        assert!(broker.active_makers().is_empty());
    }

    #[test]
    fn non_marketable_ioc_limit_vanishes_without_a_reject() {
        let mut books = books_with_asks(&[(101.0, 1.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        // Buy limit at 99 against an ask of 101: not marketable.
        let order = Order::limit(1, "X", Side::Buy, 1.0, 99.0).time_in_force(TimeInForce::Ioc);
        broker.submit(order, books.get("X"), 0).unwrap();
        broker.on_time(0, &mut books, no_position);

        assert!(broker.fills.is_empty());
        assert!(broker.rejects.is_empty());
        assert!(broker.active_makers().is_empty());
    }

    #[test]
    fn non_marketable_fok_limit_is_rejected() {
        let mut books = books_with_asks(&[(101.0, 1.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let order = Order::limit(1, "X", Side::Buy, 1.0, 99.0).time_in_force(TimeInForce::Fok);
        broker.submit(order, books.get("X"), 0).unwrap();
        broker.on_time(0, &mut books, no_position);

        assert!(broker.fills.is_empty());
        assert_eq!(broker.rejects.len(), 1);
        assert_eq!(broker.rejects[0].reason, EngineError::InsufficientLiquidity);
        assert!(broker.active_makers().is_empty());
    }

    #[test]
    fn post_only_marketable_rejects_by_default() {
        let mut books = books_with_asks(&[(101.0, 1.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let order = Order::limit(1, "X", Side::Buy, 1.0, 101.0).post_only();
        broker.submit(order, books.get("X"), 0).unwrap();
        broker.on_time(0, &mut books, no_position);
        assert!(broker.fills.is_empty());
        assert_eq!(broker.rejects.len(), 1);
    }

    #[test]
    fn cancel_is_idempotent_for_unknown_id() {
        let mut books = BookManager::new();
        books.get_or_create("X");
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        broker.cancel(999, 0);
        broker.on_time(0, &mut books, no_position);
        // No panic, no fills, no rejects: idempotent no-op.
        assert!(broker.fills.is_empty());
        assert!(broker.rejects.is_empty());
    }

    #[test]
    fn reduce_only_rejected_when_it_would_increase_position() {
        let mut books = books_with_asks(&[(101.0, 5.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let order = Order::market(1, "X", Side::Buy, 1.0).reduce_only();
        broker.submit(order, books.get("X"), 0).unwrap();
        // Flat position: any fill would increase absolute size, so a
        // reduce_only buy is rejected at activation.
        broker.on_time(0, &mut books, |_| 0.0);
        assert!(broker.fills.is_empty());
        assert_eq!(broker.rejects.len(), 1);
    }

    #[test]
    fn reduce_only_allowed_when_it_shrinks_position() {
        let mut books = books_with_asks(&[(101.0, 5.0)]);
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let order = Order::market(1, "X", Side::Buy, 1.0).reduce_only();
        broker.submit(order, books.get("X"), 0).unwrap();
        // Short position of -2: a buy reduces absolute size, so it fills.
        broker.on_time(0, &mut books, |_| -2.0);
        assert_eq!(broker.fills.len(), 1);
        assert!(broker.rejects.is_empty());
    }

    #[test]
    fn invalid_order_rejected_before_scheduling() {
        let book = L2Book::new("X");
        let mut broker = SimulatedBroker::new(BrokerConfig::default());
        let bad = Order::market(1, "X", Side::Buy, -1.0);
        let result = broker.submit(bad, Some(&book), 0);
        assert!(matches!(result, Err(EngineError::InvalidOrder(_))));
    }
}
