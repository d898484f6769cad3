//! Engine loop: ticks, trading-window gating, broker-time ordering, event
//! dispatch, and funding application.
//!
//! Grounded in the teacher's `orchestrator` (owns book/portfolio/broker,
//! drives a simulated clock, dispatches to a strategy trait) and
//! `strategy::Strategy` (optional hooks via default trait methods).

use crate::book::BookManager;
use crate::broker::{BrokerConfig, SimulatedBroker};
use crate::clock::{EngineClock, EventTimeMs};
use crate::error::EngineError;
use crate::guard::{BookGuard, BookGuardConfig};
use crate::model::{Event, Liquidation, OpenInterest, Order, OrderId, Ticker};
use crate::portfolio::{FundingScope, Portfolio, PortfolioConfig};
use std::collections::HashMap;
use tracing::{error, info};

/// Whether reducing orders may still submit outside the trading window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingWindowMode {
    /// Entries are blocked outside the window; reducing orders may still
    /// pass if `allow_reducing_outside_trading_window` is set.
    EntryOnly,
    /// All submits are blocked outside the window.
    BlockAll,
}

impl Default for TradingWindowMode {
    fn default() -> Self {
        TradingWindowMode::EntryOnly
    }
}

/// Whether `broker.on_time` runs before or after applying each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTimeMode {
    BeforeEvent,
    AfterEvent,
}

impl Default for BrokerTimeMode {
    fn default() -> Self {
        BrokerTimeMode::AfterEvent
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval_ms: i64,
    pub trading_start_ms: Option<EventTimeMs>,
    pub trading_end_ms: Option<EventTimeMs>,
    pub trading_window_mode: TradingWindowMode,
    pub allow_reducing_outside_trading_window: bool,
    pub broker_time_mode: BrokerTimeMode,
    pub strict_event_time_monotonic: bool,
    pub book_guard: bool,
    pub book_guard_symbol: Option<String>,
    pub broker: BrokerConfig,
    pub book_guard_config: BookGuardConfig,
    pub portfolio: PortfolioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 0,
            trading_start_ms: None,
            trading_end_ms: None,
            trading_window_mode: TradingWindowMode::default(),
            allow_reducing_outside_trading_window: false,
            broker_time_mode: BrokerTimeMode::default(),
            strict_event_time_monotonic: false,
            book_guard: false,
            book_guard_symbol: None,
            broker: BrokerConfig::default(),
            book_guard_config: BookGuardConfig::default(),
            portfolio: PortfolioConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_tick_interval_ms(mut self, ms: i64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_trading_window(mut self, start_ms: EventTimeMs, end_ms: EventTimeMs) -> Self {
        self.trading_start_ms = Some(start_ms);
        self.trading_end_ms = Some(end_ms);
        self
    }

    pub fn with_strict_event_time_monotonic(mut self, strict: bool) -> Self {
        self.strict_event_time_monotonic = strict;
        self
    }

    pub fn with_book_guard(mut self, symbol: impl Into<String>) -> Self {
        self.book_guard = true;
        self.book_guard_symbol = Some(symbol.into());
        self
    }
}

/// Trading-window + guard proxy handed to the strategy via `EngineContext`.
/// Submits outside the configured window, or while the guard is tripped,
/// are turned into rejections rather than reaching `SimulatedBroker`
/// directly.
pub struct BrokerHandle<'a> {
    broker: &'a mut SimulatedBroker,
    books: &'a BookManager,
    guard: Option<&'a BookGuard>,
    guard_symbol: Option<&'a str>,
    now_ms: EventTimeMs,
    config: &'a EngineConfig,
}

impl<'a> BrokerHandle<'a> {
    pub fn submit(&mut self, order: Order) -> Result<(), EngineError> {
        if let (Some(guard), Some(guard_symbol)) = (self.guard, self.guard_symbol) {
            if order.symbol == guard_symbol && guard.is_tripped(self.now_ms) {
                return Err(EngineError::GuardBlocked(guard.block_reason()));
            }
        }

        let outside_window = match (self.config.trading_start_ms, self.config.trading_end_ms) {
            (Some(start), Some(end)) => self.now_ms < start || self.now_ms >= end,
            _ => false,
        };

        if outside_window {
            let allowed = self.config.trading_window_mode == TradingWindowMode::EntryOnly
                && order.reduce_only
                && self.config.allow_reducing_outside_trading_window;
            if !allowed {
                return Err(EngineError::InvalidOrder(
                    "submit outside trading window".into(),
                ));
            }
        }

        let book_ref = self.books.get(&order.symbol);
        self.broker.submit(order, book_ref, self.now_ms)
    }

    pub fn cancel(&mut self, order_id: OrderId) {
        self.broker.cancel(order_id, self.now_ms);
    }
}

/// Capability record passed by mutable reference to strategy callbacks.
/// Never stored as global state.
pub struct EngineContext<'a> {
    pub now_ms: EventTimeMs,
    pub books: &'a BookManager,
    pub broker: BrokerHandle<'a>,
    pub tickers: &'a HashMap<String, Ticker>,
    pub open_interest: &'a HashMap<String, OpenInterest>,
    pub liquidations: &'a HashMap<String, Liquidation>,
}

/// The strategy capability set. Both methods default to a no-op, so a
/// strategy may implement either, both, or neither beyond the trait bound
/// itself.
pub trait Strategy {
    fn on_event(&mut self, _event: &Event, _ctx: &mut EngineContext) {}
    fn on_tick(&mut self, _tick_ms: EventTimeMs, _ctx: &mut EngineContext) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EventCounts {
    pub depth: u64,
    pub trade: u64,
    pub mark: u64,
    pub ticker: u64,
    pub open_interest: u64,
    pub liquidation: u64,
}

pub struct EngineResult {
    pub books: BookManager,
    pub portfolio: Portfolio,
    pub broker: SimulatedBroker,
    pub event_counts: EventCounts,
}

pub struct Engine {
    config: EngineConfig,
    books: BookManager,
    portfolio: Portfolio,
    broker: SimulatedBroker,
    guards: HashMap<String, BookGuard>,
    tickers: HashMap<String, Ticker>,
    open_interest: HashMap<String, OpenInterest>,
    liquidations: HashMap<String, Liquidation>,
    last_funding_mark: HashMap<String, (f64, f64, EventTimeMs)>,
    event_counts: EventCounts,
    clock: EngineClock,
    last_emitted_ms: Option<EventTimeMs>,
    tick_anchor_ms: Option<EventTimeMs>,
    next_tick_ms: Option<EventTimeMs>,
    folded_fills: usize,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let broker = SimulatedBroker::new(config.broker);
        let portfolio = Portfolio::new(config.portfolio);
        let mut guards = HashMap::new();
        if config.book_guard {
            if let Some(symbol) = &config.book_guard_symbol {
                guards.insert(symbol.clone(), BookGuard::new(config.book_guard_config));
            }
        }
        Self {
            config,
            books: BookManager::new(),
            portfolio,
            broker,
            guards,
            tickers: HashMap::new(),
            open_interest: HashMap::new(),
            liquidations: HashMap::new(),
            last_funding_mark: HashMap::new(),
            event_counts: EventCounts::default(),
            clock: EngineClock::default(),
            last_emitted_ms: None,
            tick_anchor_ms: None,
            next_tick_ms: None,
            folded_fills: 0,
        }
    }

    /// Drive the full event stream to completion (or the first fatal
    /// error). `strategy` receives `on_event`/`on_tick` callbacks in the
    /// order prescribed by the per-event loop below.
    pub fn run(
        mut self,
        events: impl Iterator<Item = Event>,
        mut strategy: impl Strategy,
    ) -> Result<EngineResult, EngineError> {
        for event in events {
            self.step(&event, &mut strategy)?;
        }
        Ok(EngineResult {
            books: self.books,
            portfolio: self.portfolio,
            broker: self.broker,
            event_counts: self.event_counts,
        })
    }

    fn step(&mut self, event: &Event, strategy: &mut impl Strategy) -> Result<(), EngineError> {
        let event_ms = event.event_time_ms();

        // 1. Strict monotonic check.
        if self.config.strict_event_time_monotonic {
            if let Some(last) = self.last_emitted_ms {
                if event_ms < last {
                    error!(event_ms, last, "engine: out-of-order event, failing fast");
                    return Err(EngineError::OutOfOrderEvent {
                        expected_at_least_ms: last,
                        got_ms: event_ms,
                    });
                }
            }
        }

        // 2. Advance clock. Not `advance_to`: outside strict mode a
        // regression is tolerated here, not a programming error.
        self.clock.set_now_ms(event_ms);
        self.last_emitted_ms = Some(event_ms);

        // 3. Tick emission, anchored at the first observed event's timestamp.
        if self.config.tick_interval_ms > 0 {
            let anchor = *self.tick_anchor_ms.get_or_insert(event_ms);
            let next_tick = self.next_tick_ms.get_or_insert(anchor);
            while *next_tick <= self.clock.now_ms() {
                let tick_ms = *next_tick;
                *next_tick += self.config.tick_interval_ms;
                self.fire_tick(tick_ms, strategy);
            }
        }

        // 4. Broker time before event, if configured.
        if self.config.broker_time_mode == BrokerTimeMode::BeforeEvent {
            self.advance_broker_time();
        }

        // 5. Apply the event.
        self.apply_event(event);

        // 6. Broker time after event (default).
        if self.config.broker_time_mode == BrokerTimeMode::AfterEvent {
            self.advance_broker_time();
        }

        // 7. Dispatch to strategy.
        let mut ctx = self.make_context_at(self.clock.now_ms());
        strategy.on_event(event, &mut ctx);

        Ok(())
    }

    fn fire_tick(&mut self, tick_ms: EventTimeMs, strategy: &mut impl Strategy) {
        self.advance_broker_time_at(tick_ms);
        let mut ctx = self.make_context_at(tick_ms);
        strategy.on_tick(tick_ms, &mut ctx);
    }

    /// Activate/cancel across every symbol with pending broker activity, not
    /// just the symbol of the event that advanced the clock: orders may be
    /// resting on a symbol that isn't mentioned again for a while.
    fn advance_broker_time(&mut self) {
        self.advance_broker_time_at(self.clock.now_ms());
    }

    fn advance_broker_time_at(&mut self, now_ms: EventTimeMs) {
        let portfolio = &self.portfolio;
        let books = &mut self.books;
        self.broker
            .on_time(now_ms, books, |symbol| portfolio.position(symbol).net_qty);
    }

    fn apply_event(&mut self, event: &Event) {
        match event {
            Event::Depth(d) => {
                self.event_counts.depth += 1;
                let book = self.books.get_or_create(&d.symbol);
                let delta = book.apply_depth_update(
                    &d.bid_updates,
                    &d.ask_updates,
                    d.final_update_id,
                    d.prev_final_update_id,
                    d.event_time_ms,
                );
                self.broker.on_depth_update(&d.symbol, book);
                if let Some(guard) = self.guards.get_mut(&d.symbol) {
                    let book_ref = self.books.get(&d.symbol).expect("just updated");
                    guard.on_delta_applied(book_ref, &delta, d.event_time_ms);
                    if guard.is_tripped(d.event_time_ms) {
                        self.broker.on_guard_tripped(&d.symbol);
                    }
                    if guard.take_reset_request() {
                        info!(symbol = d.symbol.as_str(), "engine: rebuilding book after guard trip");
                        *self.books.get_mut(&d.symbol).expect("just updated") = crate::book::L2Book::new(&d.symbol);
                    }
                }
            }
            Event::Trade(t) => {
                self.event_counts.trade += 1;
                self.broker.on_trade(t, t.event_time_ms);
            }
            Event::Mark(m) => {
                self.event_counts.mark += 1;
                self.portfolio.mark(&m.symbol, m.mark_price);

                self.last_funding_mark.insert(
                    m.symbol.clone(),
                    (m.mark_price, m.funding_rate, m.next_funding_time_ms),
                );

                // `Portfolio::apply_funding` is itself idempotent per
                // `(symbol, boundary_ms)`, so no engine-side "have we seen
                // this boundary before" gate is needed here.
                if m.event_time_ms >= m.next_funding_time_ms {
                    match self.portfolio.funding_scope() {
                        FundingScope::ArrivedSymbolOnly => {
                            self.portfolio.apply_funding(
                                &m.symbol,
                                m.funding_rate,
                                m.mark_price,
                                m.next_funding_time_ms,
                            );
                        }
                        FundingScope::AllCrossedSymbols => {
                            let crossings: Vec<(String, f64, f64, EventTimeMs)> = self
                                .last_funding_mark
                                .iter()
                                .filter(|(_, (_, _, boundary))| m.event_time_ms >= *boundary)
                                .map(|(symbol, (mark, rate, boundary))| {
                                    (symbol.clone(), *mark, *rate, *boundary)
                                })
                                .collect();
                            for (symbol, mark, rate, boundary) in crossings {
                                self.portfolio.apply_funding(&symbol, rate, mark, boundary);
                            }
                        }
                    }
                }
            }
            Event::Ticker(t) => {
                self.event_counts.ticker += 1;
                self.tickers.insert(t.symbol.clone(), t.clone());
            }
            Event::OpenInterest(o) => {
                self.event_counts.open_interest += 1;
                self.open_interest.insert(o.symbol.clone(), o.clone());
            }
            Event::Liquidation(l) => {
                self.event_counts.liquidation += 1;
                self.liquidations.insert(l.symbol.clone(), l.clone());
            }
        }

        // Fold any fills produced by this event's broker activity into the
        // portfolio. Fills accumulate append-only on the broker, so drain
        // only the tail not yet folded.
        self.fold_new_fills();
    }

    fn fold_new_fills(&mut self) {
        let folded = self.folded_fill_count();
        for fill in &self.broker.fills[folded..] {
            self.portfolio.apply_fill(fill);
        }
        self.set_folded_fill_count(self.broker.fills.len());
    }

    fn folded_fill_count(&self) -> usize {
        self.folded_fills
    }

    fn set_folded_fill_count(&mut self, count: usize) {
        self.folded_fills = count;
    }

    fn make_context_at(&mut self, now_ms: EventTimeMs) -> EngineContext<'_> {
        let guard_symbol = self.config.book_guard_symbol.as_deref();
        let guard = guard_symbol.and_then(|s| self.guards.get(s));
        EngineContext {
            now_ms,
            books: &self.books,
            broker: BrokerHandle {
                broker: &mut self.broker,
                books: &self.books,
                guard,
                guard_symbol,
                now_ms,
                config: &self.config,
            },
            tickers: &self.tickers,
            open_interest: &self.open_interest,
            liquidations: &self.liquidations,
        }
    }
}
