//! End-to-end scenarios driving `Engine` through the merged stream, a real
//! `Strategy` implementation, and the simulated broker together. Each
//! scenario below corresponds to a documented replay behavior: pure depth
//! replay, taker self-impact, maker queue fill, funding settlement,
//! strict-monotonic fail-fast, and book-guard cooldown.

use backtest_engine::{
    BookGuardConfig, DepthUpdate, Engine, EngineConfig, EngineContext, EngineError, Event,
    FundingScope, MarkPrice, Order, PortfolioConfig, PriceQty, Side, Strategy, Trade,
};

/// Routes `tracing` output (guard trips, fatal errors) through the test
/// harness's captured writer instead of stdout, the same `EnvFilter` +
/// `fmt` layering the teacher's binaries wire up at startup. Safe to call
/// from multiple tests: a second `try_init` is a no-op.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn depth(t: i64, id: u64, symbol: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> Event {
    Event::Depth(DepthUpdate {
        event_time_ms: t,
        received_time_ns: Some(t * 1_000_000),
        transaction_time_ms: None,
        symbol: symbol.into(),
        first_update_id: Some(id),
        final_update_id: id,
        prev_final_update_id: id.checked_sub(1),
        bid_updates: bids.iter().map(|(p, q)| PriceQty::new(*p, *q)).collect(),
        ask_updates: asks.iter().map(|(p, q)| PriceQty::new(*p, *q)).collect(),
    })
}

fn trade(t: i64, id: u64, symbol: &str, price: f64, quantity: f64, is_buyer_maker: bool) -> Event {
    Event::Trade(Trade {
        event_time_ms: t,
        received_time_ns: Some(t * 1_000_000),
        symbol: symbol.into(),
        trade_id: id,
        price,
        quantity,
        is_buyer_maker,
    })
}

/// A no-op strategy, used by scenarios that only need the engine's
/// bookkeeping (fills/portfolio), not any order submission of their own.
struct PassiveObserver {
    events_seen: usize,
    ticks_seen: usize,
}

impl PassiveObserver {
    fn new() -> Self {
        Self {
            events_seen: 0,
            ticks_seen: 0,
        }
    }
}

impl Strategy for PassiveObserver {
    fn on_event(&mut self, _event: &Event, _ctx: &mut EngineContext) {
        self.events_seen += 1;
    }
    fn on_tick(&mut self, _tick_ms: i64, _ctx: &mut EngineContext) {
        self.ticks_seen += 1;
    }
}

/// Submits a single order the first time it sees a book for its target
/// symbol, then goes quiet. Models a strategy that reacts once to arrival.
struct FireOnceTaker {
    symbol: String,
    side: Side,
    quantity: f64,
    fired: bool,
}

impl Strategy for FireOnceTaker {
    fn on_event(&mut self, event: &Event, ctx: &mut EngineContext) {
        if self.fired || event.symbol() != self.symbol {
            return;
        }
        if let Event::Depth(_) = event {
            let order = Order::market(1, self.symbol.clone(), self.side, self.quantity);
            let _ = ctx.broker.submit(order);
            self.fired = true;
        }
    }
}

/// Submits a resting limit order on the first depth update, then never
/// submits again; fills are driven entirely by the trade tape.
struct FireOnceMaker {
    symbol: String,
    side: Side,
    quantity: f64,
    limit_price: f64,
    fired: bool,
}

impl Strategy for FireOnceMaker {
    fn on_event(&mut self, event: &Event, ctx: &mut EngineContext) {
        if self.fired || event.symbol() != self.symbol {
            return;
        }
        if let Event::Depth(_) = event {
            let order = Order::limit(1, self.symbol.clone(), self.side, self.quantity, self.limit_price);
            let _ = ctx.broker.submit(order);
            self.fired = true;
        }
    }
}

#[test]
fn pure_depth_replay_updates_book_without_trading() {
    let events = vec![
        depth(0, 1, "BTCUSDT", &[(100.0, 1.0)], &[(101.0, 1.0)]),
        depth(10, 2, "BTCUSDT", &[(100.0, 2.0)], &[(101.0, 1.5)]),
        depth(20, 3, "BTCUSDT", &[(99.5, 1.0)], &[(101.5, 2.0)]),
    ];

    let engine = Engine::new(EngineConfig::default());
    let result = engine.run(events.into_iter(), PassiveObserver::new()).unwrap();

    assert_eq!(result.event_counts.depth, 3);
    let book = result.books.get("BTCUSDT").unwrap();
    assert_eq!(book.best_bid(), Some(99.5));
    assert_eq!(book.best_ask(), Some(101.5));
    assert!(result.portfolio.position("BTCUSDT").is_flat());
}

#[test]
fn market_taker_walks_the_book_and_pays_a_fee() {
    // Three ask levels; a 3-unit market buy should walk across the first two.
    // A trailing depth tick gives the broker a chance to activate the
    // submit (activation trails submission by one event's worth of
    // broker-time advancement).
    let events = vec![
        depth(
            0,
            1,
            "BTCUSDT",
            &[(100.0, 5.0)],
            &[(101.0, 1.0), (102.0, 5.0), (103.0, 5.0)],
        ),
        depth(
            10,
            2,
            "BTCUSDT",
            &[(100.0, 5.0)],
            &[(101.0, 1.0), (102.0, 5.0), (103.0, 5.0)],
        ),
        // An empty-delta tick whose only job is to fold the fill activated
        // above into the portfolio (folding happens at the tail of the
        // *next* event's processing).
        depth(20, 3, "BTCUSDT", &[], &[]),
    ];

    let strategy = FireOnceTaker {
        symbol: "BTCUSDT".into(),
        side: Side::Buy,
        quantity: 3.0,
        fired: false,
    };
    let engine = Engine::new(EngineConfig {
        broker: backtest_engine::BrokerConfig {
            taker_fee_frac: 0.0004,
            ..Default::default()
        },
        ..Default::default()
    });
    let result = engine.run(events.into_iter(), strategy).unwrap();

    assert_eq!(result.broker.fills.len(), 1);
    let fill = &result.broker.fills[0];
    let expected_avg = (101.0 * 1.0 + 102.0 * 2.0) / 3.0;
    assert!((fill.price - expected_avg).abs() < 1e-6);
    assert_eq!(fill.quantity, 3.0);

    let position = result.portfolio.position("BTCUSDT");
    assert_eq!(position.net_qty, 3.0);
    assert!((position.avg_entry_price - expected_avg).abs() < 1e-6);

    let book = result.books.get("BTCUSDT").unwrap();
    assert_eq!(book.best_ask(), Some(102.0));
    assert_eq!(book.best_ask_qty(), Some(3.0));
}

#[test]
fn maker_queue_ahead_requires_the_tape_to_clear_before_filling() {
    // Resting buy limit at 100.0 behind 2.0 of visible queue. A second depth
    // tick is interleaved before the trades so the broker has a chance to
    // activate the resting order (activation trails submission by one
    // event's worth of broker-time advancement) before the tape starts
    // aging it.
    let events = vec![
        depth(0, 1, "BTCUSDT", &[(100.0, 2.0)], &[(101.0, 1.0)]),
        depth(5, 2, "BTCUSDT", &[(100.0, 2.0)], &[(101.0, 1.0)]),
        trade(10, 1, "BTCUSDT", 100.0, 1.5, false),
        trade(20, 2, "BTCUSDT", 100.0, 1.5, false),
    ];

    let strategy = FireOnceMaker {
        symbol: "BTCUSDT".into(),
        side: Side::Buy,
        quantity: 1.0,
        limit_price: 100.0,
        fired: false,
    };
    let engine = Engine::new(EngineConfig {
        broker: backtest_engine::BrokerConfig {
            maker_queue_ahead_factor: 1.0,
            maker_trade_participation: 1.0,
            maker_fee_frac: 0.0,
            ..Default::default()
        },
        ..Default::default()
    });
    let result = engine.run(events.into_iter(), strategy).unwrap();

    // First trade (1.0) is absorbed entirely by queue ahead (2.0 -> 1.0).
    // Second trade (1.0) clears the remaining queue and fills the order.
    assert_eq!(result.broker.fills.len(), 1);
    assert_eq!(result.broker.fills[0].price, 100.0);
    assert_eq!(result.broker.fills[0].quantity, 1.0);
    assert_eq!(result.portfolio.position("BTCUSDT").net_qty, 1.0);
}

#[test]
fn funding_settles_once_per_boundary_for_an_open_position() {
    // Two trailing depth ticks give the broker time to activate the taker
    // submit (one event's worth of broker-time advancement) and then fold
    // the resulting fill into the portfolio (fills fold at the tail of the
    // *next* event's processing) before the funding-crossing mark arrives.
    let events = vec![
        depth(0, 1, "BTCUSDT", &[(100.0, 5.0)], &[(100.0, 5.0)]),
        depth(1, 2, "BTCUSDT", &[(100.0, 5.0)], &[(100.0, 5.0)]),
        depth(2, 3, "BTCUSDT", &[(100.0, 5.0)], &[(100.0, 5.0)]),
        Event::Mark(MarkPrice {
            event_time_ms: 1_000,
            received_time_ns: None,
            symbol: "BTCUSDT".into(),
            mark_price: 100.0,
            index_price: 100.0,
            funding_rate: 0.0001,
            next_funding_time_ms: 1_000,
        }),
        // A second mark at the very same boundary must not re-apply funding.
        Event::Mark(MarkPrice {
            event_time_ms: 1_000,
            received_time_ns: None,
            symbol: "BTCUSDT".into(),
            mark_price: 100.0,
            index_price: 100.0,
            funding_rate: 0.0001,
            next_funding_time_ms: 1_000,
        }),
    ];

    let strategy = FireOnceTaker {
        symbol: "BTCUSDT".into(),
        side: Side::Buy,
        quantity: 1.0,
        fired: false,
    };
    let engine = Engine::new(EngineConfig {
        portfolio: PortfolioConfig {
            funding_scope: FundingScope::ArrivedSymbolOnly,
        },
        ..Default::default()
    });
    let result = engine.run(events.into_iter(), strategy).unwrap();

    assert_eq!(result.portfolio.position("BTCUSDT").net_qty, 1.0);
    // funding_rate * mark * net_qty = 0.0001 * 100 * 1 = 0.01, charged once.
    assert!((result.portfolio.realized_pnl_usdt - (-0.01)).abs() < 1e-9);
}

#[test]
fn strict_monotonic_mode_fails_fast_on_a_late_event() {
    let events = vec![
        depth(1_000, 1, "BTCUSDT", &[(100.0, 1.0)], &[(101.0, 1.0)]),
        trade(900, 1, "BTCUSDT", 100.5, 1.0, false),
    ];
    let engine = Engine::new(EngineConfig {
        strict_event_time_monotonic: true,
        ..Default::default()
    });
    let err = engine
        .run(events.into_iter(), PassiveObserver::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::OutOfOrderEvent { .. }));
}

#[test]
fn guard_cooldown_blocks_submits_after_a_crossed_book_until_it_expires() {
    init_tracing();
    let events = vec![
        // Healthy, tight book first.
        depth(0, 1, "BTCUSDT", &[(100.0, 1.0)], &[(100.3, 1.0)]),
        // A crossed update trips the guard.
        depth(10, 2, "BTCUSDT", &[(102.0, 1.0)], &[(101.0, 1.0)]),
        // Still within the 1000ms cooldown.
        depth(500, 3, "BTCUSDT", &[(100.0, 1.0)], &[(100.3, 1.0)]),
        // Cooldown has elapsed and the book is healthy again.
        depth(2_000, 4, "BTCUSDT", &[(100.0, 1.0)], &[(100.3, 1.0)]),
    ];

    struct ProbeEachEvent {
        results: std::rc::Rc<std::cell::RefCell<Vec<bool>>>,
    }
    impl Strategy for ProbeEachEvent {
        fn on_event(&mut self, event: &Event, ctx: &mut EngineContext) {
            if let Event::Depth(_) = event {
                let order = Order::market(1, "BTCUSDT", Side::Buy, 0.1);
                let ok = ctx.broker.submit(order).is_ok();
                self.results.borrow_mut().push(ok);
            }
        }
    }

    let engine = Engine::new(EngineConfig {
        book_guard: true,
        book_guard_symbol: Some("BTCUSDT".into()),
        book_guard_config: BookGuardConfig {
            cooldown_ms: 1_000,
            ..Default::default()
        },
        ..Default::default()
    });
    let results = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let strategy = ProbeEachEvent {
        results: results.clone(),
    };
    engine.run(events.into_iter(), strategy).unwrap();

    assert_eq!(
        *results.borrow(),
        vec![true, false, false, true],
        "submits must be allowed, then blocked through cooldown, then allowed again"
    );
}

#[test]
fn trading_window_entry_only_still_allows_reducing_orders() {
    // Open a long inside the window first, then try to submit both a plain
    // entry and a reduce_only exit once the window has closed.
    let events = vec![
        depth(0, 1, "BTCUSDT", &[(100.0, 5.0)], &[(100.0, 5.0)]),
        depth(5_000, 2, "BTCUSDT", &[(100.0, 5.0)], &[(100.0, 5.0)]),
    ];

    struct WindowProbe {
        opened: bool,
    }
    impl Strategy for WindowProbe {
        fn on_event(&mut self, event: &Event, ctx: &mut EngineContext) {
            if !self.opened {
                let open = Order::market(1, "BTCUSDT", Side::Buy, 1.0);
                let _ = ctx.broker.submit(open);
                self.opened = true;
                return;
            }
            if event.event_time_ms() == 5_000 {
                let entry = Order::market(2, "BTCUSDT", Side::Buy, 1.0);
                let entry_result = ctx.broker.submit(entry);
                assert!(
                    entry_result.is_err(),
                    "a plain entry outside the window must be rejected"
                );

                let reduce = Order::market(3, "BTCUSDT", Side::Sell, 1.0).reduce_only();
                let reduce_result = ctx.broker.submit(reduce);
                assert!(
                    reduce_result.is_ok(),
                    "a reduce_only order must still pass window gating"
                );
            }
        }
    }

    let engine = Engine::new(EngineConfig {
        trading_start_ms: Some(0),
        trading_end_ms: Some(1_000),
        allow_reducing_outside_trading_window: true,
        ..Default::default()
    });
    let strategy = WindowProbe { opened: false };
    let result = engine.run(events.into_iter(), strategy).unwrap();
    // The reduce_only exit shrinks the long back toward flat.
    assert!(result.portfolio.position("BTCUSDT").net_qty < 1.0);
}
