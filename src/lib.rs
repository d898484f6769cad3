//! Event-driven market-data backtest engine for crypto derivatives.
//!
//! The core replays a merged, time-ordered stream of market events against a
//! user-supplied [`engine::Strategy`], simulating order submission, fills,
//! fees, PnL, and funding settlement. Storage adapters, credential loading,
//! CLI front-ends, and analytics reporting are external collaborators; this
//! crate only defines the contract it needs from (or hands to) them.

pub mod adapter;
pub mod book;
pub mod broker;
pub mod clock;
pub mod engine;
pub mod error;
pub mod guard;
pub mod merge;
pub mod model;
pub mod portfolio;

pub use adapter::{FileLineSource, VecSource};
pub use book::{BookManager, L2Book};
pub use broker::{BrokerConfig, SimulatedBroker};
pub use clock::{EngineClock, EventTimeMs, ReceivedTimeNs};
pub use engine::{Engine, EngineConfig, EngineContext, EngineResult, Strategy};
pub use error::EngineError;
pub use guard::{BookGuard, BookGuardConfig};
pub use merge::{slice_window, MergedStream};
pub use model::{
    DepthUpdate, Event, Fill, Liquidation, MarkPrice, OpenInterest, Order, OrderId, OrderType,
    Position, PriceQty, Side, Ticker, TimeInForce, Trade,
};
pub use portfolio::{FundingScope, Portfolio, PortfolioConfig};
