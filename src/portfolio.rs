//! Position accounting and funding settlement.
//!
//! Fill application follows the teacher's weighted-average-cost-basis
//! algebra: opening size recomputes the average entry price, reducing size
//! realizes PnL proportionally against the existing basis, and crossing
//! through flat re-opens a fresh basis at the fill price. Funding is applied
//! once per boundary crossing per symbol, scoped by `FundingScope`.

use crate::clock::EventTimeMs;
use crate::model::{Fill, Liquidity, Position, Side};
use std::collections::HashMap;

/// Which symbols get funding applied when a funding boundary is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingScope {
    /// Only the symbol whose `MarkPrice` event carried the crossing.
    ArrivedSymbolOnly,
    /// Every symbol whose own funding boundary has also been crossed as of
    /// the current engine time, even if its own `MarkPrice` hasn't arrived
    /// yet this tick.
    AllCrossedSymbols,
}

impl Default for FundingScope {
    fn default() -> Self {
        FundingScope::ArrivedSymbolOnly
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioConfig {
    pub funding_scope: FundingScope,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            funding_scope: FundingScope::default(),
        }
    }
}

/// Tracks positions, realized PnL, and fees across every symbol touched by
/// the run.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    config: PortfolioConfig,
    positions: HashMap<String, Position>,
    pub realized_pnl_usdt: f64,
    pub fees_paid_usdt: f64,
    /// Last funding boundary (ms) applied per symbol, for idempotence.
    last_funding_boundary_ms: HashMap<String, i64>,
}

impl Portfolio {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn position(&self, symbol: &str) -> Position {
        self.positions.get(symbol).copied().unwrap_or_default()
    }

    pub fn positions(&self) -> impl Iterator<Item = (&String, &Position)> {
        self.positions.iter()
    }

    /// Apply a fill to the relevant symbol's position, updating realized
    /// PnL and fees. Mirrors the teacher's `TokenPosition::apply_fill`:
    /// same-direction fills widen the basis, opposite-direction fills
    /// realize PnL proportionally and, if the fill overshoots flat, flip
    /// into a fresh position at the fill price for the residual quantity.
    pub fn apply_fill(&mut self, fill: &Fill) {
        self.fees_paid_usdt += fill.fee;
        let position = self.positions.entry(fill.symbol.clone()).or_default();
        let delta_qty = fill.side.sign() * fill.quantity;

        let same_direction =
            position.net_qty == 0.0 || position.net_qty.signum() == delta_qty.signum();

        if same_direction {
            let new_qty = position.net_qty + delta_qty;
            let prior_notional = position.avg_entry_price * position.net_qty.abs();
            let added_notional = fill.price * fill.quantity;
            position.avg_entry_price = if new_qty.abs() > 1e-12 {
                (prior_notional + added_notional) / new_qty.abs()
            } else {
                0.0
            };
            position.net_qty = new_qty;
        } else {
            let closing_qty = delta_qty.abs().min(position.net_qty.abs());
            let pnl_per_unit = match fill.side {
                // Selling against a long position realizes (sell_price - entry).
                Side::Sell => fill.price - position.avg_entry_price,
                // Buying against a short position realizes (entry - buy_price).
                Side::Buy => position.avg_entry_price - fill.price,
            };
            self.realized_pnl_usdt += pnl_per_unit * closing_qty;

            let remaining_close = position.net_qty.abs() - closing_qty;
            let overshoot = fill.quantity - closing_qty;

            if remaining_close > 1e-12 {
                position.net_qty = position.net_qty.signum() * remaining_close;
            } else if overshoot > 1e-12 {
                // Flipped through flat: open a fresh position sized by the
                // residual quantity at the fill price.
                position.net_qty = delta_qty.signum() * overshoot;
                position.avg_entry_price = fill.price;
            } else {
                position.net_qty = 0.0;
                position.avg_entry_price = 0.0;
            }
        }

        let _ = fill.liquidity; // fee rate already folded into fill.fee by the broker
    }

    /// Mark-to-market a symbol's position against its latest mark price.
    pub fn mark(&mut self, symbol: &str, mark_price: f64) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.last_mark_price = Some(mark_price);
        }
    }

    pub fn unrealized_pnl(&self, symbol: &str) -> f64 {
        let position = self.position(symbol);
        match position.last_mark_price {
            Some(mark) => (mark - position.avg_entry_price) * position.net_qty,
            None => 0.0,
        }
    }

    /// Apply a funding payment/charge for `symbol` at its current mark
    /// price, guarded against double-application within the same boundary
    /// crossing.
    pub fn apply_funding(
        &mut self,
        symbol: &str,
        funding_rate: f64,
        mark_price: f64,
        boundary_ms: EventTimeMs,
    ) -> bool {
        if self.last_funding_boundary_ms.get(symbol) == Some(&boundary_ms) {
            return false;
        }
        self.last_funding_boundary_ms
            .insert(symbol.to_string(), boundary_ms);

        let position = self.position(symbol);
        if position.is_flat() {
            return true;
        }
        // Longs pay when funding_rate is positive; shorts receive.
        let payment = funding_rate * mark_price * position.net_qty;
        self.realized_pnl_usdt -= payment;
        true
    }

    pub fn funding_scope(&self) -> FundingScope {
        self.config.funding_scope
    }

    pub fn net_pnl(&self) -> f64 {
        self.realized_pnl_usdt - self.fees_paid_usdt
    }
}
