//! Pre-trade risk checks, invoked synchronously by the order manager before
//! every new order. A violation drops the request; the caller surfaces a
//! RISK_REJECT response.

use hashbrown::HashMap;
use tracing::warn;

use crate::{
    position::PositionKeeper,
    types::{Price, Qty, Side, TickerId},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RiskCheck {
    Allowed,
    OrderTooLarge,
    PositionTooLarge,
    LossTooLarge,
    NotionalTooLarge,
    DailyLossTooLarge,
    UnknownTicker,
}

#[derive(Clone, Copy, Debug)]
pub struct TickerRiskLimits {
    /// Zero disables the per-order size bound.
    pub max_order_size: Qty,
    pub max_position: i64,
    pub max_loss: f64,
}

pub struct RiskManager {
    limits: HashMap<TickerId, TickerRiskLimits>,
    max_position_value: f64,
    max_daily_loss: f64,
}

impl RiskManager {
    pub fn new(max_position_value: f64, max_daily_loss: f64) -> Self {
        Self {
            limits: HashMap::new(),
            max_position_value,
            max_daily_loss,
        }
    }

    pub fn set_limits(&mut self, ticker_id: TickerId, limits: TickerRiskLimits) {
        self.limits.insert(ticker_id, limits);
    }

    /// Gates a prospective new order of `qty` on `side` at `price`.
    pub fn check_pre_trade(
        &self,
        positions: &PositionKeeper,
        ticker_id: TickerId,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> RiskCheck {
        let Some(limits) = self.limits.get(&ticker_id) else {
            return RiskCheck::UnknownTicker;
        };

        if limits.max_order_size > 0 && qty > limits.max_order_size {
            return RiskCheck::OrderTooLarge;
        }

        let position_after = positions.position(ticker_id) + side.sign() * qty;
        if position_after.abs() > limits.max_position {
            return RiskCheck::PositionTooLarge;
        }

        if positions.total_pnl(ticker_id) < -limits.max_loss {
            return RiskCheck::LossTooLarge;
        }

        let new_notional = (price * qty) as f64;
        if positions.gross_notional() + new_notional > self.max_position_value {
            return RiskCheck::NotionalTooLarge;
        }

        if positions.portfolio_pnl() < -self.max_daily_loss {
            return RiskCheck::DailyLossTooLarge;
        }

        RiskCheck::Allowed
    }

    /// Convenience wrapper that logs the rejection cause.
    pub fn allows(
        &self,
        positions: &PositionKeeper,
        ticker_id: TickerId,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> bool {
        match self.check_pre_trade(positions, ticker_id, side, price, qty) {
            RiskCheck::Allowed => true,
            result => {
                warn!(ticker_id, ?side, price, qty, ?result, "risk check rejected order");
                false
            }
        }
    }
}
