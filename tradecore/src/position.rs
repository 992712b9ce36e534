//! Position and PnL tracking, updated on every fill and on BBO changes.
//! The risk manager reads this state synchronously before each new order.

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    depth::Bbo,
    types::{ClientResponse, ClientResponseKind, Price, Qty, Side, TickerId},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct TickerPosition {
    /// Signed position, positive when long.
    pub position: i64,
    // Weighted open cost: sum of price * qty over the open side.
    open_cost: f64,
    pub real_pnl: f64,
    pub unreal_pnl: f64,
    pub total_pnl: f64,
    pub volume: Qty,
    last_mid: Option<f64>,
}

impl TickerPosition {
    fn open_vwap(&self) -> f64 {
        if self.position == 0 {
            0.0
        } else {
            self.open_cost / self.position.unsigned_abs() as f64
        }
    }

    fn add_fill(&mut self, side: Side, price: Price, qty: Qty) {
        let old_position = self.position;
        let side_sign = side.sign();
        self.position += qty * side_sign;
        self.volume += qty;

        if old_position * side_sign >= 0 {
            // Extending (or opening) the position.
            self.open_cost += (price * qty) as f64;
        } else {
            // Reducing, and possibly flipping through zero.
            let vwap = self.open_cost / old_position.unsigned_abs() as f64;
            let closed = qty.min(old_position.abs());
            self.open_cost -= vwap * closed as f64;
            self.real_pnl += closed as f64 * (price as f64 - vwap) * old_position.signum() as f64;
            if self.position * old_position < 0 {
                self.open_cost = (price * self.position.abs()) as f64;
            }
        }

        if self.position == 0 {
            self.open_cost = 0.0;
            self.unreal_pnl = 0.0;
        } else if let Some(mid) = self.last_mid {
            self.mark(mid);
        }
        self.total_pnl = self.real_pnl + self.unreal_pnl;
    }

    fn mark(&mut self, mid: f64) {
        self.last_mid = Some(mid);
        if self.position != 0 {
            self.unreal_pnl = self.position as f64 * (mid - self.open_vwap());
        }
        self.total_pnl = self.real_pnl + self.unreal_pnl;
    }
}

#[derive(Default)]
pub struct PositionKeeper {
    positions: HashMap<TickerId, TickerPosition>,
}

impl PositionKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, ticker_id: TickerId) -> i64 {
        self.positions
            .get(&ticker_id)
            .map(|p| p.position)
            .unwrap_or(0)
    }

    pub fn ticker(&self, ticker_id: TickerId) -> Option<&TickerPosition> {
        self.positions.get(&ticker_id)
    }

    pub fn total_pnl(&self, ticker_id: TickerId) -> f64 {
        self.positions
            .get(&ticker_id)
            .map(|p| p.total_pnl)
            .unwrap_or(0.0)
    }

    /// Portfolio-wide mark-to-market PnL; the daily-loss risk input.
    pub fn portfolio_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.total_pnl).sum()
    }

    /// Portfolio-wide gross notional at each ticker's last mark.
    pub fn gross_notional(&self) -> f64 {
        self.positions
            .values()
            .filter_map(|p| {
                p.last_mid
                    .map(|mid| p.position.unsigned_abs() as f64 * mid)
            })
            .sum()
    }

    /// Applies a fill-bearing response.
    pub fn on_response(&mut self, response: &ClientResponse) {
        if !matches!(
            response.kind,
            ClientResponseKind::Filled | ClientResponseKind::PartiallyFilled
        ) {
            return;
        }
        let position = self.positions.entry(response.ticker_id).or_default();
        position.add_fill(response.side, response.price, response.exec_qty);
        debug!(
            ticker_id = response.ticker_id,
            position = position.position,
            real_pnl = position.real_pnl,
            unreal_pnl = position.unreal_pnl,
            "fill applied"
        );
    }

    /// Re-marks a ticker's open position against the new BBO mid.
    pub fn on_bbo_update(&mut self, ticker_id: TickerId, bbo: &Bbo) {
        let Some(mid) = bbo.mid() else { return };
        if let Some(position) = self.positions.get_mut(&ticker_id) {
            position.mark(mid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientResponseKind::*;

    fn fill(ticker_id: TickerId, side: Side, price: Price, qty: Qty) -> ClientResponse {
        ClientResponse {
            kind: Filled,
            ticker_id,
            side,
            price,
            exec_qty: qty,
            leaves_qty: 0,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_realizes_pnl() {
        let mut keeper = PositionKeeper::new();
        keeper.on_response(&fill(1, Side::Buy, 10000, 10));
        assert_eq!(keeper.position(1), 10);

        keeper.on_response(&fill(1, Side::Sell, 10050, 10));
        assert_eq!(keeper.position(1), 0);
        let pos = keeper.ticker(1).unwrap();
        assert_eq!(pos.real_pnl, 500.0);
        assert_eq!(pos.unreal_pnl, 0.0);
    }

    #[test]
    fn partial_close_keeps_vwap() {
        let mut keeper = PositionKeeper::new();
        keeper.on_response(&fill(1, Side::Buy, 10000, 10));
        keeper.on_response(&fill(1, Side::Buy, 10100, 10));
        // vwap 10050
        keeper.on_response(&fill(1, Side::Sell, 10150, 5));
        let pos = keeper.ticker(1).unwrap();
        assert_eq!(pos.position, 15);
        assert_eq!(pos.real_pnl, 500.0);
    }

    #[test]
    fn flip_through_zero_rebases_cost() {
        let mut keeper = PositionKeeper::new();
        keeper.on_response(&fill(1, Side::Buy, 10000, 5));
        keeper.on_response(&fill(1, Side::Sell, 10020, 8));
        let pos = keeper.ticker(1).unwrap();
        assert_eq!(pos.position, -3);
        assert_eq!(pos.real_pnl, 100.0);
        // The remaining short is carried at the flip price.
        assert_eq!(pos.open_vwap(), 10020.0);
    }

    #[test]
    fn mark_to_market_moves_unrealized() {
        let mut keeper = PositionKeeper::new();
        keeper.on_response(&fill(1, Side::Buy, 10000, 10));
        let bbo = Bbo {
            bid_price: 10010,
            bid_qty: 1,
            ask_price: 10030,
            ask_qty: 1,
        };
        keeper.on_bbo_update(1, &bbo);
        let pos = keeper.ticker(1).unwrap();
        assert_eq!(pos.unreal_pnl, 200.0);
        assert_eq!(keeper.portfolio_pnl(), 200.0);
        assert_eq!(keeper.gross_notional(), 100_200.0);
    }
}
