//! Market features derived incrementally from book and trade updates.

use crate::{
    depth::MarketOrderBook,
    types::{MarketUpdate, Qty, Side},
};

pub const FEATURE_INVALID: f64 = f64::MIN;

/// Fair-price and trade-flow signals for the algorithms. Values hold the
/// sentinel until enough state has been seen to compute them.
#[derive(Debug)]
pub struct FeatureEngine {
    market_price: f64,
    agg_trade_qty_ratio: f64,
}

impl Default for FeatureEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureEngine {
    pub fn new() -> Self {
        Self {
            market_price: FEATURE_INVALID,
            agg_trade_qty_ratio: FEATURE_INVALID,
        }
    }

    /// Depth-weighted fair price; leans toward the side with less resting
    /// quantity.
    pub fn market_price(&self) -> f64 {
        self.market_price
    }

    /// Aggressor quantity as a fraction of the resting quantity it hit.
    pub fn agg_trade_qty_ratio(&self) -> f64 {
        self.agg_trade_qty_ratio
    }

    pub fn on_book_update(&mut self, book: &MarketOrderBook) {
        let bbo = book.bbo();
        if bbo.is_valid() && bbo.bid_qty > 0 && bbo.ask_qty > 0 {
            let bid_qty = bbo.bid_qty as f64;
            let ask_qty = bbo.ask_qty as f64;
            self.market_price = (bbo.bid_price as f64 * ask_qty + bbo.ask_price as f64 * bid_qty)
                / (bid_qty + ask_qty);
        }
    }

    pub fn on_trade_update(&mut self, update: &MarketUpdate, book: &MarketOrderBook) {
        let bbo = book.bbo();
        let resting: Qty = match update.side {
            Some(Side::Buy) => bbo.ask_qty,
            Some(Side::Sell) => bbo.bid_qty,
            None => return,
        };
        if bbo.is_valid() && resting > 0 {
            self.agg_trade_qty_ratio = update.qty as f64 / resting as f64;
        }
    }
}
