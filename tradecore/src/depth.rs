//! Downstream market order book.
//!
//! Consumes the already-diffed [`MarketUpdate`] stream produced by the venue
//! adapters (per-order ADD/MODIFY/CANCEL events, trades, clears) and keeps
//! per-price aggregates plus a cached BBO for the feature engine and the
//! algorithms. This book is strictly a consumer: it never re-derives events.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::{error, warn};

use crate::types::{
    MarketUpdate, MarketUpdateKind, OrderId, Price, Qty, Side, TickerId, PRICE_INVALID,
    QTY_INVALID,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bbo {
    pub bid_price: Price,
    pub bid_qty: Qty,
    pub ask_price: Price,
    pub ask_qty: Qty,
}

impl Default for Bbo {
    fn default() -> Self {
        Self {
            bid_price: PRICE_INVALID,
            bid_qty: QTY_INVALID,
            ask_price: PRICE_INVALID,
            ask_qty: QTY_INVALID,
        }
    }
}

impl Bbo {
    pub fn is_valid(&self) -> bool {
        self.bid_price != PRICE_INVALID && self.ask_price != PRICE_INVALID
    }

    pub fn mid(&self) -> Option<f64> {
        if self.is_valid() {
            Some((self.bid_price + self.ask_price) as f64 / 2.0)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BookOrder {
    side: Side,
    price: Price,
    qty: Qty,
}

#[derive(Clone, Copy, Debug, Default)]
struct Level {
    agg_qty: Qty,
    order_count: u32,
}

/// One order book per subscribed ticker.
pub struct MarketOrderBook {
    ticker_id: TickerId,
    orders: HashMap<OrderId, BookOrder>,
    // Bids iterate best-first in reverse, asks best-first in order.
    bids: BTreeMap<Price, Level>,
    asks: BTreeMap<Price, Level>,
    bbo: Bbo,
    pub last_trade_price: Price,
    pub last_trade_qty: Qty,
}

impl MarketOrderBook {
    pub fn new(ticker_id: TickerId) -> Self {
        Self {
            ticker_id,
            orders: HashMap::new(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            bbo: Bbo::default(),
            last_trade_price: PRICE_INVALID,
            last_trade_qty: QTY_INVALID,
        }
    }

    pub fn ticker_id(&self) -> TickerId {
        self.ticker_id
    }

    pub fn bbo(&self) -> &Bbo {
        &self.bbo
    }

    /// Applies one normalized event. Trades update the last-trade fields but
    /// not the depth; the adapter's synthesizer already reflected any depth
    /// consequence as separate events.
    pub fn on_update(&mut self, update: &MarketUpdate) {
        match update.kind {
            MarketUpdateKind::Add => self.add(update),
            MarketUpdateKind::Modify => self.modify(update),
            MarketUpdateKind::Cancel => self.cancel(update),
            MarketUpdateKind::Trade => {
                self.last_trade_price = update.price;
                self.last_trade_qty = update.qty;
            }
            MarketUpdateKind::Clear => self.clear(),
            MarketUpdateKind::SnapshotStart | MarketUpdateKind::SnapshotEnd => {}
            MarketUpdateKind::Invalid => {
                warn!(ticker_id = self.ticker_id, "invalid market update");
            }
        }
        if matches!(
            update.kind,
            MarketUpdateKind::Add | MarketUpdateKind::Modify | MarketUpdateKind::Cancel
        ) {
            self.update_bbo();
            self.enforce_integrity();
        }
    }

    fn side_of(&mut self, side: Side) -> &mut BTreeMap<Price, Level> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn add(&mut self, update: &MarketUpdate) {
        let Some(side) = update.side else {
            warn!(ticker_id = self.ticker_id, "ADD without a side");
            return;
        };
        let order = BookOrder {
            side,
            price: update.price,
            qty: update.qty,
        };
        if self.orders.insert(update.order_id, order).is_some() {
            warn!(
                ticker_id = self.ticker_id,
                order_id = update.order_id,
                "duplicate ADD; replacing"
            );
        }
        let level = self.side_of(side).entry(update.price).or_default();
        level.agg_qty += update.qty;
        level.order_count += 1;
    }

    fn modify(&mut self, update: &MarketUpdate) {
        let Some(order) = self.orders.get_mut(&update.order_id) else {
            // A MODIFY for an unknown order is treated as an ADD; the feed may
            // have started mid-stream.
            self.add(update);
            return;
        };
        let side = order.side;
        let old_price = order.price;
        let old_qty = order.qty;
        order.price = update.price;
        order.qty = update.qty;

        if old_price == update.price {
            let levels = self.side_of(side);
            let mut emptied = false;
            if let Some(level) = levels.get_mut(&update.price) {
                level.agg_qty += update.qty - old_qty;
                emptied = level.agg_qty <= 0;
            }
            if emptied {
                levels.remove(&update.price);
            }
        } else {
            self.remove_from_level(side, old_price, old_qty);
            let level = self.side_of(side).entry(update.price).or_default();
            level.agg_qty += update.qty;
            level.order_count += 1;
        }
    }

    fn cancel(&mut self, update: &MarketUpdate) {
        let Some(order) = self.orders.remove(&update.order_id) else {
            return;
        };
        self.remove_from_level(order.side, order.price, order.qty);
    }

    fn remove_from_level(&mut self, side: Side, price: Price, qty: Qty) {
        let levels = self.side_of(side);
        if let Some(level) = levels.get_mut(&price) {
            level.agg_qty -= qty;
            level.order_count = level.order_count.saturating_sub(1);
            if level.agg_qty <= 0 || level.order_count == 0 {
                levels.remove(&price);
            }
        }
    }

    pub fn clear(&mut self) {
        self.orders.clear();
        self.bids.clear();
        self.asks.clear();
        self.bbo = Bbo::default();
    }

    fn update_bbo(&mut self) {
        self.bbo = Bbo::default();
        if let Some((price, level)) = self.bids.iter().next_back() {
            self.bbo.bid_price = *price;
            self.bbo.bid_qty = level.agg_qty;
        }
        if let Some((price, level)) = self.asks.iter().next() {
            self.bbo.ask_price = *price;
            self.bbo.ask_qty = level.agg_qty;
        }
    }

    // A crossed book after applying an adapter event means the upstream state
    // diverged; drop everything and rebuild from the next snapshot.
    fn enforce_integrity(&mut self) {
        if self.bbo.is_valid() && self.bbo.bid_price >= self.bbo.ask_price {
            error!(
                ticker_id = self.ticker_id,
                bid = self.bbo.bid_price,
                ask = self.bbo.ask_price,
                "crossed book; clearing and awaiting rebuild"
            );
            self.clear();
        }
    }

    pub fn depth(&self, side: Side) -> usize {
        match side {
            Side::Buy => self.bids.len(),
            Side::Sell => self.asks.len(),
        }
    }
}
