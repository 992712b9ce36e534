//! Order book synthesis from aggregated depth snapshots.
//!
//! Neither venue feed carries per-order events: the equity feed reports five
//! aggregated levels per side in every FULL packet, and the crypto feed
//! reports partial-book snapshots. The synthesizer diffs each incoming
//! snapshot against the held state and emits canonical ADD/MODIFY/CANCEL
//! events, CANCELs first so a consumer never observes a transiently crossed
//! book. True per-order priority is not recoverable from these feeds and is
//! not attempted.

use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use tradecore::{
    depth::Bbo,
    types::{
        MarketUpdate, MarketUpdateKind, OrderId, Price, Qty, Side, TickerId, PRICE_INVALID,
        QTY_INVALID,
    },
};

/// One aggregated level of an incoming snapshot, best-first per side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LevelSnapshot {
    pub price: Price,
    pub qty: Qty,
    pub orders: u32,
}

/// A full depth snapshot plus the venue's last-trade fields.
#[derive(Clone, Debug, Default)]
pub struct DepthSnapshot {
    pub bids: Vec<LevelSnapshot>,
    pub asks: Vec<LevelSnapshot>,
    pub last_price: Price,
    pub last_qty: Qty,
}

/// Stable synthetic order id for a price level. Levels are the only "orders"
/// these feeds expose, so the id is a deterministic hash of the level key:
/// the same `(ticker, side, price)` always maps to the same id.
pub fn synthetic_order_id(ticker_id: TickerId, side: Side, price: Price) -> OrderId {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    ticker_id.hash(&mut hasher);
    side.hash(&mut hasher);
    price.hash(&mut hasher);
    hasher.finish()
}

pub struct BookSynthesizer {
    ticker_id: TickerId,
    bids: Vec<LevelSnapshot>,
    asks: Vec<LevelSnapshot>,
    last_price: Price,
    last_qty: Qty,
    bbo: Bbo,
}

impl BookSynthesizer {
    pub fn new(ticker_id: TickerId) -> Self {
        Self {
            ticker_id,
            bids: Vec::with_capacity(8),
            asks: Vec::with_capacity(8),
            last_price: PRICE_INVALID,
            last_qty: QTY_INVALID,
            bbo: Bbo::default(),
        }
    }

    pub fn ticker_id(&self) -> TickerId {
        self.ticker_id
    }

    pub fn bbo(&self) -> &Bbo {
        &self.bbo
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn update(
        &self,
        kind: MarketUpdateKind,
        side: Side,
        price: Price,
        qty: Qty,
        local_ts: i64,
    ) -> MarketUpdate {
        MarketUpdate {
            kind,
            ticker_id: self.ticker_id,
            order_id: synthetic_order_id(self.ticker_id, side, price),
            side: Some(side),
            price,
            qty,
            priority: 1,
            local_ts,
        }
    }

    /// Diffs `snapshot` against the held state and returns the events in
    /// CANCEL, MODIFY, ADD order, followed by an inferred TRADE when the
    /// last-trade fields moved through a removed level. State is fully
    /// applied and the BBO recomputed before returning.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot, local_ts: i64) -> Vec<MarketUpdate> {
        let bids: Vec<LevelSnapshot> = snapshot
            .bids
            .iter()
            .filter(|level| level.price > 0 && level.qty > 0 && level.orders > 0)
            .copied()
            .collect();
        let asks: Vec<LevelSnapshot> = snapshot
            .asks
            .iter()
            .filter(|level| level.price > 0 && level.qty > 0 && level.orders > 0)
            .copied()
            .collect();

        // Consistency guard: a crossed incoming snapshot is venue noise.
        if let (Some(best_bid), Some(best_ask)) = (bids.first(), asks.first()) {
            if best_bid.price >= best_ask.price {
                warn!(
                    ticker_id = self.ticker_id,
                    bid = best_bid.price,
                    ask = best_ask.price,
                    "crossed snapshot discarded"
                );
                return Vec::new();
            }
        }

        let fresh_build = self.is_empty() && !(bids.is_empty() && asks.is_empty());

        let mut cancels = Vec::new();
        let mut modifies = Vec::new();
        let mut adds = Vec::new();
        let mut removed_bid_prices = Vec::new();
        let mut removed_ask_prices = Vec::new();

        self.diff_side(
            Side::Buy,
            &bids,
            local_ts,
            &mut cancels,
            &mut modifies,
            &mut adds,
            &mut removed_bid_prices,
        );
        self.diff_side(
            Side::Sell,
            &asks,
            local_ts,
            &mut cancels,
            &mut modifies,
            &mut adds,
            &mut removed_ask_prices,
        );

        let mut events = Vec::with_capacity(cancels.len() + modifies.len() + adds.len() + 3);
        if fresh_build {
            events.push(MarketUpdate {
                kind: MarketUpdateKind::SnapshotStart,
                ticker_id: self.ticker_id,
                order_id: 0,
                side: None,
                price: 0,
                qty: 0,
                priority: 0,
                local_ts,
            });
        }
        events.extend(cancels);
        events.extend(modifies);
        events.extend(adds);

        // Trade inference: the last-trade fields moved, and the trade price
        // matches a level this very snapshot removed.
        if (snapshot.last_price != self.last_price || snapshot.last_qty != self.last_qty)
            && self.last_price != PRICE_INVALID
        {
            let side = if removed_bid_prices.contains(&snapshot.last_price) {
                Some(Side::Sell)
            } else if removed_ask_prices.contains(&snapshot.last_price) {
                Some(Side::Buy)
            } else {
                None
            };
            if let Some(aggressor) = side {
                events.push(MarketUpdate {
                    kind: MarketUpdateKind::Trade,
                    ticker_id: self.ticker_id,
                    order_id: 0,
                    side: Some(aggressor),
                    price: snapshot.last_price,
                    qty: snapshot.last_qty.max(0),
                    priority: 0,
                    local_ts,
                });
            }
        }

        if fresh_build {
            events.push(MarketUpdate {
                kind: MarketUpdateKind::SnapshotEnd,
                ticker_id: self.ticker_id,
                order_id: 0,
                side: None,
                price: 0,
                qty: 0,
                priority: 0,
                local_ts,
            });
        }

        self.bids = bids;
        self.asks = asks;
        self.last_price = snapshot.last_price;
        self.last_qty = snapshot.last_qty;
        self.recompute_bbo();

        debug!(
            ticker_id = self.ticker_id,
            events = events.len(),
            "snapshot applied"
        );
        events
    }

    #[allow(clippy::too_many_arguments)]
    fn diff_side(
        &self,
        side: Side,
        new_levels: &[LevelSnapshot],
        local_ts: i64,
        cancels: &mut Vec<MarketUpdate>,
        modifies: &mut Vec<MarketUpdate>,
        adds: &mut Vec<MarketUpdate>,
        removed_prices: &mut Vec<Price>,
    ) {
        let old_levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };

        for old in old_levels {
            match new_levels.iter().find(|new| new.price == old.price) {
                None => {
                    removed_prices.push(old.price);
                    cancels.push(self.update(
                        MarketUpdateKind::Cancel,
                        side,
                        old.price,
                        0,
                        local_ts,
                    ));
                }
                Some(new) if new.qty != old.qty || new.orders != old.orders => {
                    modifies.push(self.update(
                        MarketUpdateKind::Modify,
                        side,
                        new.price,
                        new.qty,
                        local_ts,
                    ));
                }
                Some(_) => {}
            }
        }

        for new in new_levels {
            if !old_levels.iter().any(|old| old.price == new.price) {
                adds.push(self.update(MarketUpdateKind::Add, side, new.price, new.qty, local_ts));
            }
        }
    }

    /// Reconnect handling: emits a CANCEL for every extant level and wipes
    /// the state so the next snapshot is processed as a fresh build.
    pub fn clear(&mut self, local_ts: i64) -> Vec<MarketUpdate> {
        let mut events = Vec::with_capacity(self.bids.len() + self.asks.len());
        for level in &self.bids {
            events.push(self.update(MarketUpdateKind::Cancel, Side::Buy, level.price, 0, local_ts));
        }
        for level in &self.asks {
            events.push(self.update(
                MarketUpdateKind::Cancel,
                Side::Sell,
                level.price,
                0,
                local_ts,
            ));
        }
        self.bids.clear();
        self.asks.clear();
        self.last_price = PRICE_INVALID;
        self.last_qty = QTY_INVALID;
        self.bbo = Bbo::default();
        events
    }

    fn recompute_bbo(&mut self) {
        self.bbo = Bbo::default();
        if let Some(best) = self.bids.iter().max_by_key(|level| level.price) {
            self.bbo.bid_price = best.price;
            self.bbo.bid_qty = best.qty;
        }
        if let Some(best) = self.asks.iter().min_by_key(|level| level.price) {
            self.bbo.ask_price = best.price;
            self.bbo.ask_qty = best.qty;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn level(price: Price, qty: Qty, orders: u32) -> LevelSnapshot {
        LevelSnapshot { price, qty, orders }
    }

    fn snapshot(bids: Vec<LevelSnapshot>, asks: Vec<LevelSnapshot>) -> DepthSnapshot {
        DepthSnapshot {
            bids,
            asks,
            last_price: 0,
            last_qty: 0,
        }
    }

    fn kinds(events: &[MarketUpdate]) -> Vec<MarketUpdateKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn fresh_snapshot_emits_adds_and_bbo() {
        let mut book = BookSynthesizer::new(7);
        let events = book.apply_snapshot(
            &snapshot(
                vec![level(10000, 5, 1), level(9995, 3, 1)],
                vec![level(10010, 4, 1), level(10015, 2, 1)],
            ),
            0,
        );

        assert_eq!(
            kinds(&events),
            vec![
                MarketUpdateKind::SnapshotStart,
                MarketUpdateKind::Add,
                MarketUpdateKind::Add,
                MarketUpdateKind::Add,
                MarketUpdateKind::Add,
                MarketUpdateKind::SnapshotEnd,
            ]
        );
        let adds: Vec<_> = events
            .iter()
            .filter(|e| e.kind == MarketUpdateKind::Add)
            .collect();
        assert_eq!(adds[0].side, Some(Side::Buy));
        assert_eq!(adds[0].price, 10000);
        assert_eq!(adds[0].qty, 5);
        assert_eq!(adds[1].price, 9995);
        assert_eq!(adds[2].side, Some(Side::Sell));
        assert_eq!(adds[2].price, 10010);
        assert_eq!(adds[3].price, 10015);

        assert_eq!(
            *book.bbo(),
            Bbo {
                bid_price: 10000,
                bid_qty: 5,
                ask_price: 10010,
                ask_qty: 4
            }
        );
    }

    #[test]
    fn disappearing_level_cancels() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &snapshot(
                vec![level(10000, 5, 1), level(9995, 3, 1)],
                vec![level(10010, 4, 1), level(10015, 2, 1)],
            ),
            0,
        );
        let events = book.apply_snapshot(
            &snapshot(
                vec![level(10000, 5, 1)],
                vec![level(10010, 4, 1), level(10015, 2, 1)],
            ),
            0,
        );
        assert_eq!(kinds(&events), vec![MarketUpdateKind::Cancel]);
        assert_eq!(events[0].side, Some(Side::Buy));
        assert_eq!(events[0].price, 9995);
        assert_eq!(events[0].order_id, synthetic_order_id(7, Side::Buy, 9995));
        assert_eq!(book.bbo().bid_price, 10000);
        assert_eq!(book.bbo().ask_price, 10010);
    }

    #[test]
    fn qty_change_at_best_modifies() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &snapshot(vec![level(10000, 5, 1)], vec![level(10010, 4, 1)]),
            0,
        );
        let events = book.apply_snapshot(
            &snapshot(vec![level(10000, 7, 2)], vec![level(10010, 4, 1)]),
            0,
        );
        assert_eq!(kinds(&events), vec![MarketUpdateKind::Modify]);
        assert_eq!(events[0].price, 10000);
        assert_eq!(events[0].qty, 7);
        assert_eq!(book.bbo().bid_qty, 7);
    }

    #[test]
    fn cancels_precede_modifies_and_adds() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &snapshot(
                vec![level(10000, 5, 1), level(9995, 3, 1)],
                vec![level(10010, 4, 1)],
            ),
            0,
        );
        let events = book.apply_snapshot(
            &snapshot(
                vec![level(10005, 2, 1), level(10000, 6, 1)],
                vec![level(10010, 4, 1)],
            ),
            0,
        );
        assert_eq!(
            kinds(&events),
            vec![
                MarketUpdateKind::Cancel,
                MarketUpdateKind::Modify,
                MarketUpdateKind::Add,
            ]
        );
        assert_eq!(events[0].price, 9995);
        assert_eq!(events[1].price, 10000);
        assert_eq!(events[2].price, 10005);
        assert_eq!(book.bbo().bid_price, 10005);
    }

    #[test]
    fn crossed_snapshot_leaves_state_unchanged() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &snapshot(vec![level(10000, 5, 1)], vec![level(10010, 4, 1)]),
            0,
        );
        let before = *book.bbo();
        let events = book.apply_snapshot(
            &snapshot(vec![level(10010, 5, 1)], vec![level(10010, 4, 1)]),
            0,
        );
        assert!(events.is_empty());
        assert_eq!(*book.bbo(), before);
    }

    #[test]
    fn reconnect_clear_cancels_every_level() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &snapshot(
                vec![level(10000, 5, 1), level(9995, 3, 1)],
                vec![level(10010, 4, 1), level(10015, 2, 1)],
            ),
            0,
        );
        let events = book.clear(0);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.kind == MarketUpdateKind::Cancel));
        assert!(book.is_empty());
        assert!(!book.bbo().is_valid());

        // The next snapshot is a fresh build again.
        let rebuilt = book.apply_snapshot(
            &snapshot(vec![level(10002, 1, 1)], vec![level(10008, 1, 1)]),
            0,
        );
        assert_eq!(rebuilt.first().unwrap().kind, MarketUpdateKind::SnapshotStart);
        assert_eq!(book.bbo().bid_price, 10002);
    }

    #[test]
    fn trade_inferred_from_removed_ask() {
        let mut book = BookSynthesizer::new(7);
        book.apply_snapshot(
            &DepthSnapshot {
                bids: vec![level(10000, 5, 1)],
                asks: vec![level(10010, 4, 1), level(10015, 2, 1)],
                last_price: 9990,
                last_qty: 1,
            },
            0,
        );
        let events = book.apply_snapshot(
            &DepthSnapshot {
                bids: vec![level(10000, 5, 1)],
                asks: vec![level(10015, 2, 1)],
                last_price: 10010,
                last_qty: 4,
            },
            0,
        );
        let trade = events
            .iter()
            .find(|e| e.kind == MarketUpdateKind::Trade)
            .unwrap();
        assert_eq!(trade.side, Some(Side::Buy));
        assert_eq!(trade.price, 10010);
        assert_eq!(trade.qty, 4);
        // The trade follows the depth diff.
        assert_eq!(events.last().unwrap().kind, MarketUpdateKind::Trade);
    }

    #[test]
    fn synthetic_ids_are_stable() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let ticker_id: TickerId = rng.random_range(0..1000);
            let side = if rng.random::<bool>() {
                Side::Buy
            } else {
                Side::Sell
            };
            let price: Price = rng.random_range(1..1_000_000);
            let first = synthetic_order_id(ticker_id, side, price);
            let second = synthetic_order_id(ticker_id, side, price);
            assert_eq!(first, second);
            assert_ne!(first, synthetic_order_id(ticker_id, side.flip(), price));
        }
    }

    // The net effect of the emitted events applied to an empty downstream
    // book must equal the final snapshot.
    #[test]
    fn event_stream_replays_to_final_snapshot() {
        use tradecore::depth::MarketOrderBook;

        let mut rng = rand::rng();
        let mut synth = BookSynthesizer::new(7);
        let mut downstream = MarketOrderBook::new(7);

        let mut last = DepthSnapshot::default();
        for _ in 0..200 {
            let mut bids = Vec::new();
            let mut asks = Vec::new();
            let mid: Price = rng.random_range(1000..2000);
            for i in 0..rng.random_range(0..=5) {
                bids.push(level(mid - 1 - i, rng.random_range(1..100), 1));
            }
            for i in 0..rng.random_range(0..=5) {
                asks.push(level(mid + 1 + i, rng.random_range(1..100), 1));
            }
            let snap = snapshot(bids, asks);
            for event in synth.apply_snapshot(&snap, 0) {
                downstream.on_update(&event);
            }
            last = snap;
        }

        let expected_bid = last.bids.iter().map(|l| l.price).max();
        let expected_ask = last.asks.iter().map(|l| l.price).min();
        assert_eq!(
            downstream.bbo().is_valid(),
            expected_bid.is_some() && expected_ask.is_some()
        );
        if let Some(price) = expected_bid {
            assert_eq!(downstream.bbo().bid_price, price);
        }
        if let Some(price) = expected_ask {
            assert_eq!(downstream.bbo().ask_price, price);
        }
        assert_eq!(downstream.depth(Side::Buy), last.bids.len());
        assert_eq!(downstream.depth(Side::Sell), last.asks.len());
    }
}
