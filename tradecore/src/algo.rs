//! The algorithm seam of the trade engine. Algorithms run strictly inside
//! the engine's single thread and interact with the market only through the
//! order manager, which applies the risk gate to every new order.

use std::str::FromStr;

use tracing::info;

use crate::{
    depth::MarketOrderBook,
    feature::{FeatureEngine, FEATURE_INVALID},
    oms::OrderManager,
    position::PositionKeeper,
    risk::RiskManager,
    types::{ClientResponse, MarketUpdate, Price, Qty, Side},
};

/// Mutable trading state handed to algorithm callbacks.
pub struct TradingContext<'a> {
    pub om: &'a mut OrderManager,
    pub risk: &'a RiskManager,
    pub positions: &'a PositionKeeper,
}

pub trait Algorithm: Send {
    fn on_book_update(
        &mut self,
        book: &MarketOrderBook,
        features: &FeatureEngine,
        ctx: &mut TradingContext,
    );

    fn on_trade_update(
        &mut self,
        update: &MarketUpdate,
        book: &MarketOrderBook,
        features: &FeatureEngine,
        ctx: &mut TradingContext,
    );

    fn on_order_update(&mut self, response: &ClientResponse);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgoType {
    MarketMaker,
    LiquidityTaker,
}

impl FromStr for AlgoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET_MAKER" => Ok(AlgoType::MarketMaker),
            "LIQUIDITY_TAKER" => Ok(AlgoType::LiquidityTaker),
            other => Err(format!("unknown algorithm type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AlgoParams {
    pub clip: Qty,
    pub threshold: f64,
}

pub fn build(algo_type: AlgoType, params: AlgoParams) -> Box<dyn Algorithm> {
    info!(?algo_type, clip = params.clip, threshold = params.threshold, "starting algorithm");
    match algo_type {
        AlgoType::MarketMaker => Box::new(MarketMaker::new(params)),
        AlgoType::LiquidityTaker => Box::new(LiquidityTaker::new(params)),
    }
}

/// Quotes both sides around the depth-weighted fair price, joining the touch
/// when the edge is at least `threshold` ticks and stepping away otherwise.
pub struct MarketMaker {
    params: AlgoParams,
}

impl MarketMaker {
    pub fn new(params: AlgoParams) -> Self {
        Self { params }
    }
}

impl Algorithm for MarketMaker {
    fn on_book_update(
        &mut self,
        book: &MarketOrderBook,
        features: &FeatureEngine,
        ctx: &mut TradingContext,
    ) {
        let bbo = book.bbo();
        let fair = features.market_price();
        if !bbo.is_valid() || fair == FEATURE_INVALID {
            return;
        }

        let bid_price: Price = bbo.bid_price
            - if fair - bbo.bid_price as f64 >= self.params.threshold {
                0
            } else {
                1
            };
        let ask_price: Price = bbo.ask_price
            + if bbo.ask_price as f64 - fair >= self.params.threshold {
                0
            } else {
                1
            };

        ctx.om.move_orders(
            ctx.risk,
            ctx.positions,
            book.ticker_id(),
            bid_price,
            ask_price,
            self.params.clip,
        );
    }

    fn on_trade_update(
        &mut self,
        _update: &MarketUpdate,
        _book: &MarketOrderBook,
        _features: &FeatureEngine,
        _ctx: &mut TradingContext,
    ) {
    }

    fn on_order_update(&mut self, _response: &ClientResponse) {}
}

/// Takes liquidity when an aggressive trade consumes at least `threshold`
/// of the resting quantity at the touch, in the direction of the aggressor.
pub struct LiquidityTaker {
    params: AlgoParams,
}

impl LiquidityTaker {
    pub fn new(params: AlgoParams) -> Self {
        Self { params }
    }
}

impl Algorithm for LiquidityTaker {
    fn on_book_update(
        &mut self,
        _book: &MarketOrderBook,
        _features: &FeatureEngine,
        _ctx: &mut TradingContext,
    ) {
    }

    fn on_trade_update(
        &mut self,
        update: &MarketUpdate,
        book: &MarketOrderBook,
        features: &FeatureEngine,
        ctx: &mut TradingContext,
    ) {
        let bbo = book.bbo();
        let ratio = features.agg_trade_qty_ratio();
        if !bbo.is_valid() || ratio == FEATURE_INVALID || ratio < self.params.threshold {
            return;
        }

        match update.side {
            Some(Side::Buy) => ctx.om.move_order(
                ctx.risk,
                ctx.positions,
                book.ticker_id(),
                Side::Buy,
                bbo.ask_price,
                self.params.clip,
            ),
            Some(Side::Sell) => ctx.om.move_order(
                ctx.risk,
                ctx.positions,
                book.ticker_id(),
                Side::Sell,
                bbo.bid_price,
                self.params.clip,
            ),
            None => {}
        }
    }

    fn on_order_update(&mut self, _response: &ClientResponse) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::Spsc,
        risk::TickerRiskLimits,
        types::{ClientRequestKind, MarketUpdateKind},
    };

    fn book_with_touch() -> MarketOrderBook {
        let mut book = MarketOrderBook::new(7);
        for (order_id, side, price, qty) in
            [(1, Side::Buy, 10000, 4), (2, Side::Sell, 10010, 4)]
        {
            book.on_update(&MarketUpdate {
                kind: MarketUpdateKind::Add,
                ticker_id: 7,
                order_id,
                side: Some(side),
                price,
                qty,
                priority: 0,
                local_ts: 0,
            });
        }
        book
    }

    #[test]
    fn market_maker_quotes_after_features() {
        let book = book_with_touch();
        let mut features = FeatureEngine::new();
        features.on_book_update(&book);

        let (tx, mut rx) = Spsc::with_capacity(16);
        let mut om = OrderManager::new(1, tx);
        let mut risk = RiskManager::new(1e12, 1e12);
        risk.set_limits(
            7,
            TickerRiskLimits {
                max_order_size: 0,
                max_position: 1000,
                max_loss: 1e12,
            },
        );
        let positions = PositionKeeper::new();

        let mut algo = MarketMaker::new(AlgoParams {
            clip: 5,
            threshold: 0.0,
        });
        let mut ctx = TradingContext {
            om: &mut om,
            risk: &risk,
            positions: &positions,
        };
        algo.on_book_update(&book, &features, &mut ctx);

        let bid = rx.pop().unwrap();
        let ask = rx.pop().unwrap();
        assert_eq!(bid.kind, ClientRequestKind::New);
        assert_eq!(bid.price, 10000);
        assert_eq!(ask.price, 10010);
    }

    #[test]
    fn taker_follows_aggressor() {
        let book = book_with_touch();
        let mut features = FeatureEngine::new();
        let trade = MarketUpdate {
            kind: MarketUpdateKind::Trade,
            ticker_id: 7,
            order_id: 0,
            side: Some(Side::Buy),
            price: 10010,
            qty: 3,
            priority: 0,
            local_ts: 0,
        };
        features.on_trade_update(&trade, &book);

        let (tx, mut rx) = Spsc::with_capacity(16);
        let mut om = OrderManager::new(1, tx);
        let mut risk = RiskManager::new(1e12, 1e12);
        risk.set_limits(
            7,
            TickerRiskLimits {
                max_order_size: 0,
                max_position: 1000,
                max_loss: 1e12,
            },
        );
        let positions = PositionKeeper::new();

        let mut algo = LiquidityTaker::new(AlgoParams {
            clip: 2,
            threshold: 0.5,
        });
        let mut ctx = TradingContext {
            om: &mut om,
            risk: &risk,
            positions: &positions,
        };
        algo.on_trade_update(&trade, &book, &features, &mut ctx);

        let req = rx.pop().unwrap();
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.price, 10010);
        assert_eq!(req.qty, 2);
        assert!(rx.pop().is_none());
    }
}
