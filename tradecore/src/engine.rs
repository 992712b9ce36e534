//! The trade-engine loop: a single thread draining the market-update and
//! client-response rings, maintaining the downstream books, and driving the
//! active algorithm. Algorithms need no internal locking under this model.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::{
    algo::{Algorithm, TradingContext},
    depth::MarketOrderBook,
    feature::FeatureEngine,
    oms::OrderManager,
    position::PositionKeeper,
    queue::Consumer,
    risk::RiskManager,
    types::{ClientResponse, MarketUpdate, MarketUpdateKind, TickerId},
};

const IDLE_SLEEP: Duration = Duration::from_micros(10);

pub struct TradeEngine {
    books: HashMap<TickerId, MarketOrderBook>,
    features: HashMap<TickerId, FeatureEngine>,
    om: OrderManager,
    risk: RiskManager,
    positions: PositionKeeper,
    algo: Box<dyn Algorithm>,
    market_rx: Consumer<MarketUpdate>,
    response_rx: Consumer<ClientResponse>,
    last_event_time: Instant,
    silent_threshold: Duration,
}

impl TradeEngine {
    pub fn new(
        algo: Box<dyn Algorithm>,
        om: OrderManager,
        risk: RiskManager,
        market_rx: Consumer<MarketUpdate>,
        response_rx: Consumer<ClientResponse>,
        silent_threshold: Duration,
    ) -> Self {
        Self {
            books: HashMap::new(),
            features: HashMap::new(),
            om,
            risk,
            positions: PositionKeeper::new(),
            algo,
            market_rx,
            response_rx,
            last_event_time: Instant::now(),
            silent_threshold,
        }
    }

    /// Seconds since the last market update or client response.
    pub fn silent_seconds(&self) -> f64 {
        self.last_event_time.elapsed().as_secs_f64()
    }

    /// Runs until `running` is cleared or the feed stays silent past the
    /// configured threshold.
    pub fn run(&mut self, running: Arc<AtomicBool>) {
        info!(
            silent_threshold_secs = self.silent_threshold.as_secs(),
            "trade engine started"
        );
        while running.load(Ordering::Acquire) {
            let mut worked = false;
            while let Some(update) = self.market_rx.pop() {
                self.on_market_update(&update);
                worked = true;
            }
            while let Some(response) = self.response_rx.pop() {
                self.on_client_response(&response);
                worked = true;
            }
            if worked {
                self.last_event_time = Instant::now();
            } else {
                if self.last_event_time.elapsed() >= self.silent_threshold {
                    info!(
                        silent_secs = self.silent_seconds(),
                        "no events past the silent threshold; shutting down"
                    );
                    running.store(false, Ordering::Release);
                    break;
                }
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        info!("trade engine stopped");
    }

    pub fn on_market_update(&mut self, update: &MarketUpdate) {
        let Self {
            books,
            features,
            om,
            risk,
            positions,
            algo,
            ..
        } = self;

        let book = books
            .entry(update.ticker_id)
            .or_insert_with(|| MarketOrderBook::new(update.ticker_id));
        book.on_update(update);

        let ticker_features = features.entry(update.ticker_id).or_default();
        match update.kind {
            MarketUpdateKind::Trade => {
                ticker_features.on_trade_update(update, book);
                let mut ctx = TradingContext {
                    om: &mut *om,
                    risk: &*risk,
                    positions: &*positions,
                };
                algo.on_trade_update(update, book, ticker_features, &mut ctx);
            }
            MarketUpdateKind::SnapshotStart | MarketUpdateKind::SnapshotEnd => {}
            _ => {
                ticker_features.on_book_update(book);
                positions.on_bbo_update(update.ticker_id, book.bbo());
                let mut ctx = TradingContext {
                    om: &mut *om,
                    risk: &*risk,
                    positions: &*positions,
                };
                algo.on_book_update(book, ticker_features, &mut ctx);
            }
        }

        for reject in om.take_risk_rejects() {
            debug!(?reject, "risk reject synthesized");
            algo.on_order_update(&reject);
        }
    }

    pub fn on_client_response(&mut self, response: &ClientResponse) {
        self.om.on_response(response);
        self.positions.on_response(response);
        self.algo.on_order_update(response);
    }

    pub fn positions(&self) -> &PositionKeeper {
        &self.positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algo::{AlgoParams, AlgoType},
        queue::{Producer, Spsc},
        risk::TickerRiskLimits,
        types::{ClientRequest, ClientResponseKind, MarketUpdateKind, Side},
    };

    fn engine() -> (TradeEngine, Producer<MarketUpdate>, Producer<ClientResponse>, Consumer<ClientRequest>)
    {
        let (market_tx, market_rx) = Spsc::with_capacity(256);
        let (response_tx, response_rx) = Spsc::with_capacity(256);
        let (request_tx, request_rx) = Spsc::with_capacity(256);

        let om = OrderManager::new(1, request_tx);
        let mut risk = RiskManager::new(1e12, 1e12);
        risk.set_limits(
            7,
            TickerRiskLimits {
                max_order_size: 0,
                max_position: 1000,
                max_loss: 1e12,
            },
        );
        let algo = crate::algo::build(
            AlgoType::MarketMaker,
            AlgoParams {
                clip: 5,
                threshold: 0.0,
            },
        );
        let engine = TradeEngine::new(
            algo,
            om,
            risk,
            market_rx,
            response_rx,
            Duration::from_secs(60),
        );
        (engine, market_tx, response_tx, request_rx)
    }

    fn add(ticker_id: TickerId, order_id: u64, side: Side, price: i64, qty: i64) -> MarketUpdate {
        MarketUpdate {
            kind: MarketUpdateKind::Add,
            ticker_id,
            order_id,
            side: Some(side),
            price,
            qty,
            priority: 0,
            local_ts: 0,
        }
    }

    #[test]
    fn market_updates_drive_quotes() {
        let (mut engine, mut market_tx, _response_tx, mut request_rx) = engine();
        assert!(market_tx.push(add(7, 1, Side::Buy, 10000, 4)));
        assert!(market_tx.push(add(7, 2, Side::Sell, 10010, 4)));

        while let Some(update) = engine.market_rx.pop() {
            engine.on_market_update(&update);
        }

        // A two-sided book produces a two-sided quote.
        let first = request_rx.pop().unwrap();
        let second = request_rx.pop().unwrap();
        assert_ne!(first.side, second.side);
    }

    #[test]
    fn responses_update_positions() {
        let (mut engine, _market_tx, mut response_tx, _request_rx) = engine();
        assert!(response_tx.push(ClientResponse {
            kind: ClientResponseKind::Filled,
            client_id: 1,
            ticker_id: 7,
            order_id: 99,
            side: Side::Buy,
            price: 10000,
            exec_qty: 5,
            leaves_qty: 0,
            ..Default::default()
        }));
        while let Some(response) = engine.response_rx.pop() {
            engine.on_client_response(&response);
        }
        assert_eq!(engine.positions().position(7), 5);
    }
}
