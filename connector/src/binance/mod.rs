//! Crypto venue adapter. The feed is venue-native JSON over the combined
//! stream endpoint, so there is no binary decoding here: depth snapshots go
//! through the same book synthesizer as the equity feed, trades map straight
//! to canonical TRADE events.

pub mod msg;
pub mod rest;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use chrono::Utc;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, trace, warn};

use tradecore::{
    queue::{Consumer, Producer, Spsc},
    types::{MarketUpdate, MarketUpdateKind, Price, Qty, Side, StreamMode, TickerId},
};

use crate::{
    connector::{Connector, ConnectorError, FeedInput, Instrument, InstrumentMap},
    session::{self, SessionConfig, SessionShared, TextFrames},
    synth::{BookSynthesizer, DepthSnapshot, LevelSnapshot},
};

#[derive(Error, Debug)]
pub enum BinanceError {
    #[error("ReqError: {0:?}")]
    Req(#[from] reqwest::Error),
    #[error("Tungstenite: {0:?}")]
    Tungstenite(#[from] tungstenite::Error),
    #[error("QsError: {0:?}")]
    Qs(#[from] serde_qs::Error),
    #[error("Api: {code} - {msg}")]
    Api { code: i64, msg: String },
}

/// Decimal-string prices convert to fixed point at two decimals, quantities
/// at four; both venues then share one integer domain downstream.
pub const PRICE_SCALE: f64 = 100.0;
pub const QTY_SCALE: f64 = 10_000.0;

pub fn price_to_ticks(price: f64) -> Price {
    (price * PRICE_SCALE).round() as Price
}

pub fn qty_to_lots(qty: f64) -> Qty {
    (qty * QTY_SCALE).round() as Qty
}

const FEED_RING_CAPACITY: usize = 8192;

type SharedInstruments = Arc<Mutex<InstrumentMap<String>>>;
type SharedSubscriptions = Arc<Mutex<HashMap<String, StreamMode>>>;

/// [`BinanceAdapter`] builder.
pub struct BinanceAdapterBuilder {
    stream_url: String,
    market_tx: Option<Producer<MarketUpdate>>,
}

impl BinanceAdapterBuilder {
    pub fn stream_url<E: Into<String>>(self, url: E) -> Self {
        Self {
            stream_url: url.into(),
            ..self
        }
    }

    pub fn market_tx(self, market_tx: Producer<MarketUpdate>) -> Self {
        Self {
            market_tx: Some(market_tx),
            ..self
        }
    }

    pub fn build(self) -> Result<BinanceAdapter, ConnectorError> {
        if self.stream_url.is_empty() {
            return Err(ConnectorError::BuilderIncomplete("stream_url"));
        }
        let market_tx = self
            .market_tx
            .ok_or(ConnectorError::BuilderIncomplete("market_tx"))?;
        Ok(BinanceAdapter {
            url: self.stream_url,
            instruments: Arc::new(Mutex::new(InstrumentMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shared: SessionShared::new(),
            running: Arc::new(AtomicBool::new(false)),
            market_tx: Some(market_tx),
        })
    }
}

pub struct BinanceAdapter {
    url: String,
    instruments: SharedInstruments,
    subscriptions: SharedSubscriptions,
    shared: Arc<SessionShared>,
    running: Arc<AtomicBool>,
    market_tx: Option<Producer<MarketUpdate>>,
}

fn streams_for(symbol: &str, mode: StreamMode) -> Vec<String> {
    match mode {
        StreamMode::Ltp => vec![format!("{symbol}@trade")],
        StreamMode::Quote => vec![format!("{symbol}@bookTicker")],
        StreamMode::Full => vec![
            format!("{symbol}@depth5@100ms"),
            format!("{symbol}@trade"),
        ],
    }
}

impl BinanceAdapter {
    pub fn builder() -> BinanceAdapterBuilder {
        BinanceAdapterBuilder {
            stream_url: String::new(),
            market_tx: None,
        }
    }

    fn replay_messages(subscriptions: &HashMap<String, StreamMode>) -> Vec<String> {
        let params: Vec<String> = subscriptions
            .iter()
            .flat_map(|(symbol, mode)| streams_for(symbol, *mode))
            .collect();
        if params.is_empty() {
            return Vec::new();
        }
        vec![serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        })
        .to_string()]
    }

    fn send_method(&self, method: &str, params: Vec<String>) {
        let shared = self.shared.clone();
        let message = serde_json::json!({
            "method": method,
            "params": params,
            "id": 2,
        })
        .to_string();
        tokio::spawn(async move {
            if !shared.send_text(message).await {
                debug!("control message deferred to subscription replay");
            }
        });
    }
}

impl Connector for BinanceAdapter {
    fn start(&mut self) -> Result<(), ConnectorError> {
        let market_tx = self.market_tx.take().ok_or(ConnectorError::AlreadyRunning)?;
        self.running.store(true, Ordering::Release);

        let (frame_tx, frame_rx) = Spsc::with_capacity::<FeedInput>(FEED_RING_CAPACITY);

        let config = SessionConfig {
            venue: "binance",
            url: self.url.clone(),
            subscriptions: self.subscriptions.clone(),
            replay: Box::new(Self::replay_messages),
            text_frames: TextFrames::Forward,
        };
        tokio::spawn(session::run_session(
            config,
            self.shared.clone(),
            frame_tx,
            self.running.clone(),
        ));

        let instruments = self.instruments.clone();
        let running = self.running.clone();
        thread::Builder::new()
            .name("binance-feed".to_string())
            .spawn(move || run_feed_worker(frame_rx, market_tx, instruments, running))
            .expect("spawning the feed worker");

        info!("binance adapter started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.close().await;
            tokio::time::sleep(session::STOP_DEADLINE).await;
        });
        info!("binance adapter stopping");
    }

    fn subscribe(
        &mut self,
        instrument: &Instrument,
        mode: StreamMode,
    ) -> Result<(), ConnectorError> {
        let symbol = instrument.symbol.to_lowercase();
        {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.insert(symbol.clone(), mode) == Some(mode) {
                return Ok(());
            }
        }
        self.instruments.lock().unwrap().insert(
            symbol.clone(),
            instrument.ticker_id,
            instrument.symbol.clone(),
        );
        if self.shared.is_connected() {
            self.send_method("SUBSCRIBE", streams_for(&symbol, mode));
        }
        info!(%symbol, ticker_id = instrument.ticker_id, ?mode, "subscribed");
        Ok(())
    }

    fn unsubscribe(&mut self, ticker_id: TickerId) -> Result<(), ConnectorError> {
        let symbol = self
            .instruments
            .lock()
            .unwrap()
            .remove(ticker_id)
            .ok_or(ConnectorError::UnknownTicker(ticker_id))?;
        let mode = self.subscriptions.lock().unwrap().remove(&symbol);
        if let Some(mode) = mode {
            if self.shared.is_connected() {
                self.send_method("UNSUBSCRIBE", streams_for(&symbol, mode));
            }
        }
        info!(%symbol, ticker_id, "unsubscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

fn push_update(market_tx: &mut Producer<MarketUpdate>, update: MarketUpdate) {
    if !market_tx.push(update) {
        warn!(
            dropped = market_tx.dropped(),
            "market ring full; update dropped"
        );
    }
}

fn run_feed_worker(
    mut frame_rx: Consumer<FeedInput>,
    mut market_tx: Producer<MarketUpdate>,
    instruments: SharedInstruments,
    running: Arc<AtomicBool>,
) {
    let mut books: HashMap<TickerId, BookSynthesizer> = HashMap::new();

    while running.load(Ordering::Acquire) {
        let Some(input) = frame_rx.pop() else {
            thread::sleep(std::time::Duration::from_micros(10));
            continue;
        };
        match input {
            FeedInput::Reconnect => {
                let local_ts = now_ns();
                for book in books.values_mut() {
                    for event in book.clear(local_ts) {
                        push_update(&mut market_tx, event);
                    }
                }
                info!("books cleared on reconnect");
            }
            FeedInput::Frame(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<msg::StreamMessage>(&bytes) {
                    Ok(msg::StreamMessage::Envelope { stream, data }) => {
                        let Some((symbol, channel)) = stream.split_once('@') else {
                            warn!(%stream, "malformed stream name");
                            continue;
                        };
                        let ticker_id = {
                            let instruments = instruments.lock().unwrap();
                            instruments.ticker_for(&symbol.to_string())
                        };
                        let Some(ticker_id) = ticker_id else {
                            trace!(%symbol, "message for unmapped symbol");
                            continue;
                        };
                        handle_stream(ticker_id, channel, data, &mut books, &mut market_tx);
                    }
                    Ok(msg::StreamMessage::Ack { id, .. }) => {
                        debug!(id, "subscription ack");
                    }
                    Err(error) => {
                        warn!(?error, "unparseable stream message");
                    }
                }
            }
        }
    }
    debug!("feed worker exited");
}

fn handle_stream(
    ticker_id: TickerId,
    channel: &str,
    data: serde_json::Value,
    books: &mut HashMap<TickerId, BookSynthesizer>,
    market_tx: &mut Producer<MarketUpdate>,
) {
    let local_ts = now_ns();
    if channel.starts_with("depth") {
        let depth: msg::DepthSnapshotMsg = match serde_json::from_value(data) {
            Ok(depth) => depth,
            Err(error) => {
                warn!(?error, "unparseable depth snapshot");
                return;
            }
        };
        let snapshot = DepthSnapshot {
            bids: parse_levels(&depth.bids),
            asks: parse_levels(&depth.asks),
            last_price: 0,
            last_qty: 0,
        };
        let book = books
            .entry(ticker_id)
            .or_insert_with(|| BookSynthesizer::new(ticker_id));
        for event in book.apply_snapshot(&snapshot, local_ts) {
            push_update(market_tx, event);
        }
    } else if channel.starts_with("bookTicker") {
        let bbo: msg::BookTickerMsg = match serde_json::from_value(data) {
            Ok(bbo) => bbo,
            Err(error) => {
                warn!(?error, "unparseable bookTicker");
                return;
            }
        };
        let snapshot = DepthSnapshot {
            bids: vec![LevelSnapshot {
                price: price_to_ticks(bbo.bid_price),
                qty: qty_to_lots(bbo.bid_qty),
                orders: 1,
            }],
            asks: vec![LevelSnapshot {
                price: price_to_ticks(bbo.ask_price),
                qty: qty_to_lots(bbo.ask_qty),
                orders: 1,
            }],
            last_price: 0,
            last_qty: 0,
        };
        let book = books
            .entry(ticker_id)
            .or_insert_with(|| BookSynthesizer::new(ticker_id));
        for event in book.apply_snapshot(&snapshot, local_ts) {
            push_update(market_tx, event);
        }
    } else if channel.starts_with("trade") {
        let trade: msg::TradeMsg = match serde_json::from_value(data) {
            Ok(trade) => trade,
            Err(error) => {
                warn!(?error, "unparseable trade");
                return;
            }
        };
        push_update(
            market_tx,
            MarketUpdate {
                kind: MarketUpdateKind::Trade,
                ticker_id,
                order_id: 0,
                side: Some(if trade.is_buyer_maker {
                    Side::Sell
                } else {
                    Side::Buy
                }),
                price: price_to_ticks(trade.price),
                qty: qty_to_lots(trade.qty),
                priority: 0,
                local_ts,
            },
        );
    } else {
        trace!(%channel, "channel ignored");
    }
}

fn parse_levels(levels: &[(String, String)]) -> Vec<LevelSnapshot> {
    levels
        .iter()
        .filter_map(|(price, qty)| {
            let price: f64 = price.parse().ok()?;
            let qty: f64 = qty.parse().ok()?;
            Some(LevelSnapshot {
                price: price_to_ticks(price),
                qty: qty_to_lots(qty),
                orders: 1,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_builds_one_subscribe() {
        let mut subscriptions = HashMap::new();
        subscriptions.insert("btcusdt".to_string(), StreamMode::Full);
        let messages = BinanceAdapter::replay_messages(&subscriptions);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("SUBSCRIBE"));
        assert!(messages[0].contains("btcusdt@depth5@100ms"));
        assert!(messages[0].contains("btcusdt@trade"));
    }

    #[test]
    fn depth_stream_synthesizes_adds() {
        let (mut market_tx, mut market_rx) = Spsc::with_capacity(64);
        let mut books = HashMap::new();
        let data = serde_json::json!({
            "lastUpdateId": 1,
            "bids": [["43250.10", "0.5"]],
            "asks": [["43251.00", "0.7"]],
        });
        handle_stream(3, "depth5@100ms", data, &mut books, &mut market_tx);

        let mut adds = 0;
        while let Some(update) = market_rx.pop() {
            if update.kind == MarketUpdateKind::Add {
                adds += 1;
                if update.side == Some(Side::Buy) {
                    assert_eq!(update.price, 4_325_010);
                    assert_eq!(update.qty, 5_000);
                }
            }
        }
        assert_eq!(adds, 2);
    }

    #[test]
    fn trade_stream_maps_aggressor() {
        let (mut market_tx, mut market_rx) = Spsc::with_capacity(16);
        let mut books = HashMap::new();
        let data = serde_json::json!({
            "p": "43250.10",
            "q": "0.005",
            "T": 1_700_000_000_000i64,
            "m": true,
        });
        handle_stream(3, "trade", data, &mut books, &mut market_tx);
        let update = market_rx.pop().unwrap();
        assert_eq!(update.kind, MarketUpdateKind::Trade);
        assert_eq!(update.side, Some(Side::Sell));
        assert_eq!(update.price, 4_325_010);
        assert_eq!(update.qty, 50);
    }
}
