//! Equity/derivatives venue adapter: authenticated WebSocket session, binary
//! frame decoding, and order book synthesis from FULL-mode depth snapshots.

pub mod msg;
pub mod rest;
pub mod wire;

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
    types::{MarketUpdate, MarketUpdateKind, Price, Qty, StreamMode, TickerId},
};

use crate::{
    connector::{Connector, ConnectorError, FeedInput, Instrument, InstrumentMap},
    session::{self, SessionConfig, SessionShared, TextFrames},
    synth::{BookSynthesizer, DepthSnapshot, LevelSnapshot},
    zerodha::{
        msg::{ControlMessage, Postback},
        wire::TickPacket,
    },
};

#[derive(Error, Debug)]
pub enum ZerodhaError {
    #[error("ReqError: {0:?}")]
    Req(#[from] reqwest::Error),
    #[error("Tungstenite: {0:?}")]
    Tungstenite(#[from] tungstenite::Error),
    #[error("Api: {status} - {message}")]
    Api { status: String, message: String },
}

const FEED_RING_CAPACITY: usize = 8192;

type SharedInstruments = Arc<Mutex<InstrumentMap<u32>>>;
type SharedSubscriptions = Arc<Mutex<HashMap<u32, StreamMode>>>;

/// [`ZerodhaAdapter`] builder.
pub struct ZerodhaAdapterBuilder {
    ws_url: String,
    api_key: String,
    access_token: String,
    tokens: HashMap<String, u32>,
    market_tx: Option<Producer<MarketUpdate>>,
}

impl ZerodhaAdapterBuilder {
    pub fn ws_url<E: Into<String>>(self, url: E) -> Self {
        Self {
            ws_url: url.into(),
            ..self
        }
    }

    pub fn api_key(self, api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            ..self
        }
    }

    pub fn access_token(self, access_token: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            ..self
        }
    }

    /// Symbol → instrument-token map, usually loaded from the instrument
    /// cache.
    pub fn tokens(self, tokens: HashMap<String, u32>) -> Self {
        Self { tokens, ..self }
    }

    /// The market-update ring this adapter feeds; the adapter's decode
    /// worker is its sole producer.
    pub fn market_tx(self, market_tx: Producer<MarketUpdate>) -> Self {
        Self {
            market_tx: Some(market_tx),
            ..self
        }
    }

    pub fn build(self) -> Result<ZerodhaAdapter, ConnectorError> {
        if self.ws_url.is_empty() {
            return Err(ConnectorError::BuilderIncomplete("ws_url"));
        }
        if self.api_key.is_empty() {
            return Err(ConnectorError::BuilderIncomplete("api_key"));
        }
        if self.access_token.is_empty() {
            return Err(ConnectorError::BuilderIncomplete("access_token"));
        }
        let market_tx = self
            .market_tx
            .ok_or(ConnectorError::BuilderIncomplete("market_tx"))?;

        Ok(ZerodhaAdapter {
            url: format!(
                "{}?api_key={}&access_token={}",
                self.ws_url, self.api_key, self.access_token
            ),
            tokens: self.tokens,
            instruments: Arc::new(Mutex::new(InstrumentMap::new())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shared: SessionShared::new(),
            running: Arc::new(AtomicBool::new(false)),
            market_tx: Some(market_tx),
        })
    }
}

pub struct ZerodhaAdapter {
    url: String,
    tokens: HashMap<String, u32>,
    instruments: SharedInstruments,
    subscriptions: SharedSubscriptions,
    shared: Arc<SessionShared>,
    running: Arc<AtomicBool>,
    market_tx: Option<Producer<MarketUpdate>>,
}

impl ZerodhaAdapter {
    pub fn builder() -> ZerodhaAdapterBuilder {
        ZerodhaAdapterBuilder {
            ws_url: String::new(),
            api_key: String::new(),
            access_token: String::new(),
            tokens: HashMap::new(),
            market_tx: None,
        }
    }

    fn send_control(&self, message: ControlMessage) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let text = serde_json::to_string(&message).unwrap();
            if !shared.send_text(text).await {
                debug!("control message deferred to subscription replay");
            }
        });
    }

    /// Builds the grouped replay messages: one subscribe for the whole set,
    /// then a mode message per streaming mode.
    fn replay_messages(subscriptions: &HashMap<u32, StreamMode>) -> Vec<String> {
        let tokens: Vec<u32> = subscriptions.keys().copied().collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        let mut messages = vec![serde_json::to_string(&ControlMessage::subscribe(&tokens)).unwrap()];
        for mode in [StreamMode::Ltp, StreamMode::Quote, StreamMode::Full] {
            let group: Vec<u32> = subscriptions
                .iter()
                .filter(|(_, m)| **m == mode)
                .map(|(token, _)| *token)
                .collect();
            if !group.is_empty() {
                messages.push(
                    serde_json::to_string(&ControlMessage::mode(mode.as_str(), &group)).unwrap(),
                );
            }
        }
        messages
    }
}

impl Connector for ZerodhaAdapter {
    fn start(&mut self) -> Result<(), ConnectorError> {
        let market_tx = self.market_tx.take().ok_or(ConnectorError::AlreadyRunning)?;
        self.running.store(true, Ordering::Release);

        let (frame_tx, frame_rx) = Spsc::with_capacity::<FeedInput>(FEED_RING_CAPACITY);

        let config = SessionConfig {
            venue: "zerodha",
            url: self.url.clone(),
            subscriptions: self.subscriptions.clone(),
            replay: Box::new(Self::replay_messages),
            text_frames: TextFrames::Inspect(Box::new(|text| {
                match serde_json::from_str::<Postback>(text) {
                    Ok(postback) if postback.kind == "error" => {
                        warn!(data = %postback.data, "venue error postback");
                    }
                    Ok(postback) => {
                        debug!(kind = %postback.kind, "venue postback");
                    }
                    Err(error) => {
                        warn!(?error, %text, "unparseable text frame");
                    }
                }
            })),
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
            .name("zerodha-feed".to_string())
            .spawn(move || run_feed_worker(frame_rx, market_tx, instruments, running))
            .expect("spawning the feed worker");

        info!("zerodha adapter started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.close().await;
            tokio::time::sleep(session::STOP_DEADLINE).await;
            // Whatever has not wound down by now is abandoned.
        });
        info!("zerodha adapter stopping");
    }

    fn subscribe(
        &mut self,
        instrument: &Instrument,
        mode: StreamMode,
    ) -> Result<(), ConnectorError> {
        let token = *self
            .tokens
            .get(&instrument.symbol)
            .ok_or_else(|| ConnectorError::UnknownSymbol(instrument.symbol.clone()))?;

        {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.insert(token, mode) == Some(mode) {
                // Subscribing twice is observationally a no-op.
                return Ok(());
            }
        }
        self.instruments.lock().unwrap().insert(
            token,
            instrument.ticker_id,
            instrument.symbol.clone(),
        );

        if self.shared.is_connected() {
            self.send_control(ControlMessage::subscribe(&[token]));
            self.send_control(ControlMessage::mode(mode.as_str(), &[token]));
        }
        info!(
            symbol = %instrument.symbol,
            ticker_id = instrument.ticker_id,
            token,
            ?mode,
            "subscribed"
        );
        Ok(())
    }

    fn unsubscribe(&mut self, ticker_id: TickerId) -> Result<(), ConnectorError> {
        let (symbol, token) = {
            let mut instruments = self.instruments.lock().unwrap();
            let symbol = instruments.symbol_for(ticker_id).map(str::to_string);
            let token = instruments
                .remove(ticker_id)
                .ok_or(ConnectorError::UnknownTicker(ticker_id))?;
            (symbol.unwrap_or_default(), token)
        };
        self.subscriptions.lock().unwrap().remove(&token);
        if self.shared.is_connected() {
            self.send_control(ControlMessage::unsubscribe(&[token]));
        }
        info!(%symbol, ticker_id, token, "unsubscribed");
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

/// The decode/synthesize worker: pops raw frames off the feed ring, decodes
/// them, diffs FULL snapshots into canonical events, and publishes them into
/// the market-update ring. Strictly CPU-bound between ring operations.
fn run_feed_worker(
    mut frame_rx: Consumer<FeedInput>,
    mut market_tx: Producer<MarketUpdate>,
    instruments: SharedInstruments,
    running: Arc<AtomicBool>,
) {
    let mut books: HashMap<TickerId, BookSynthesizer> = HashMap::new();
    let mut last_trades: HashMap<TickerId, (Price, Qty)> = HashMap::new();

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
                last_trades.clear();
                info!("books cleared on reconnect");
            }
            FeedInput::Frame(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                let (packets, error) = wire::decode_frame(&bytes);
                if let Some(error) = error {
                    warn!(?error, frame_len = bytes.len(), "truncated frame");
                }
                let local_ts = now_ns();
                for packet in packets {
                    let ticker_id = {
                        let instruments = instruments.lock().unwrap();
                        instruments.ticker_for(&packet.token())
                    };
                    let Some(ticker_id) = ticker_id else {
                        trace!(token = packet.token(), "packet for unmapped token");
                        continue;
                    };
                    handle_packet(
                        ticker_id,
                        &packet,
                        local_ts,
                        &mut books,
                        &mut last_trades,
                        &mut market_tx,
                    );
                }
            }
        }
    }
    debug!("feed worker exited");
}

fn handle_packet(
    ticker_id: TickerId,
    packet: &TickPacket,
    local_ts: i64,
    books: &mut HashMap<TickerId, BookSynthesizer>,
    last_trades: &mut HashMap<TickerId, (Price, Qty)>,
    market_tx: &mut Producer<MarketUpdate>,
) {
    match packet {
        TickPacket::Full {
            quote, bids, asks, ..
        } => {
            let snapshot = DepthSnapshot {
                bids: bids
                    .iter()
                    .map(|entry| LevelSnapshot {
                        price: entry.price,
                        qty: entry.qty,
                        orders: entry.orders as u32,
                    })
                    .collect(),
                asks: asks
                    .iter()
                    .map(|entry| LevelSnapshot {
                        price: entry.price,
                        qty: entry.qty,
                        orders: entry.orders as u32,
                    })
                    .collect(),
                last_price: quote.last_price,
                last_qty: quote.last_qty,
            };
            let book = books
                .entry(ticker_id)
                .or_insert_with(|| BookSynthesizer::new(ticker_id));
            for event in book.apply_snapshot(&snapshot, local_ts) {
                push_update(market_tx, event);
            }
        }
        TickPacket::Quote { quote, .. } => {
            // No depth in this mode; surface last-trade changes only. The
            // aggressor cannot be inferred without depth.
            let last = last_trades.get(&ticker_id).copied();
            if last != Some((quote.last_price, quote.last_qty)) && quote.last_qty > 0 {
                last_trades.insert(ticker_id, (quote.last_price, quote.last_qty));
                if last.is_some() {
                    push_update(
                        market_tx,
                        MarketUpdate {
                            kind: MarketUpdateKind::Trade,
                            ticker_id,
                            order_id: 0,
                            side: None,
                            price: quote.last_price,
                            qty: quote.last_qty,
                            priority: 0,
                            local_ts,
                        },
                    );
                }
            }
        }
        TickPacket::Ltp { .. } | TickPacket::Index { .. } => {
            trace!(ticker_id, "ltp/index packet consumed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_groups_by_mode() {
        let mut subscriptions = HashMap::new();
        subscriptions.insert(738_561, StreamMode::Full);
        subscriptions.insert(5_633, StreamMode::Full);
        subscriptions.insert(408_065, StreamMode::Ltp);

        let messages = ZerodhaAdapter::replay_messages(&subscriptions);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains(r#""a":"subscribe""#));
        assert!(messages.iter().any(|m| m.contains(r#""ltp""#)));
        assert!(messages.iter().any(|m| m.contains(r#""full""#)));
    }

    #[test]
    fn replay_empty_set_sends_nothing() {
        assert!(ZerodhaAdapter::replay_messages(&HashMap::new()).is_empty());
    }

    #[test]
    fn subscribing_twice_is_a_no_op() {
        let (market_tx, _market_rx) = Spsc::with_capacity(16);
        let mut tokens = HashMap::new();
        tokens.insert("RELIANCE".to_string(), 738_561u32);
        let mut adapter = ZerodhaAdapter::builder()
            .ws_url("wss://ws.test/")
            .api_key("k")
            .access_token("t")
            .tokens(tokens)
            .market_tx(market_tx)
            .build()
            .unwrap();

        let instrument = Instrument {
            symbol: "RELIANCE".to_string(),
            exchange: "NSE".to_string(),
            ticker_id: 7,
        };
        adapter.subscribe(&instrument, StreamMode::Full).unwrap();
        adapter.subscribe(&instrument, StreamMode::Full).unwrap();
        assert_eq!(adapter.subscriptions.lock().unwrap().len(), 1);
        assert_eq!(
            adapter.instruments.lock().unwrap().ticker_for(&738_561),
            Some(7)
        );

        assert!(matches!(
            adapter.subscribe(
                &Instrument {
                    symbol: "UNKNOWN".to_string(),
                    exchange: "NSE".to_string(),
                    ticker_id: 8,
                },
                StreamMode::Full,
            ),
            Err(ConnectorError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn full_packet_flows_to_market_ring() {
        let (mut market_tx, mut market_rx) = Spsc::with_capacity(64);
        let mut books = HashMap::new();
        let mut last_trades = HashMap::new();

        let mut bids = [wire::DepthEntry::default(); wire::DEPTH_LEVELS];
        let mut asks = [wire::DepthEntry::default(); wire::DEPTH_LEVELS];
        bids[0] = wire::DepthEntry {
            qty: 5,
            price: 10000,
            orders: 1,
        };
        asks[0] = wire::DepthEntry {
            qty: 4,
            price: 10010,
            orders: 1,
        };
        let packet = TickPacket::Full {
            token: 738_561,
            quote: wire::QuoteFields {
                last_price: 10005,
                last_qty: 1,
                ..Default::default()
            },
            last_trade_time: 0,
            open_interest: 0,
            oi_day_high: 0,
            oi_day_low: 0,
            exchange_ts: 0,
            bids,
            asks,
        };
        handle_packet(7, &packet, 0, &mut books, &mut last_trades, &mut market_tx);

        let mut kinds = Vec::new();
        while let Some(update) = market_rx.pop() {
            assert_eq!(update.ticker_id, 7);
            kinds.push(update.kind);
        }
        assert_eq!(
            kinds,
            vec![
                MarketUpdateKind::SnapshotStart,
                MarketUpdateKind::Add,
                MarketUpdateKind::Add,
                MarketUpdateKind::SnapshotEnd,
            ]
        );
    }

    #[test]
    fn quote_packet_emits_trade_on_change() {
        let (mut market_tx, mut market_rx) = Spsc::with_capacity(64);
        let mut books = HashMap::new();
        let mut last_trades = HashMap::new();

        let quote = |price, qty| TickPacket::Quote {
            token: 5,
            quote: wire::QuoteFields {
                last_price: price,
                last_qty: qty,
                ..Default::default()
            },
        };
        // The first quote only seeds the last-trade state.
        handle_packet(3, &quote(100, 1), 0, &mut books, &mut last_trades, &mut market_tx);
        assert!(market_rx.pop().is_none());

        handle_packet(3, &quote(101, 2), 0, &mut books, &mut last_trades, &mut market_tx);
        let update = market_rx.pop().unwrap();
        assert_eq!(update.kind, MarketUpdateKind::Trade);
        assert_eq!(update.side, None);
        assert_eq!(update.price, 101);
        assert_eq!(update.qty, 2);

        // Unchanged quote emits nothing.
        handle_packet(3, &quote(101, 2), 0, &mut books, &mut last_trades, &mut market_tx);
        assert!(market_rx.pop().is_none());
    }
}
