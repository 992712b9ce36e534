//! The adapter capability surface. The trade engine and the entry point only
//! ever see this trait; venue types never leak upward.

use std::hash::Hash;

use hashbrown::HashMap;
use thiserror::Error;
use tradecore::types::{StreamMode, TickerId};

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("BuilderIncomplete: {0}")]
    BuilderIncomplete(&'static str),
    #[error("UnknownSymbol: {0}")]
    UnknownSymbol(String),
    #[error("UnknownTicker: {0}")]
    UnknownTicker(TickerId),
    #[error("NotRunning")]
    NotRunning,
    #[error("AlreadyRunning")]
    AlreadyRunning,
}

/// An instrument as the entry point sees it: the human symbol, the venue's
/// listing exchange segment, and the dense internal handle assigned to it at
/// subscription time.
#[derive(Clone, Debug)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: String,
    pub ticker_id: TickerId,
}

/// Provides a uniform interface for a venue adapter: session lifecycle plus
/// subscription management. Market data flows out through the market-update
/// ring the adapter was constructed with, never through return values.
pub trait Connector {
    /// Establishes the session and begins streaming. Non-blocking; transport
    /// failures are handled internally via reconnect with backoff.
    fn start(&mut self) -> Result<(), ConnectorError>;

    /// Flips the running flag and shuts the socket. The I/O task gets a
    /// bounded teardown deadline, after which it is abandoned.
    fn stop(&mut self);

    /// Adds `instrument` to the persistent subscription set under `mode`.
    /// Subscribing an already-subscribed instrument is a no-op.
    fn subscribe(&mut self, instrument: &Instrument, mode: StreamMode)
        -> Result<(), ConnectorError>;

    /// Removes the instrument from the subscription set.
    fn unsubscribe(&mut self, ticker_id: TickerId) -> Result<(), ConnectorError>;

    fn is_connected(&self) -> bool;
}

/// The venue-token ↔ ticker bijection plus the ticker → symbol map, shared
/// between an adapter (subscribe/unsubscribe) and its decode worker. The
/// guarding mutex lives in the adapter; critical sections stay free of I/O.
#[derive(Debug)]
pub struct InstrumentMap<K> {
    by_venue: HashMap<K, TickerId>,
    by_ticker: HashMap<TickerId, K>,
    symbols: HashMap<TickerId, String>,
}

impl<K: Eq + Hash + Clone> InstrumentMap<K> {
    pub fn new() -> Self {
        Self {
            by_venue: HashMap::new(),
            by_ticker: HashMap::new(),
            symbols: HashMap::new(),
        }
    }

    pub fn insert(&mut self, venue_token: K, ticker_id: TickerId, symbol: String) {
        self.by_venue.insert(venue_token.clone(), ticker_id);
        self.by_ticker.insert(ticker_id, venue_token);
        self.symbols.insert(ticker_id, symbol);
    }

    pub fn remove(&mut self, ticker_id: TickerId) -> Option<K> {
        let venue_token = self.by_ticker.remove(&ticker_id)?;
        self.by_venue.remove(&venue_token);
        self.symbols.remove(&ticker_id);
        Some(venue_token)
    }

    pub fn ticker_for(&self, venue_token: &K) -> Option<TickerId> {
        self.by_venue.get(venue_token).copied()
    }

    pub fn symbol_for(&self, ticker_id: TickerId) -> Option<&str> {
        self.symbols.get(&ticker_id).map(String::as_str)
    }
}

impl<K: Eq + Hash + Clone> Default for InstrumentMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Input to a session's decode/synthesize worker: a raw wire frame, or the
/// reconnect marker that clears the books before the feed rebuilds them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FeedInput {
    Frame(Vec<u8>),
    Reconnect,
}

impl Default for FeedInput {
    fn default() -> Self {
        FeedInput::Frame(Vec::new())
    }
}
