//! Core runtime for the live trading system: the canonical market/order event
//! model, the lock-free single-producer/single-consumer rings that carry it
//! between tasks, the downstream market order book, and the trade-engine loop
//! with its order manager and pre-trade risk gate.
//!
//! Venue adapters and the order gateway live in the `connector` binary crate;
//! everything they exchange with the engine flows through the types and
//! queues defined here.

pub mod algo;
pub mod config;
pub mod depth;
pub mod engine;
pub mod feature;
pub mod oms;
pub mod position;
pub mod queue;
pub mod risk;
pub mod types;

pub mod prelude {
    pub use crate::{
        algo::{Algorithm, AlgoType},
        config::{Config, ConfigError},
        depth::MarketOrderBook,
        engine::TradeEngine,
        feature::FeatureEngine,
        oms::OrderManager,
        position::PositionKeeper,
        queue::{Consumer, Producer, Spsc},
        risk::{RiskCheck, RiskManager},
        types::*,
    };
}
