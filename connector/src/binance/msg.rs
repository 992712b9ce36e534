//! Crypto venue stream and REST message shapes. The feed is venue-native
//! JSON; numeric fields arrive as strings and are parsed with the shared
//! serde visitors.

use serde::Deserialize;

use crate::utils::from_str_to_f64;

/// Everything the combined stream endpoint sends: either a wrapped stream
/// payload or an ack for a SUBSCRIBE/UNSUBSCRIBE request.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Envelope {
        stream: String,
        data: serde_json::Value,
    },
    Ack {
        #[serde(default)]
        result: Option<serde_json::Value>,
        id: u64,
    },
}

/// Partial-book depth snapshot (`<symbol>@depth5@100ms`).
#[derive(Debug, Deserialize)]
pub struct DepthSnapshotMsg {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<(String, String)>,
    pub asks: Vec<(String, String)>,
}

/// Best bid/offer stream (`<symbol>@bookTicker`).
#[derive(Debug, Deserialize)]
pub struct BookTickerMsg {
    #[serde(rename = "b", deserialize_with = "from_str_to_f64")]
    pub bid_price: f64,
    #[serde(rename = "B", deserialize_with = "from_str_to_f64")]
    pub bid_qty: f64,
    #[serde(rename = "a", deserialize_with = "from_str_to_f64")]
    pub ask_price: f64,
    #[serde(rename = "A", deserialize_with = "from_str_to_f64")]
    pub ask_qty: f64,
}

/// Trade stream (`<symbol>@trade`).
#[derive(Debug, Deserialize)]
pub struct TradeMsg {
    #[serde(rename = "p", deserialize_with = "from_str_to_f64")]
    pub price: f64,
    #[serde(rename = "q", deserialize_with = "from_str_to_f64")]
    pub qty: f64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// True when the buyer is the resting maker, i.e. the aggressor sold.
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// REST order placement/cancel/query response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub status: String,
    #[serde(default, deserialize_with = "from_str_to_f64")]
    pub executed_qty: f64,
    #[serde(default, deserialize_with = "from_str_to_f64")]
    pub orig_qty: f64,
    #[serde(default, deserialize_with = "from_str_to_f64")]
    pub price: f64,
}

/// REST error body.
#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}
