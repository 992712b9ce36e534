//! Canonical event model shared by the venue adapters, the order gateway and
//! the trade engine. All prices and quantities are fixed-point integers in
//! the venue's minimum tick unit; sentinel values mark missing fields and
//! must never appear in events delivered downstream.

use std::fmt::{Debug, Formatter};

/// Dense internal instrument handle, assigned at subscription time.
pub type TickerId = u16;
pub type OrderId = u64;
pub type ClientId = u64;
/// Ordering of an order within a price level.
pub type Priority = u64;
/// Price in the venue's minimum tick unit (paise for the equity feed).
pub type Price = i64;
pub type Qty = i64;

pub const TICKER_ID_INVALID: TickerId = TickerId::MAX;
pub const ORDER_ID_INVALID: OrderId = OrderId::MAX;
pub const CLIENT_ID_INVALID: ClientId = ClientId::MAX;
pub const PRICE_INVALID: Price = Price::MAX;
pub const QTY_INVALID: Qty = Qty::MAX;
pub const PRIORITY_INVALID: Priority = Priority::MAX;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Side {
    #[default]
    Buy,
    Sell,
}

impl Side {
    /// +1 for a buy, -1 for a sell; used by the position keeper.
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn flip(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MarketUpdateKind {
    #[default]
    Invalid,
    Add,
    Modify,
    Cancel,
    Trade,
    Clear,
    SnapshotStart,
    SnapshotEnd,
}

/// A normalized market-data event emitted into the market-update queue.
///
/// `Clear` carries no order id. `Trade` carries a side only when the
/// aggressor could be inferred from the feed.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct MarketUpdate {
    pub kind: MarketUpdateKind,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Option<Side>,
    pub price: Price,
    pub qty: Qty,
    pub priority: Priority,
    /// Host clock at decode time, nanoseconds.
    pub local_ts: i64,
}

impl MarketUpdate {
    pub fn invalid() -> Self {
        Self {
            kind: MarketUpdateKind::Invalid,
            ticker_id: TICKER_ID_INVALID,
            order_id: ORDER_ID_INVALID,
            side: None,
            price: PRICE_INVALID,
            qty: QTY_INVALID,
            priority: PRIORITY_INVALID,
            local_ts: 0,
        }
    }
}

impl Debug for MarketUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketUpdate")
            .field("kind", &self.kind)
            .field("ticker_id", &self.ticker_id)
            .field("order_id", &self.order_id)
            .field("side", &self.side)
            .field("price", &self.price)
            .field("qty", &self.qty)
            .field("priority", &self.priority)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClientRequestKind {
    #[default]
    Invalid,
    New,
    Cancel,
}

/// An order request from the strategy to the gateway. A `New` with
/// `price == 0` is a market order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClientRequest {
    pub kind: ClientRequestKind,
    pub client_id: ClientId,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClientResponseKind {
    #[default]
    Invalid,
    Accepted,
    Rejected,
    Canceled,
    Filled,
    PartiallyFilled,
    CancelRejected,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RejectReason {
    #[default]
    None,
    InvalidQuantity,
    InvalidPrice,
    InvalidTicker,
    InvalidOrderId,
    DuplicateOrderId,
    RiskReject,
}

/// An execution event from the gateway back to the strategy.
///
/// For a given `(client_id, order_id)` responses always arrive in lifecycle
/// order: `Accepted`, any `PartiallyFilled`s, then exactly one of `Filled`,
/// `Canceled` or `Rejected`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClientResponse {
    pub kind: ClientResponseKind,
    pub reject_reason: RejectReason,
    pub client_id: ClientId,
    pub ticker_id: TickerId,
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub exec_qty: Qty,
    pub leaves_qty: Qty,
}

impl ClientResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ClientResponseKind::Filled
                | ClientResponseKind::Canceled
                | ClientResponseKind::Rejected
        )
    }
}

/// Streaming detail level requested from a venue feed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum StreamMode {
    Ltp,
    Quote,
    #[default]
    Full,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Ltp => "ltp",
            StreamMode::Quote => "quote",
            StreamMode::Full => "full",
        }
    }
}
