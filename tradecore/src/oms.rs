//! Order manager: owns the per-ticker working orders on each side, issues
//! New/Cancel requests into the gateway queue under the risk gate, and
//! advances order state from gateway responses.

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::{
    position::PositionKeeper,
    queue::Producer,
    risk::RiskManager,
    types::{
        ClientId, ClientRequest, ClientRequestKind, ClientResponse, ClientResponseKind, OrderId,
        Price, Qty, RejectReason, Side, TickerId, PRICE_INVALID,
    },
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OmOrderState {
    #[default]
    Invalid,
    PendingNew,
    Live,
    PendingCancel,
    Dead,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OmOrder {
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub qty: Qty,
    pub state: OmOrderState,
}

impl OmOrder {
    fn is_working(&self) -> bool {
        matches!(
            self.state,
            OmOrderState::PendingNew | OmOrderState::Live | OmOrderState::PendingCancel
        )
    }
}

/// One working order per (ticker, side); the strategies this runtime carries
/// never layer multiple orders on a side.
pub struct OrderManager {
    client_id: ClientId,
    orders: HashMap<TickerId, [OmOrder; 2]>,
    request_tx: Producer<ClientRequest>,
    next_order_id: OrderId,
    // Risk rejections synthesized locally; the engine drains these into the
    // algorithm's order-update callback.
    risk_rejects: Vec<ClientResponse>,
}

fn side_index(side: Side) -> usize {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}

impl OrderManager {
    pub fn new(client_id: ClientId, request_tx: Producer<ClientRequest>) -> Self {
        Self {
            client_id,
            orders: HashMap::new(),
            request_tx,
            next_order_id: 1,
            risk_rejects: Vec::new(),
        }
    }

    pub fn order(&self, ticker_id: TickerId, side: Side) -> Option<&OmOrder> {
        self.orders.get(&ticker_id).map(|pair| &pair[side_index(side)])
    }

    /// Quotes both sides toward the given prices at `clip` quantity. A side
    /// with `PRICE_INVALID` is pulled instead.
    pub fn move_orders(
        &mut self,
        risk: &RiskManager,
        positions: &PositionKeeper,
        ticker_id: TickerId,
        bid_price: Price,
        ask_price: Price,
        clip: Qty,
    ) {
        self.move_order(risk, positions, ticker_id, Side::Buy, bid_price, clip);
        self.move_order(risk, positions, ticker_id, Side::Sell, ask_price, clip);
    }

    pub fn move_order(
        &mut self,
        risk: &RiskManager,
        positions: &PositionKeeper,
        ticker_id: TickerId,
        side: Side,
        price: Price,
        qty: Qty,
    ) {
        let order = self.orders.entry(ticker_id).or_default()[side_index(side)];
        if order.is_working() {
            if order.state == OmOrderState::Live && price != PRICE_INVALID && order.price != price
            {
                self.cancel_order(ticker_id, side);
            } else if price == PRICE_INVALID && order.state == OmOrderState::Live {
                self.cancel_order(ticker_id, side);
            }
            return;
        }
        if price == PRICE_INVALID {
            return;
        }
        if !risk.allows(positions, ticker_id, side, price, qty) {
            self.risk_rejects.push(ClientResponse {
                kind: ClientResponseKind::Rejected,
                reject_reason: RejectReason::RiskReject,
                client_id: self.client_id,
                ticker_id,
                order_id: self.next_order_id,
                side,
                price,
                exec_qty: 0,
                leaves_qty: qty,
            });
            return;
        }
        self.new_order(ticker_id, side, price, qty);
    }

    fn new_order(&mut self, ticker_id: TickerId, side: Side, price: Price, qty: Qty) {
        let order_id = self.next_order_id;
        self.next_order_id += 1;

        let request = ClientRequest {
            kind: ClientRequestKind::New,
            client_id: self.client_id,
            ticker_id,
            order_id,
            side,
            price,
            qty,
        };
        if !self.request_tx.push(request) {
            warn!(ticker_id, order_id, "request ring full; new order dropped");
            return;
        }
        self.orders.entry(ticker_id).or_default()[side_index(side)] = OmOrder {
            order_id,
            side,
            price,
            qty,
            state: OmOrderState::PendingNew,
        };
        debug!(ticker_id, order_id, ?side, price, qty, "new order sent");
    }

    fn cancel_order(&mut self, ticker_id: TickerId, side: Side) {
        let Some(pair) = self.orders.get_mut(&ticker_id) else {
            return;
        };
        let order = &mut pair[side_index(side)];
        if order.state != OmOrderState::Live {
            return;
        }
        let request = ClientRequest {
            kind: ClientRequestKind::Cancel,
            client_id: self.client_id,
            ticker_id,
            order_id: order.order_id,
            side,
            price: order.price,
            qty: order.qty,
        };
        let order_id = order.order_id;
        if self.request_tx.push(request) {
            self.orders.get_mut(&ticker_id).unwrap()[side_index(side)].state =
                OmOrderState::PendingCancel;
            debug!(ticker_id, order_id, ?side, "cancel sent");
        } else {
            warn!(ticker_id, order_id, "request ring full; cancel dropped");
        }
    }

    /// Routes a gateway response to the order it belongs to.
    pub fn on_response(&mut self, response: &ClientResponse) {
        let Some(pair) = self.orders.get_mut(&response.ticker_id) else {
            return;
        };
        let order = &mut pair[side_index(response.side)];
        if order.order_id != response.order_id {
            // Response for an already-replaced order; terminal ones are stale.
            return;
        }
        match response.kind {
            ClientResponseKind::Accepted => order.state = OmOrderState::Live,
            ClientResponseKind::PartiallyFilled => {
                order.qty = response.leaves_qty;
            }
            ClientResponseKind::Filled
            | ClientResponseKind::Canceled
            | ClientResponseKind::Rejected => {
                order.state = OmOrderState::Dead;
            }
            ClientResponseKind::CancelRejected => {
                // The cancel raced a fill; the terminal response follows.
                order.state = OmOrderState::Live;
            }
            ClientResponseKind::Invalid => {}
        }
    }

    /// Drains locally synthesized RISK_REJECT responses.
    pub fn take_risk_rejects(&mut self) -> Vec<ClientResponse> {
        std::mem::take(&mut self.risk_rejects)
    }

    pub fn dropped_requests(&self) -> u64 {
        self.request_tx.dropped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{Consumer, Spsc},
        risk::TickerRiskLimits,
    };

    fn setup() -> (OrderManager, Consumer<ClientRequest>, RiskManager, PositionKeeper) {
        let (tx, rx) = Spsc::with_capacity(64);
        let om = OrderManager::new(11, tx);
        let mut risk = RiskManager::new(1e9, 1e9);
        risk.set_limits(
            7,
            TickerRiskLimits {
                max_order_size: 0,
                max_position: 100,
                max_loss: 1e9,
            },
        );
        (om, rx, risk, PositionKeeper::new())
    }

    #[test]
    fn quotes_both_sides() {
        let (mut om, mut rx, risk, positions) = setup();
        om.move_orders(&risk, &positions, 7, 9990, 10010, 5);

        let bid = rx.pop().unwrap();
        assert_eq!(bid.kind, ClientRequestKind::New);
        assert_eq!(bid.side, Side::Buy);
        assert_eq!(bid.price, 9990);
        let ask = rx.pop().unwrap();
        assert_eq!(ask.side, Side::Sell);
        assert_eq!(ask.price, 10010);
        assert!(rx.pop().is_none());

        assert_eq!(om.order(7, Side::Buy).unwrap().state, OmOrderState::PendingNew);
    }

    #[test]
    fn price_move_cancels_live_order() {
        let (mut om, mut rx, risk, positions) = setup();
        om.move_order(&risk, &positions, 7, Side::Buy, 9990, 5);
        let sent = rx.pop().unwrap();
        om.on_response(&ClientResponse {
            kind: ClientResponseKind::Accepted,
            ticker_id: 7,
            order_id: sent.order_id,
            side: Side::Buy,
            ..Default::default()
        });
        assert_eq!(om.order(7, Side::Buy).unwrap().state, OmOrderState::Live);

        om.move_order(&risk, &positions, 7, Side::Buy, 9995, 5);
        let cancel = rx.pop().unwrap();
        assert_eq!(cancel.kind, ClientRequestKind::Cancel);
        assert_eq!(cancel.order_id, sent.order_id);
        assert_eq!(
            om.order(7, Side::Buy).unwrap().state,
            OmOrderState::PendingCancel
        );
    }

    #[test]
    fn risk_violation_synthesizes_reject() {
        let (mut om, mut rx, risk, positions) = setup();
        om.move_order(&risk, &positions, 7, Side::Buy, 9990, 500);
        assert!(rx.pop().is_none());
        let rejects = om.take_risk_rejects();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].kind, ClientResponseKind::Rejected);
        assert_eq!(rejects[0].reject_reason, RejectReason::RiskReject);
        assert!(om.take_risk_rejects().is_empty());
    }

    #[test]
    fn dead_order_allows_requote() {
        let (mut om, mut rx, risk, positions) = setup();
        om.move_order(&risk, &positions, 7, Side::Buy, 9990, 5);
        let first = rx.pop().unwrap();
        om.on_response(&ClientResponse {
            kind: ClientResponseKind::Filled,
            ticker_id: 7,
            order_id: first.order_id,
            side: Side::Buy,
            exec_qty: 5,
            ..Default::default()
        });
        om.move_order(&risk, &positions, 7, Side::Buy, 9990, 5);
        let second = rx.pop().unwrap();
        assert_ne!(second.order_id, first.order_id);
    }
}
