//! Live execution: translates validated requests into venue REST calls and
//! venue order states back into lifecycle responses. Submits and cancels run
//! as spawned tasks; their outcomes and the ≤1 s status poll feed back to
//! the gateway task over an internal channel, keeping the response ring's
//! single-producer contract intact.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use tradecore::types::{
    ClientId, ClientRequest, ClientResponse, ClientResponseKind, OrderId, Price, Qty,
    RejectReason, TickerId,
};

use crate::{
    binance::{rest::BinanceClient, PRICE_SCALE},
    zerodha::rest::KiteClient,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

type OrderKey = (ClientId, OrderId);

/// The venue a live gateway trades on.
#[derive(Clone)]
pub enum LiveOrderClient {
    Kite(KiteClient),
    Binance(BinanceClient),
}

/// How the gateway addresses an instrument at the venue.
#[derive(Clone, Debug)]
pub struct LiveSymbol {
    pub symbol: String,
    pub exchange: String,
}

#[derive(Clone, Debug)]
enum VenueUpdate {
    Submitted {
        key: OrderKey,
        venue_order_id: String,
    },
    SubmitRejected {
        key: OrderKey,
        reason: String,
    },
    CancelAccepted {
        key: OrderKey,
    },
    Status {
        key: OrderKey,
        state: VenueOrderState,
        filled_qty: Qty,
        avg_price: Price,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum VenueOrderState {
    Open,
    Complete,
    Canceled,
    Rejected,
}

struct LiveOrder {
    request: ClientRequest,
    venue_order_id: Option<String>,
    accepted_sent: bool,
    filled: Qty,
    terminal: bool,
}

pub struct LiveEngine {
    client: LiveOrderClient,
    symbols: HashMap<TickerId, LiveSymbol>,
    orders: HashMap<OrderKey, LiveOrder>,
    update_tx: UnboundedSender<VenueUpdate>,
    update_rx: UnboundedReceiver<VenueUpdate>,
    last_poll: Instant,
}

impl LiveEngine {
    pub fn new(client: LiveOrderClient, symbols: HashMap<TickerId, LiveSymbol>) -> Self {
        let (update_tx, update_rx) = unbounded_channel();
        Self {
            client,
            symbols,
            orders: HashMap::new(),
            update_tx,
            update_rx,
            last_poll: Instant::now(),
        }
    }

    fn client_order_id(key: OrderKey) -> String {
        format!("tc{}x{}", key.0, key.1)
    }

    pub fn submit_new(&mut self, request: ClientRequest) {
        let key = (request.client_id, request.order_id);
        let Some(symbol) = self.symbols.get(&request.ticker_id).cloned() else {
            warn!(ticker_id = request.ticker_id, "no venue symbol registered");
            return;
        };
        self.orders.insert(
            key,
            LiveOrder {
                request,
                venue_order_id: None,
                accepted_sent: false,
                filled: 0,
                terminal: false,
            },
        );
        self.spawn_submit(key, symbol, request);
    }

    fn spawn_submit(&self, key: OrderKey, symbol: LiveSymbol, request: ClientRequest) {
        let client = self.client.clone();
        let update_tx = self.update_tx.clone();
        tokio::spawn(async move {
            let result = match &client {
                LiveOrderClient::Kite(kite) => kite
                    .place_order(
                        &symbol.symbol,
                        &symbol.exchange,
                        request.side,
                        request.price,
                        request.qty,
                    )
                    .await
                    .map_err(|error| (format!("{error}"), is_kite_api_error(&error))),
                LiveOrderClient::Binance(binance) => binance
                    .new_order(
                        &symbol.symbol,
                        &Self::client_order_id(key),
                        request.side,
                        request.price,
                        request.qty,
                    )
                    .await
                    .map(|resp| resp.order_id.to_string())
                    .map_err(|error| (format!("{error}"), is_binance_api_error(&error))),
            };
            match result {
                Ok(venue_order_id) => {
                    let _ = update_tx.send(VenueUpdate::Submitted {
                        key,
                        venue_order_id,
                    });
                }
                Err((reason, venue_rejected)) => {
                    if venue_rejected {
                        let _ = update_tx.send(VenueUpdate::SubmitRejected { key, reason });
                    } else {
                        // Network failure: the order stays pending; the poll
                        // path retries the submit under the same client id.
                        warn!(?key, %reason, "submit transport failure; order stays pending");
                    }
                }
            }
        });
    }

    pub fn submit_cancel(&mut self, request: ClientRequest) {
        let key = (request.client_id, request.order_id);
        let Some(order) = self.orders.get(&key) else {
            return;
        };
        let Some(symbol) = self.symbols.get(&request.ticker_id).cloned() else {
            return;
        };
        let venue_order_id = order.venue_order_id.clone();
        let client = self.client.clone();
        let update_tx = self.update_tx.clone();
        tokio::spawn(async move {
            let result = match &client {
                LiveOrderClient::Kite(kite) => match venue_order_id {
                    Some(id) => kite
                        .cancel_order(&id)
                        .await
                        .map(|_| ())
                        .map_err(|error| format!("{error}")),
                    None => return,
                },
                LiveOrderClient::Binance(binance) => binance
                    .cancel_order(&symbol.symbol, &Self::client_order_id(key))
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("{error}")),
            };
            match result {
                Ok(()) => {
                    let _ = update_tx.send(VenueUpdate::CancelAccepted { key });
                }
                Err(error) => {
                    warn!(?key, ?error, "cancel failed; awaiting poll");
                }
            }
        });
    }

    fn spawn_poll(&self, key: OrderKey, symbol: LiveSymbol, venue_order_id: Option<String>) {
        let client = self.client.clone();
        let update_tx = self.update_tx.clone();
        tokio::spawn(async move {
            let update = match &client {
                LiveOrderClient::Kite(kite) => {
                    let Some(id) = venue_order_id else { return };
                    match kite.order_status(&id).await {
                        Ok(state) => VenueUpdate::Status {
                            key,
                            state: match state.status.as_str() {
                                "COMPLETE" => VenueOrderState::Complete,
                                "CANCELLED" => VenueOrderState::Canceled,
                                "REJECTED" => VenueOrderState::Rejected,
                                _ => VenueOrderState::Open,
                            },
                            filled_qty: state.filled_quantity,
                            avg_price: (state.average_price * 100.0).round() as Price,
                        },
                        Err(error) => {
                            debug!(?key, ?error, "status poll failed");
                            return;
                        }
                    }
                }
                LiveOrderClient::Binance(binance) => {
                    match binance
                        .query_order(&symbol.symbol, &Self::client_order_id(key))
                        .await
                    {
                        Ok(resp) => VenueUpdate::Status {
                            key,
                            state: match resp.status.as_str() {
                                "FILLED" => VenueOrderState::Complete,
                                "CANCELED" => VenueOrderState::Canceled,
                                "REJECTED" | "EXPIRED" => VenueOrderState::Rejected,
                                _ => VenueOrderState::Open,
                            },
                            filled_qty: (resp.executed_qty * crate::binance::QTY_SCALE).round()
                                as Qty,
                            avg_price: (resp.price * PRICE_SCALE).round() as Price,
                        },
                        Err(error) => {
                            debug!(?key, ?error, "status poll failed");
                            return;
                        }
                    }
                }
            };
            let _ = update_tx.send(update);
        });
    }

    /// Drains venue updates into lifecycle responses and kicks the periodic
    /// status poll.
    pub fn poll(&mut self, now: Instant) -> Vec<ClientResponse> {
        if now.duration_since(self.last_poll) >= POLL_INTERVAL {
            self.last_poll = now;
            for (key, order) in &self.orders {
                if order.terminal {
                    continue;
                }
                if let Some(symbol) = self.symbols.get(&order.request.ticker_id) {
                    if order.venue_order_id.is_none() && !order.accepted_sent {
                        // Unconfirmed submit: retry under the same client id.
                        self.spawn_submit(*key, symbol.clone(), order.request);
                    } else {
                        self.spawn_poll(*key, symbol.clone(), order.venue_order_id.clone());
                    }
                }
            }
        }

        let mut responses = Vec::new();
        while let Ok(update) = self.update_rx.try_recv() {
            self.apply_update(update, &mut responses);
        }
        self.orders.retain(|_, order| !order.terminal);
        responses
    }

    fn apply_update(&mut self, update: VenueUpdate, responses: &mut Vec<ClientResponse>) {
        match update {
            VenueUpdate::Submitted {
                key,
                venue_order_id,
            } => {
                let Some(order) = self.orders.get_mut(&key) else {
                    return;
                };
                order.venue_order_id = Some(venue_order_id);
                if !order.accepted_sent {
                    order.accepted_sent = true;
                    responses.push(make_response(
                        ClientResponseKind::Accepted,
                        &order.request,
                        order.request.price,
                        0,
                        order.request.qty,
                        RejectReason::None,
                    ));
                }
            }
            VenueUpdate::SubmitRejected { key, reason } => {
                let Some(order) = self.orders.get_mut(&key) else {
                    return;
                };
                warn!(?key, %reason, "venue rejected order");
                order.terminal = true;
                responses.push(make_response(
                    ClientResponseKind::Rejected,
                    &order.request,
                    order.request.price,
                    0,
                    order.request.qty,
                    RejectReason::None,
                ));
            }
            VenueUpdate::CancelAccepted { key } => {
                let Some(order) = self.orders.get_mut(&key) else {
                    return;
                };
                order.terminal = true;
                responses.push(make_response(
                    ClientResponseKind::Canceled,
                    &order.request,
                    order.request.price,
                    0,
                    0,
                    RejectReason::None,
                ));
            }
            VenueUpdate::Status {
                key,
                state,
                filled_qty,
                avg_price,
            } => {
                let Some(order) = self.orders.get_mut(&key) else {
                    return;
                };
                if order.terminal {
                    return;
                }
                let price = if avg_price > 0 {
                    avg_price
                } else {
                    order.request.price
                };
                let delta = (filled_qty - order.filled).max(0);
                match state {
                    VenueOrderState::Open => {
                        if delta > 0 {
                            order.filled = filled_qty;
                            responses.push(make_response(
                                ClientResponseKind::PartiallyFilled,
                                &order.request,
                                price,
                                delta,
                                order.request.qty - filled_qty,
                                RejectReason::None,
                            ));
                        }
                    }
                    VenueOrderState::Complete => {
                        order.filled = filled_qty;
                        order.terminal = true;
                        responses.push(make_response(
                            ClientResponseKind::Filled,
                            &order.request,
                            price,
                            delta,
                            0,
                            RejectReason::None,
                        ));
                    }
                    VenueOrderState::Canceled => {
                        order.terminal = true;
                        responses.push(make_response(
                            ClientResponseKind::Canceled,
                            &order.request,
                            price,
                            0,
                            0,
                            RejectReason::None,
                        ));
                    }
                    VenueOrderState::Rejected => {
                        order.terminal = true;
                        responses.push(make_response(
                            ClientResponseKind::Rejected,
                            &order.request,
                            price,
                            0,
                            order.request.qty,
                            RejectReason::None,
                        ));
                    }
                }
            }
        }
    }
}

fn is_kite_api_error(error: &crate::zerodha::ZerodhaError) -> bool {
    matches!(error, crate::zerodha::ZerodhaError::Api { .. })
}

fn is_binance_api_error(error: &crate::binance::BinanceError) -> bool {
    matches!(error, crate::binance::BinanceError::Api { .. })
}

fn make_response(
    kind: ClientResponseKind,
    request: &ClientRequest,
    price: Price,
    exec_qty: Qty,
    leaves_qty: Qty,
    reject_reason: RejectReason,
) -> ClientResponse {
    ClientResponse {
        kind,
        reject_reason,
        client_id: request.client_id,
        ticker_id: request.ticker_id,
        order_id: request.order_id,
        side: request.side,
        price,
        exec_qty,
        leaves_qty,
    }
}
