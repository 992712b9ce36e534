//! The order gateway: consumes client requests, validates them against the
//! registered instrument set and the live-order table, hands the survivors
//! to the execution backend, and emits lifecycle responses. The gateway task
//! is the response ring's only producer, which is what gives responses their
//! per-order lifecycle ordering.

pub mod live;
pub mod paper;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use tradecore::{
    queue::{Consumer, Producer},
    types::{
        ClientId, ClientRequest, ClientRequestKind, ClientResponse, ClientResponseKind, OrderId,
        RejectReason, TickerId,
    },
};

use self::{live::LiveEngine, paper::PaperEngine};

const IDLE_SLEEP: Duration = Duration::from_micros(10);

type OrderKey = (ClientId, OrderId);

pub enum ExecutionBackend {
    Paper(PaperEngine),
    Live(LiveEngine),
}

impl ExecutionBackend {
    fn submit_new(&mut self, request: ClientRequest, now: Instant) {
        match self {
            ExecutionBackend::Paper(engine) => engine.submit_new(request, now),
            ExecutionBackend::Live(engine) => engine.submit_new(request),
        }
    }

    fn submit_cancel(&mut self, request: ClientRequest, now: Instant) {
        match self {
            ExecutionBackend::Paper(engine) => engine.submit_cancel(request, now),
            ExecutionBackend::Live(engine) => engine.submit_cancel(request),
        }
    }

    fn poll(&mut self, now: Instant) -> Vec<ClientResponse> {
        match self {
            ExecutionBackend::Paper(engine) => engine.poll(now),
            ExecutionBackend::Live(engine) => engine.poll(now),
        }
    }
}

pub struct OrderGateway {
    request_rx: Consumer<ClientRequest>,
    response_tx: Producer<ClientResponse>,
    tickers: HashSet<TickerId>,
    // In-flight orders, for duplicate and cancel validation.
    live_orders: HashSet<OrderKey>,
    backend: ExecutionBackend,
}

impl OrderGateway {
    pub fn new(
        request_rx: Consumer<ClientRequest>,
        response_tx: Producer<ClientResponse>,
        backend: ExecutionBackend,
    ) -> Self {
        Self {
            request_rx,
            response_tx,
            tickers: HashSet::new(),
            live_orders: HashSet::new(),
            backend,
        }
    }

    /// Adds a ticker to the set orders may reference.
    pub fn register_ticker(&mut self, ticker_id: TickerId) {
        self.tickers.insert(ticker_id);
    }

    fn reject(request: &ClientRequest, kind: ClientResponseKind, reason: RejectReason) -> ClientResponse {
        ClientResponse {
            kind,
            reject_reason: reason,
            client_id: request.client_id,
            ticker_id: request.ticker_id,
            order_id: request.order_id,
            side: request.side,
            price: request.price,
            exec_qty: 0,
            leaves_qty: request.qty,
        }
    }

    /// Returns the rejection response for an invalid request, `None` when
    /// the request may proceed to the backend. A price of zero on a NEW is a
    /// market order and is not validated against price.
    fn validate(&self, request: &ClientRequest) -> Option<ClientResponse> {
        let key = (request.client_id, request.order_id);
        if !self.tickers.contains(&request.ticker_id) {
            return Some(Self::reject(
                request,
                ClientResponseKind::Rejected,
                RejectReason::InvalidTicker,
            ));
        }
        match request.kind {
            ClientRequestKind::New => {
                if request.qty <= 0 {
                    return Some(Self::reject(
                        request,
                        ClientResponseKind::Rejected,
                        RejectReason::InvalidQuantity,
                    ));
                }
                if request.price < 0 {
                    return Some(Self::reject(
                        request,
                        ClientResponseKind::Rejected,
                        RejectReason::InvalidPrice,
                    ));
                }
                if self.live_orders.contains(&key) {
                    return Some(Self::reject(
                        request,
                        ClientResponseKind::Rejected,
                        RejectReason::DuplicateOrderId,
                    ));
                }
            }
            ClientRequestKind::Cancel => {
                if !self.live_orders.contains(&key) {
                    return Some(Self::reject(
                        request,
                        ClientResponseKind::CancelRejected,
                        RejectReason::InvalidOrderId,
                    ));
                }
            }
            ClientRequestKind::Invalid => {
                return Some(Self::reject(
                    request,
                    ClientResponseKind::Rejected,
                    RejectReason::InvalidOrderId,
                ));
            }
        }
        None
    }

    fn emit(&mut self, response: ClientResponse) {
        if response.is_terminal() {
            self.live_orders
                .remove(&(response.client_id, response.order_id));
        }
        if !self.response_tx.push(response) {
            warn!(
                dropped = self.response_tx.dropped(),
                "response ring full; response dropped"
            );
        }
    }

    /// One gateway iteration: drain requests, then drain backend events.
    /// Returns whether any work happened.
    pub fn process(&mut self, now: Instant) -> bool {
        let mut worked = false;
        while let Some(request) = self.request_rx.pop() {
            worked = true;
            debug!(?request, "request received");
            match self.validate(&request) {
                Some(rejection) => {
                    debug!(reason = ?rejection.reject_reason, "request rejected");
                    self.emit(rejection);
                }
                None => {
                    match request.kind {
                        ClientRequestKind::New => {
                            self.live_orders
                                .insert((request.client_id, request.order_id));
                            self.backend.submit_new(request, now);
                        }
                        ClientRequestKind::Cancel => {
                            self.backend.submit_cancel(request, now);
                        }
                        ClientRequestKind::Invalid => unreachable!(),
                    }
                }
            }
        }

        for response in self.backend.poll(now) {
            worked = true;
            self.emit(response);
        }
        worked
    }

    /// Runs the gateway task until `running` clears.
    pub async fn run(mut self, running: Arc<AtomicBool>) {
        info!("order gateway started");
        while running.load(Ordering::Acquire) {
            if !self.process(Instant::now()) {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
        if let ExecutionBackend::Paper(engine) = &mut self.backend {
            engine.drain();
        }
        info!("order gateway stopped");
    }
}
