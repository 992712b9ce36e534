//! Paper-trading execution: simulated accepts, fills and cancels on a timer
//! wheel of scheduled events. Latency and fill draws follow the configured
//! paper-trading parameters; event order is (due time, insertion sequence),
//! which preserves the per-order lifecycle ordering.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

use tradecore::{
    config::PaperTradingConfig,
    types::{
        ClientId, ClientRequest, ClientResponse, ClientResponseKind, OrderId, Price, Qty,
        RejectReason, Side, TickerId,
    },
};

type OrderKey = (ClientId, OrderId);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ScheduledKind {
    Accept,
    PartialFill { qty: Qty },
    Fill,
    Cancel,
}

struct Scheduled {
    due: Instant,
    seq: u64,
    key: OrderKey,
    kind: ScheduledKind,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the BinaryHeap pops the earliest (due, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PaperState {
    PendingAccept,
    Open,
    PendingCancel,
    Done,
}

struct PaperOrder {
    request: ClientRequest,
    accept_due: Instant,
    state: PaperState,
    filled: Qty,
}

pub struct PaperEngine {
    config: PaperTradingConfig,
    rng: StdRng,
    schedule: BinaryHeap<Scheduled>,
    seq: u64,
    orders: HashMap<OrderKey, PaperOrder>,
    // Last fill price per ticker; the market-order reference price.
    marks: HashMap<TickerId, Price>,
}

impl PaperEngine {
    pub fn new(config: PaperTradingConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_rng(config: PaperTradingConfig, rng: StdRng) -> Self {
        Self {
            config,
            rng,
            schedule: BinaryHeap::new(),
            seq: 0,
            orders: HashMap::new(),
            marks: HashMap::new(),
        }
    }

    fn push(&mut self, due: Instant, key: OrderKey, kind: ScheduledKind) {
        self.seq += 1;
        self.schedule.push(Scheduled {
            due,
            seq: self.seq,
            key,
            kind,
        });
    }

    fn draw_latency(&mut self) -> Duration {
        let PaperTradingConfig {
            min_latency_ms,
            max_latency_ms,
            ..
        } = self.config;
        Duration::from_millis(if min_latency_ms >= max_latency_ms {
            min_latency_ms
        } else {
            self.rng.random_range(min_latency_ms..=max_latency_ms)
        })
    }

    fn fill_price(&mut self, request: &ClientRequest) -> Option<Price> {
        if request.price > 0 {
            return Some(request.price);
        }
        // Market order: dither the reference price against the taker.
        let reference = *self.marks.get(&request.ticker_id)?;
        let sign = match request.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        let dither = 1.0 + sign * self.config.slippage_factor * self.rng.random::<f64>();
        Some((reference as f64 * dither).round() as Price)
    }

    /// Schedules the accept and, with the configured probability, the fill.
    /// An unfilled order rests open until an explicit cancel.
    pub fn submit_new(&mut self, request: ClientRequest, now: Instant) {
        let key = (request.client_id, request.order_id);
        let latency = self.draw_latency();
        let accept_due = now + latency;
        self.push(accept_due, key, ScheduledKind::Accept);

        let fills = self.rng.random::<f64>() < self.config.fill_probability;
        if fills {
            if self.config.partial_fill && request.qty > 1 {
                let first = request.qty / 2;
                self.push(
                    now + latency * 2,
                    key,
                    ScheduledKind::PartialFill { qty: first },
                );
                self.push(now + latency * 3, key, ScheduledKind::Fill);
            } else {
                self.push(now + latency * 2, key, ScheduledKind::Fill);
            }
        } else {
            debug!(
                order_id = request.order_id,
                "paper order rests without a fill"
            );
        }

        self.orders.insert(
            key,
            PaperOrder {
                request,
                accept_due,
                state: PaperState::PendingAccept,
                filled: 0,
            },
        );
    }

    /// A cancel on an in-flight paper order always succeeds after one
    /// latency draw, never before the order's accept.
    pub fn submit_cancel(&mut self, request: ClientRequest, now: Instant) {
        let key = (request.client_id, request.order_id);
        let latency = self.draw_latency();
        let Some(order) = self.orders.get_mut(&key) else {
            return;
        };
        let due = (now + latency).max(order.accept_due);
        order.state = PaperState::PendingCancel;
        self.push(due, key, ScheduledKind::Cancel);
    }

    /// Drains every event due by `now` into lifecycle responses.
    pub fn poll(&mut self, now: Instant) -> Vec<ClientResponse> {
        let mut responses = Vec::new();
        while let Some(next) = self.schedule.peek() {
            if next.due > now {
                break;
            }
            let event = self.schedule.pop().unwrap();
            let Some(order) = self.orders.get_mut(&event.key) else {
                continue;
            };
            match event.kind {
                ScheduledKind::Accept => {
                    if order.state == PaperState::PendingAccept {
                        order.state = PaperState::Open;
                    }
                    responses.push(response(
                        ClientResponseKind::Accepted,
                        &order.request,
                        order.request.price,
                        0,
                        order.request.qty,
                    ));
                }
                ScheduledKind::PartialFill { qty } => {
                    if order.state == PaperState::Done {
                        continue;
                    }
                    let request = order.request;
                    let Some(price) = self.fill_price(&request) else {
                        continue;
                    };
                    let order = self.orders.get_mut(&event.key).unwrap();
                    order.filled += qty;
                    responses.push(response(
                        ClientResponseKind::PartiallyFilled,
                        &request,
                        price,
                        qty,
                        request.qty - order.filled,
                    ));
                    self.marks.insert(request.ticker_id, price);
                }
                ScheduledKind::Fill => {
                    if matches!(order.state, PaperState::Done) {
                        continue;
                    }
                    let request = order.request;
                    let Some(price) = self.fill_price(&request) else {
                        continue;
                    };
                    let order = self.orders.get_mut(&event.key).unwrap();
                    let exec_qty = request.qty - order.filled;
                    order.state = PaperState::Done;
                    responses.push(response(
                        ClientResponseKind::Filled,
                        &request,
                        price,
                        exec_qty,
                        0,
                    ));
                    self.marks.insert(request.ticker_id, price);
                    self.orders.remove(&event.key);
                }
                ScheduledKind::Cancel => {
                    if order.state == PaperState::Done {
                        continue;
                    }
                    order.state = PaperState::Done;
                    responses.push(response(
                        ClientResponseKind::Canceled,
                        &order.request,
                        order.request.price,
                        0,
                        0,
                    ));
                    self.orders.remove(&event.key);
                }
            }
        }
        responses
    }

    /// Cancels everything scheduled; used at teardown.
    pub fn drain(&mut self) {
        self.schedule.clear();
        self.orders.clear();
    }

    pub fn open_orders(&self) -> usize {
        self.orders.len()
    }
}

fn response(
    kind: ClientResponseKind,
    request: &ClientRequest,
    price: Price,
    exec_qty: Qty,
    leaves_qty: Qty,
) -> ClientResponse {
    ClientResponse {
        kind,
        reject_reason: RejectReason::None,
        client_id: request.client_id,
        ticker_id: request.ticker_id,
        order_id: request.order_id,
        side: request.side,
        price,
        exec_qty,
        leaves_qty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradecore::types::ClientRequestKind;

    fn config(fill_probability: f64, latency_ms: u64) -> PaperTradingConfig {
        PaperTradingConfig {
            fill_probability,
            min_latency_ms: latency_ms,
            max_latency_ms: latency_ms,
            slippage_factor: 0.001,
            partial_fill: false,
        }
    }

    fn engine(fill_probability: f64, latency_ms: u64) -> PaperEngine {
        PaperEngine::with_rng(config(fill_probability, latency_ms), StdRng::seed_from_u64(7))
    }

    fn new_request(order_id: OrderId, price: Price, qty: Qty) -> ClientRequest {
        ClientRequest {
            kind: ClientRequestKind::New,
            client_id: 1,
            ticker_id: 7,
            order_id,
            side: Side::Buy,
            price,
            qty,
        }
    }

    #[test]
    fn certain_fill_follows_accept() {
        let mut engine = engine(1.0, 10);
        let now = Instant::now();
        engine.submit_new(new_request(42, 10000, 3), now);

        assert!(engine.poll(now + Duration::from_millis(9)).is_empty());

        let at_accept = engine.poll(now + Duration::from_millis(10));
        assert_eq!(at_accept.len(), 1);
        assert_eq!(at_accept[0].kind, ClientResponseKind::Accepted);
        assert_eq!(at_accept[0].order_id, 42);
        assert_eq!(at_accept[0].leaves_qty, 3);

        let at_fill = engine.poll(now + Duration::from_millis(20));
        assert_eq!(at_fill.len(), 1);
        assert_eq!(at_fill[0].kind, ClientResponseKind::Filled);
        assert_eq!(at_fill[0].exec_qty, 3);
        assert_eq!(at_fill[0].leaves_qty, 0);
        assert_eq!(at_fill[0].price, 10000);
        assert_eq!(engine.open_orders(), 0);
    }

    #[test]
    fn zero_probability_rests_until_cancel() {
        let mut engine = engine(0.0, 10);
        let now = Instant::now();
        let request = new_request(42, 10000, 3);
        engine.submit_new(request, now);

        let responses = engine.poll(now + Duration::from_secs(5));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, ClientResponseKind::Accepted);

        let mut cancel = request;
        cancel.kind = ClientRequestKind::Cancel;
        engine.submit_cancel(cancel, now + Duration::from_secs(5));
        let responses = engine.poll(now + Duration::from_secs(6));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, ClientResponseKind::Canceled);
    }

    #[test]
    fn cancel_never_precedes_accept() {
        let mut engine = engine(0.0, 10);
        let now = Instant::now();
        engine.submit_new(new_request(42, 10000, 3), now);
        // Cancel immediately; its latency draw equals the accept's, and the
        // sequence tiebreak keeps the accept first.
        engine.submit_cancel(new_request(42, 10000, 3), now);

        let responses = engine.poll(now + Duration::from_secs(1));
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].kind, ClientResponseKind::Accepted);
        assert_eq!(responses[1].kind, ClientResponseKind::Canceled);
    }

    #[test]
    fn canceled_order_skips_scheduled_fill() {
        let mut engine = engine(1.0, 10);
        let now = Instant::now();
        engine.submit_new(new_request(42, 10000, 3), now);
        engine.submit_cancel(new_request(42, 10000, 3), now + Duration::from_millis(11));

        let responses = engine.poll(now + Duration::from_secs(1));
        let kinds: Vec<_> = responses.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ClientResponseKind::Accepted, ClientResponseKind::Canceled]
        );
    }

    #[test]
    fn partial_fill_splits_quantity() {
        let mut engine = PaperEngine::with_rng(
            PaperTradingConfig {
                partial_fill: true,
                ..config(1.0, 10)
            },
            StdRng::seed_from_u64(7),
        );
        let now = Instant::now();
        engine.submit_new(new_request(42, 10000, 5), now);

        let responses = engine.poll(now + Duration::from_secs(1));
        let kinds: Vec<_> = responses.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ClientResponseKind::Accepted,
                ClientResponseKind::PartiallyFilled,
                ClientResponseKind::Filled,
            ]
        );
        assert_eq!(responses[1].exec_qty, 2);
        assert_eq!(responses[1].leaves_qty, 3);
        assert_eq!(responses[2].exec_qty, 3);
        assert_eq!(responses[2].leaves_qty, 0);
        assert_eq!(
            responses[1].exec_qty + responses[2].exec_qty,
            5
        );
    }

    #[test]
    fn market_order_fills_at_dithered_mark() {
        let mut engine = engine(1.0, 10);
        let now = Instant::now();
        // A limit fill seeds the mark.
        engine.submit_new(new_request(1, 10000, 1), now);
        engine.poll(now + Duration::from_secs(1));

        engine.submit_new(new_request(2, 0, 3), now + Duration::from_secs(1));
        let responses = engine.poll(now + Duration::from_secs(2));
        let fill = responses
            .iter()
            .find(|r| r.kind == ClientResponseKind::Filled)
            .unwrap();
        // Buy-side slippage is adverse: at or above the mark, within 0.1%.
        assert!(fill.price >= 10000);
        assert!(fill.price <= 10010);
    }

    #[test]
    fn market_order_without_mark_rests() {
        let mut engine = engine(1.0, 10);
        let now = Instant::now();
        engine.submit_new(new_request(42, 0, 3), now);
        let responses = engine.poll(now + Duration::from_secs(1));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, ClientResponseKind::Accepted);
        assert_eq!(engine.open_orders(), 1);
    }
}
