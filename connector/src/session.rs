//! The venue WebSocket session state machine, shared by both adapters.
//!
//! ```text
//! Disconnected ──start──► Connecting ──handshake ok──► Connected
//! Connected    ──auth on handshake──► Subscribing
//! Subscribing  ──first data──► Streaming
//! Streaming    ──socket error/close──► Reconnecting ──backoff──► Connecting
//! any          ──stop──► Terminated
//! ```
//!
//! The session task owns all socket reads. Writes (subscription replay here,
//! foreground subscribe calls in the adapters) go through the shared,
//! mutex-guarded write half. On every disconnect while running, the session
//! pushes [`FeedInput::Reconnect`] into the feed ring so the decode worker
//! clears its books before the resubscribed feed rebuilds them.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use tradecore::{queue::Producer, types::StreamMode};

use crate::{connector::FeedInput, utils::ExponentialBackoff};

pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Streaming,
    Reconnecting,
    Terminated,
}

/// State shared between the session's I/O task and the owning adapter.
pub struct SessionShared {
    state: Mutex<SessionState>,
    write: tokio::sync::Mutex<Option<WsSink>>,
    reconnects: AtomicU64,
}

impl SessionShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::Disconnected),
            write: tokio::sync::Mutex::new(None),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Subscribing | SessionState::Streaming
        )
    }

    /// Reconnect attempts so far; kept for metrics only.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Sends one text frame through the guarded write half. A `NotConnected`
    /// result simply means the subscription set will be replayed on the next
    /// streaming entry.
    pub async fn send_text(&self, text: String) -> bool {
        let mut guard = self.write.lock().await;
        match guard.as_mut() {
            Some(write) => match write.send(Message::text(text)).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(?error, "control write failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Sends a close frame; used by `stop()` to unblock the reader.
    pub async fn close(&self) {
        let mut guard = self.write.lock().await;
        if let Some(write) = guard.as_mut() {
            let _ = write.send(Message::Close(None)).await;
        }
    }
}

/// How server text frames are handled: forwarded into the feed ring (JSON
/// feeds) or inspected in place (binary feeds with text postbacks).
pub enum TextFrames {
    Forward,
    Inspect(Box<dyn Fn(&str) + Send>),
}

pub struct SessionConfig<K> {
    pub venue: &'static str,
    /// Full connection URL including auth query parameters. Credentials are
    /// fixed at construction; rotation is the auth collaborator's job.
    pub url: String,
    pub subscriptions: Arc<Mutex<HashMap<K, StreamMode>>>,
    /// Builds the control messages that replay the full subscription set,
    /// grouped by streaming mode.
    pub replay: Box<dyn Fn(&HashMap<K, StreamMode>) -> Vec<String> + Send>,
    pub text_frames: TextFrames,
}

/// Teardown deadline after `stop()`; a task that misses it is abandoned.
pub const STOP_DEADLINE: Duration = Duration::from_secs(2);

/// Runs the session until `running` is cleared. Never returns early on
/// transport errors; those feed the reconnect backoff (1 s doubling to 30 s,
/// reset once streaming again).
pub async fn run_session<K: Eq + Hash + Clone>(
    config: SessionConfig<K>,
    shared: Arc<SessionShared>,
    mut frame_tx: Producer<FeedInput>,
    running: Arc<AtomicBool>,
) {
    let mut backoff = ExponentialBackoff::default();

    while running.load(Ordering::Acquire) {
        shared.set_state(SessionState::Connecting);
        match connect_async(&config.url).await {
            Ok((stream, _)) => {
                info!(venue = config.venue, "connected");
                shared.set_state(SessionState::Connected);
                let (write, mut read) = stream.split();
                *shared.write.lock().await = Some(write);

                shared.set_state(SessionState::Subscribing);
                let messages = {
                    let subscriptions = config.subscriptions.lock().unwrap();
                    (config.replay)(&subscriptions)
                };
                for message in messages {
                    if !shared.send_text(message).await {
                        break;
                    }
                }

                let mut streaming = false;
                loop {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    match read.next().await {
                        Some(Ok(Message::Binary(data))) => {
                            if !streaming {
                                streaming = true;
                                shared.set_state(SessionState::Streaming);
                                backoff.reset();
                            }
                            if !frame_tx.push(FeedInput::Frame(data.to_vec())) {
                                warn!(
                                    venue = config.venue,
                                    dropped = frame_tx.dropped(),
                                    "feed ring full; frame dropped"
                                );
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            if !streaming {
                                streaming = true;
                                shared.set_state(SessionState::Streaming);
                                backoff.reset();
                            }
                            match &config.text_frames {
                                TextFrames::Forward => {
                                    if !frame_tx
                                        .push(FeedInput::Frame(text.as_bytes().to_vec()))
                                    {
                                        warn!(
                                            venue = config.venue,
                                            dropped = frame_tx.dropped(),
                                            "feed ring full; frame dropped"
                                        );
                                    }
                                }
                                TextFrames::Inspect(handler) => handler(text.as_str()),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let mut guard = shared.write.lock().await;
                            if let Some(write) = guard.as_mut() {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!(venue = config.venue, ?frame, "close frame received");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(venue = config.venue, ?error, "socket error");
                            break;
                        }
                        None => {
                            debug!(venue = config.venue, "stream ended");
                            break;
                        }
                    }
                }

                shared.write.lock().await.take();
                if running.load(Ordering::Acquire) {
                    shared.set_state(SessionState::Reconnecting);
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    frame_tx.push(FeedInput::Reconnect);
                }
            }
            Err(error) => {
                warn!(venue = config.venue, ?error, "connect failed");
                if running.load(Ordering::Acquire) {
                    shared.set_state(SessionState::Reconnecting);
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !running.load(Ordering::Acquire) {
            break;
        }
        let delay = backoff.next_delay();
        debug!(
            venue = config.venue,
            ?delay,
            attempt = shared.reconnects(),
            "reconnect backoff"
        );
        tokio::time::sleep(delay).await;
    }

    shared.set_state(SessionState::Terminated);
    info!(venue = config.venue, "session terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_state_transitions() {
        let shared = SessionShared::new();
        assert_eq!(shared.state(), SessionState::Disconnected);
        assert!(!shared.is_connected());
        shared.set_state(SessionState::Streaming);
        assert!(shared.is_connected());
        shared.set_state(SessionState::Reconnecting);
        assert!(!shared.is_connected());
        shared.set_state(SessionState::Terminated);
        assert!(!shared.is_connected());
    }

    #[tokio::test]
    async fn send_text_without_socket_reports_unsent() {
        let shared = SessionShared::new();
        assert!(!shared.send_text("{}".to_string()).await);
    }
}
