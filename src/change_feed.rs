//! Cross-process change notifications over Redis pub/sub
//!
//! Every process keeps its own local mirror. When a peer commits a write to
//! the persistent tier it publishes a `ChangeNotice`; subscribers re-read the
//! listed ids from the persistent tier and refresh their mirrors.
//!
//! The subscriber runs on a background task that reconnects with exponential
//! backoff. Each time a subscription is (re)established the feed yields
//! `FeedEvent::Subscribed`, since notices sent while disconnected are lost and
//! the consumer has to resync.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Payload published after a successful durable write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotice {
    /// Persistent tier instance that committed the write
    pub origin: Uuid,
    /// Identities written
    pub ids: Vec<Uuid>,
}

impl ChangeNotice {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Item yielded by a change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A subscription was (re)established; earlier notices may have been missed
    Subscribed,
    /// Some process committed writes for these ids
    Changed(ChangeNotice),
}

/// Stream of change notices for one channel
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<FeedEvent>,
    shutdown_flag: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

impl ChangeFeed {
    /// Subscribe to `channel` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(redis_client: redis::Client, channel: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_subscriber(
            redis_client,
            channel.into(),
            tx,
            Arc::clone(&shutdown_flag),
        ));

        Self {
            rx,
            shutdown_flag,
            _handle: handle,
        }
    }

    /// Signal the background task to stop; the stream ends shortly after
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Stream for ChangeFeed {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FeedEvent>> {
        self.rx.poll_recv(cx)
    }
}

fn next_backoff(delay_ms: u64) -> u64 {
    delay_ms.saturating_mul(2).min(MAX_BACKOFF_MS)
}

/// Reconnect delay, doubled on every failed or dropped connection.
///
/// Only reset once a connection has delivered a message, so a server that
/// accepts and immediately drops connections is still backed off.
#[derive(Debug)]
struct Backoff {
    delay_ms: u64,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay_ms: INITIAL_BACKOFF_MS,
        }
    }

    /// Delay to wait now; the next one doubles
    fn advance(&mut self) -> Duration {
        let delay = Duration::from_millis(self.delay_ms);
        self.delay_ms = next_backoff(self.delay_ms);
        delay
    }

    fn reset(&mut self) {
        self.delay_ms = INITIAL_BACKOFF_MS;
    }
}

async fn run_subscriber(
    redis_client: redis::Client,
    channel: String,
    tx: mpsc::UnboundedSender<FeedEvent>,
    shutdown_flag: Arc<AtomicBool>,
) {
    let mut backoff = Backoff::new();

    while !shutdown_flag.load(Ordering::SeqCst) {
        let mut pubsub = match redis_client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!("ChangeFeed: failed to create Redis pubsub connection: {}", e);
                tokio::time::sleep(backoff.advance()).await;
                continue;
            }
        };

        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!("ChangeFeed: subscribe failed for {}: {}", channel, e);
            tokio::time::sleep(backoff.advance()).await;
            continue;
        }

        debug!("ChangeFeed: subscribed to channel {}", channel);
        if tx.send(FeedEvent::Subscribed).is_err() {
            return;
        }

        let mut messages = pubsub.on_message();
        let mut delivered = false;
        loop {
            let msg = match tokio::time::timeout(SHUTDOWN_POLL, messages.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!("ChangeFeed: connection for {} closed; reconnecting", channel);
                    tokio::time::sleep(backoff.advance()).await;
                    break;
                }
                Err(_) => {
                    if shutdown_flag.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
            };
            if !delivered {
                delivered = true;
                backoff.reset();
            }

            let payload = match msg.get_payload::<String>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("ChangeFeed: failed to decode pub/sub payload: {}", e);
                    continue;
                }
            };
            match ChangeNotice::decode(&payload) {
                Ok(notice) => {
                    if tx.send(FeedEvent::Changed(notice)).is_err() {
                        // consumer gone
                        return;
                    }
                }
                Err(e) => warn!("ChangeFeed: ignoring malformed notice {}: {}", payload, e),
            }
        }
    }
}
