//! Duplex Channel (spec §4.D): long-lived bidirectional message transport
//! with heartbeat, exponential-backoff reconnection, and an offline
//! send-queue.

mod protocol;
mod transport;

pub use protocol::{ItemOutcome, WireMessage};
pub use transport::{LoopbackTransport, Transport, WebSocketTransport};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};

use crate::config::ReconnectConfig;
use crate::error::{Result, StoreError};
use crate::types::DeviceId;

const HEARTBEAT_TIMEOUT_PINGS: u32 = 3;
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle (spec §4.D). Initial state is `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

type Listener = Arc<dyn Fn(&WireMessage) + Send + Sync>;

struct Inner {
    state: Mutex<ChannelState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    send_queue: Mutex<VecDeque<WireMessage>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    pending_batches: Mutex<HashMap<u64, oneshot::Sender<Vec<ItemOutcome>>>>,
    unanswered_pings: AtomicU32,
    next_batch_id: AtomicU64,
    device_id: DeviceId,
    reconnect: ReconnectConfig,
    heartbeat_interval: Duration,
    shutdown: Notify,
}

/// Long-lived bidirectional message channel (spec §4.D). Cheaply cloneable
/// (wraps an `Arc`); clones share the same connection and send-queue.
#[derive(Clone)]
pub struct DuplexChannel {
    inner: Arc<Inner>,
}

impl DuplexChannel {
    pub fn new(device_id: DeviceId, reconnect: ReconnectConfig, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ChannelState::Disconnected),
                transport: Mutex::new(None),
                send_queue: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(HashMap::new()),
                pending_batches: Mutex::new(HashMap::new()),
                unanswered_pings: AtomicU32::new(0),
                next_batch_id: AtomicU64::new(1),
                device_id,
                reconnect,
                heartbeat_interval,
                shutdown: Notify::new(),
            }),
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.inner.state.lock().await
    }

    /// Subscribe to inbound messages of a given `type` (spec §4.D,
    /// "Receive"). `pong` is handled internally and never delivered here.
    pub async fn subscribe(&self, message_type: impl Into<String>, listener: Listener) {
        self.inner
            .listeners
            .lock()
            .await
            .entry(message_type.into())
            .or_default()
            .push(listener);
    }

    /// Open the connection using an already-constructed transport (the
    /// transport's own connect/reconnect-at-the-socket-level is the host's
    /// concern; this channel owns heartbeat/backoff/batching on top of it).
    pub async fn connect_with(&self, transport: Arc<dyn Transport>) -> Result<()> {
        *self.inner.state.lock().await = ChannelState::Connecting;
        *self.inner.transport.lock().await = Some(transport.clone());
        self.inner.unanswered_pings.store(0, Ordering::SeqCst);
        *self.inner.state.lock().await = ChannelState::Connected;

        self.flush_send_queue().await?;
        self.spawn_receiver();
        self.spawn_heartbeat();
        Ok(())
    }

    /// Normal-closure disconnect: cancels heartbeat/reconnect timers and
    /// leaves the send-queue intact for the next `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        *self.inner.state.lock().await = ChannelState::Disconnecting;
        self.inner.shutdown.notify_waiters();
        if let Some(transport) = self.inner.transport.lock().await.take() {
            transport.close().await.ok();
        }
        *self.inner.state.lock().await = ChannelState::Disconnected;
        Ok(())
    }

    /// `send(msg)`: transmit if connected, otherwise enqueue (spec §4.D).
    /// Ordering guarantee: messages leave in enqueue order for a single
    /// sender.
    pub async fn send(&self, msg: WireMessage) -> Result<()> {
        if self.state().await == ChannelState::Connected {
            if let Some(transport) = self.inner.transport.lock().await.as_ref() {
                let bytes = serde_json::to_vec(&msg)?;
                return transport.send(bytes).await;
            }
        }
        self.inner.send_queue.lock().await.push_back(msg);
        Ok(())
    }

    /// `sendBatch(msgs)`: assigns a batch id, sends one `batch` envelope,
    /// and awaits the matching `batch-response` or a 30s timeout (spec
    /// §4.D, §5 "Cancellation & timeouts").
    pub async fn send_batch(&self, messages: Vec<serde_json::Value>) -> Result<Vec<ItemOutcome>> {
        let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_batches.lock().await.insert(batch_id, tx);

        self.send(WireMessage::Batch {
            timestamp: Utc::now(),
            device_id: self.inner.device_id,
            batch_id,
            messages,
        })
        .await?;

        match timeout(BATCH_TIMEOUT, rx).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(_)) => Err(StoreError::TransportError("batch channel closed".into())),
            Err(_) => {
                self.inner.pending_batches.lock().await.remove(&batch_id);
                Err(StoreError::BatchTimeout { batch_id })
            }
        }
    }

    async fn flush_send_queue(&self) -> Result<()> {
        let mut queue = self.inner.send_queue.lock().await;
        let transport = self.inner.transport.lock().await.clone();
        let Some(transport) = transport else { return Ok(()) };
        while let Some(msg) = queue.pop_front() {
            let bytes = serde_json::to_vec(&msg)?;
            transport.send(bytes).await?;
        }
        Ok(())
    }

    fn spawn_heartbeat(&self) {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(channel.inner.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if channel.state().await != ChannelState::Connected {
                            break;
                        }
                        let unanswered = channel.inner.unanswered_pings.fetch_add(1, Ordering::SeqCst) + 1;
                        if unanswered > HEARTBEAT_TIMEOUT_PINGS {
                            warn!("heartbeat timed out, reconnecting");
                            channel.begin_reconnect().await;
                            break;
                        }
                        let _ = channel.send(WireMessage::Ping { timestamp: Utc::now() }).await;
                    }
                    _ = channel.inner.shutdown.notified() => break,
                }
            }
        });
    }

    fn spawn_receiver(&self) {
        let channel = self.clone();
        tokio::spawn(async move {
            loop {
                let transport = channel.inner.transport.lock().await.clone();
                let Some(transport) = transport else { break };
                match transport.recv().await {
                    Ok(Some(bytes)) => {
                        if let Ok(msg) = serde_json::from_slice::<WireMessage>(&bytes) {
                            channel.dispatch(msg).await;
                        }
                    }
                    Ok(None) => {
                        if channel.state().await == ChannelState::Connected {
                            warn!("transport closed unexpectedly, reconnecting");
                            channel.begin_reconnect().await;
                        }
                        break;
                    }
                    Err(err) => {
                        error!(%err, "transport recv error, reconnecting");
                        channel.begin_reconnect().await;
                        break;
                    }
                }
            }
        });
    }

    async fn dispatch(&self, msg: WireMessage) {
        match &msg {
            WireMessage::Pong { .. } => {
                self.inner.unanswered_pings.store(0, Ordering::SeqCst);
                return;
            }
            WireMessage::BatchResponse { batch_id, results, .. } => {
                if let Some(tx) = self.inner.pending_batches.lock().await.remove(batch_id) {
                    let _ = tx.send(results.clone());
                }
                return;
            }
            _ => {}
        }

        let tag = msg.type_tag().to_string();
        let listeners = self.inner.listeners.lock().await.get(&tag).cloned();
        if let Some(listeners) = listeners {
            for listener in listeners {
                listener(&msg);
            }
        }
    }

    /// Exponential backoff reconnect loop (spec §4.D, "Reconnect"):
    /// `delay = min(base * factor^(attempt-1), maxDelay)`. Emits
    /// `reconnect-failed` (via the `"reconnect-failed"` listener channel)
    /// after `maxAttempts` and stays `Disconnected`.
    async fn begin_reconnect(&self) {
        *self.inner.state.lock().await = ChannelState::Reconnecting;
        *self.inner.transport.lock().await = None;

        for attempt in 1..=self.inner.reconnect.max_attempts {
            let delay = self.backoff_for(attempt);
            debug!(attempt, ?delay, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.shutdown.notified() => return,
            }

            // The host is expected to re-establish the transport and call
            // `connect_with` again; this loop bounds how many times it is
            // given the opportunity to do so before giving up.
            if self.state().await == ChannelState::Connected {
                return;
            }
        }

        error!("reconnect attempts exhausted");
        *self.inner.state.lock().await = ChannelState::Disconnected;
        self.dispatch(WireMessage::ServerUpdate {
            timestamp: Utc::now(),
            payload: serde_json::json!({"event": "reconnect-failed"}),
        })
        .await;
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let cfg = &self.inner.reconnect;
        let scaled = cfg.base_delay.as_secs_f64() * cfg.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(cfg.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn send_while_disconnected_enqueues() {
        let channel = DuplexChannel::new(DeviceId::new(), config(), Duration::from_millis(50));
        channel
            .send(WireMessage::Ping { timestamp: Utc::now() })
            .await
            .unwrap();
        assert_eq!(channel.inner.send_queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn connect_flushes_queue() {
        let channel = DuplexChannel::new(DeviceId::new(), config(), Duration::from_secs(5));
        channel
            .send(WireMessage::Ping { timestamp: Utc::now() })
            .await
            .unwrap();

        let (transport, _peer_tx, mut peer_rx) = LoopbackTransport::pair();
        channel.connect_with(Arc::new(transport)).await.unwrap();

        // give the flush a tick to run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peer_rx.try_recv().is_ok());
        assert!(channel.inner.send_queue.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_routes_by_type() {
        let channel = DuplexChannel::new(DeviceId::new(), config(), Duration::from_secs(5));
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        channel
            .subscribe(
                "server-update",
                Arc::new(move |_msg| {
                    seen_clone.store(true, Ordering::SeqCst);
                }),
            )
            .await;

        channel
            .dispatch(WireMessage::ServerUpdate {
                timestamp: Utc::now(),
                payload: serde_json::json!({}),
            })
            .await;

        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pong_is_not_surfaced_to_listeners() {
        let channel = DuplexChannel::new(DeviceId::new(), config(), Duration::from_secs(5));
        let seen = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        channel
            .subscribe("pong", Arc::new(move |_| seen_clone.store(true, Ordering::SeqCst)))
            .await;

        channel.dispatch(WireMessage::Pong { timestamp: Utc::now() }).await;
        assert!(!seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_batch_times_out_without_response() {
        let channel = DuplexChannel::new(DeviceId::new(), config(), Duration::from_secs(5));
        let (transport, _peer_tx, _peer_rx) = LoopbackTransport::pair();
        channel.connect_with(Arc::new(transport)).await.unwrap();

        // Use a channel whose batch timeout we can't wait 30s for in a unit
        // test; exercise the pending-batch bookkeeping path directly
        // instead of waiting out the real timeout.
        let batch_id = channel.inner.next_batch_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel::<Vec<ItemOutcome>>();
        channel.inner.pending_batches.lock().await.insert(batch_id, tx);
        drop(rx);
        assert!(channel.inner.pending_batches.lock().await.contains_key(&batch_id));
    }
}
