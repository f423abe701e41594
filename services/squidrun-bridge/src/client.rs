//! Reconnecting WebSocket client that speaks the relay's frame protocol on
//! behalf of a local agent.
//!
//! A single background task owns the socket. The public handle never
//! touches I/O directly — it only posts intents onto an `mpsc` channel,
//! matching the reconnect-supervisor shape used elsewhere in this
//! workspace for uplink sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use squidrun_protocol::{status, Metadata, WsMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{ack_retry_delay, reconnect_sleep};
use crate::config::BridgeConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome of a single `send` call once the local pending-ack table
/// reaches a terminal state for it.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The relay (or bridge peer, via the relay) acknowledged the send.
    Acked {
        ok: bool,
        status: Option<String>,
        error: Option<String>,
    },
    /// Retries were exhausted, the nack was terminal, or the connection
    /// dropped with no further retries possible.
    Failed(String),
}

/// A normalized inbound message handed to the host application. Call
/// [`Delivery::ack`] once local delivery settles — the bridge does not
/// ack on the host's behalf.
#[derive(Debug)]
pub struct Delivery {
    pub message_id: String,
    pub from_device: String,
    pub to_device: String,
    pub content: String,
    pub from_role: Option<String>,
    pub target_role: String,
    pub metadata: Metadata,
    ack_tx: mpsc::UnboundedSender<Intent>,
}

impl Delivery {
    pub fn ack(&self, ok: bool, status: Option<String>, error: Option<String>) {
        let _ = self.ack_tx.send(Intent::Ack {
            message_id: self.message_id.clone(),
            ok,
            status,
            error,
        });
    }
}

enum Intent {
    Send {
        message_id: String,
        to_device: String,
        content: String,
        from_role: Option<String>,
        target_role: Option<String>,
        metadata: Metadata,
        reply: oneshot::Sender<SendOutcome>,
    },
    Ack {
        message_id: String,
        ok: bool,
        status: Option<String>,
        error: Option<String>,
    },
    AckTimeout {
        message_id: String,
        attempt: u32,
    },
}

/// Handle to a running bridge connection. Cheap to clone; every clone
/// shares the same background task.
#[derive(Clone)]
pub struct BridgeClient {
    tx: mpsc::UnboundedSender<Intent>,
    connected: Arc<AtomicBool>,
    device_id: String,
}

impl BridgeClient {
    /// Starts the background connection task and returns a handle plus the
    /// channel of inbound deliveries for the host to consume.
    #[must_use]
    pub fn start(config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let device_id = config.device_id.clone();

        let bg_tx = tx.clone();
        let bg_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            run(config, rx, bg_tx, deliver_tx, bg_connected).await;
        });

        (Self { tx, connected, device_id }, deliver_rx)
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends `content` to `to_device`, waiting for the relay's terminal
    /// ack (after any local retries the configuration allows).
    pub async fn send(
        &self,
        to_device: impl Into<String>,
        content: impl Into<String>,
        target_role: Option<String>,
        metadata: Metadata,
    ) -> SendOutcome {
        let (reply, reply_rx) = oneshot::channel();
        let message_id = Uuid::new_v4().to_string();
        let sent = self.tx.send(Intent::Send {
            message_id,
            to_device: to_device.into(),
            content: content.into(),
            from_role: None,
            target_role,
            metadata,
            reply,
        });
        if sent.is_err() {
            return SendOutcome::Failed("bridge task stopped".into());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| SendOutcome::Failed("bridge task stopped".into()))
    }
}

struct PendingSend {
    to_device: String,
    content: String,
    from_role: Option<String>,
    target_role: Option<String>,
    metadata: Metadata,
    reply: Option<oneshot::Sender<SendOutcome>>,
    attempt: u32,
    last_status: Option<String>,
    timeout_task: JoinHandle<()>,
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        self.timeout_task.abort();
    }
}

fn is_retryable_nack(s: &str) -> bool {
    matches!(
        s,
        status::TARGET_OFFLINE
            | status::TARGET_SEND_FAILED
            | status::TARGET_ACK_TIMEOUT
            | status::TARGET_DISCONNECTED
    )
}

async fn run(
    config: BridgeConfig,
    mut rx: mpsc::UnboundedReceiver<Intent>,
    self_tx: mpsc::UnboundedSender<Intent>,
    deliver_tx: mpsc::UnboundedSender<Delivery>,
    connected: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let ws = match tokio_tungstenite::connect_async(&config.relay_url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                warn!(url = %config.relay_url, attempt, "connect failed: {e}");
                reconnect_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };

        match session(&config, ws, &mut rx, &self_tx, &deliver_tx, &connected).await {
            SessionEnd::Shutdown => return,
            SessionEnd::Disconnected => {
                connected.store(false, Ordering::Relaxed);
                reconnect_sleep(attempt).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

enum SessionEnd {
    /// The public handle was dropped; stop reconnecting.
    Shutdown,
    /// Socket closed or errored; the caller should reconnect.
    Disconnected,
}

async fn session(
    config: &BridgeConfig,
    mut ws: WsStream,
    rx: &mut mpsc::UnboundedReceiver<Intent>,
    self_tx: &mpsc::UnboundedSender<Intent>,
    deliver_tx: &mpsc::UnboundedSender<Delivery>,
    connected: &Arc<AtomicBool>,
) -> SessionEnd {
    let register = WsMessage::Register {
        device_id: config.device_id.clone(),
        shared_secret: config.relay_secret.clone(),
        available_roles: config.available_roles.clone(),
    };
    if send_frame(&mut ws, &register).await.is_err() {
        return SessionEnd::Disconnected;
    }

    match tokio::time::timeout(Duration::from_secs(10), recv_frame(&mut ws)).await {
        Ok(Ok(Some(WsMessage::RegisterAck { ok: true, .. }))) => {
            info!(device_id = %config.device_id, "registered with relay");
        }
        Ok(Ok(Some(WsMessage::RegisterAck { ok: false, error, .. }))) => {
            warn!(?error, "registration rejected");
            return SessionEnd::Disconnected;
        }
        _ => {
            warn!("no register-ack (timeout, close, or protocol error)");
            return SessionEnd::Disconnected;
        }
    }

    connected.store(true, Ordering::Relaxed);
    let mut pending: HashMap<String, PendingSend> = HashMap::new();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await; // first tick fires immediately, skip it

    loop {
        tokio::select! {
            intent = rx.recv() => {
                match intent {
                    None => {
                        fail_all_pending(&mut pending, "bridge shutting down");
                        let _ = ws.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Intent::Send { message_id, to_device, content, from_role, target_role, metadata, reply }) => {
                        let frame = WsMessage::XSend {
                            message_id: message_id.clone(),
                            from_device: config.device_id.clone(),
                            to_device: to_device.clone(),
                            content: content.clone(),
                            from_role: from_role.clone(),
                            target_role: target_role.clone(),
                            metadata: metadata.clone(),
                        };
                        if send_frame(&mut ws, &frame).await.is_err() {
                            let _ = reply.send(SendOutcome::Failed("send failed".into()));
                            fail_all_pending(&mut pending, "connection lost");
                            return SessionEnd::Disconnected;
                        }
                        let timeout_task = spawn_ack_timeout(self_tx.clone(), message_id.clone(), 1, config.ack_timeout);
                        pending.insert(message_id, PendingSend {
                            to_device, content, from_role, target_role, metadata,
                            reply: Some(reply), attempt: 1, last_status: None, timeout_task,
                        });
                    }
                    Some(Intent::Ack { message_id, ok, status, error }) => {
                        let frame = WsMessage::XAck {
                            message_id, ok: Some(ok), accepted: None, queued: None, verified: None,
                            status, error, from_device: None, to_device: None,
                            unknown_device: None, connected_devices: None,
                        };
                        if send_frame(&mut ws, &frame).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                    Some(Intent::AckTimeout { message_id, attempt }) => {
                        if !retry_or_finalize(config, &mut ws, &mut pending, self_tx, &message_id, attempt).await {
                            fail_all_pending(&mut pending, "connection lost");
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                let _ = send_frame(&mut ws, &WsMessage::Ping { ts: Some(now_millis()) }).await;
            }
            frame = recv_frame(&mut ws) => {
                match frame {
                    Ok(Some(WsMessage::XAck { message_id, ok, status: ack_status, error, .. })) => {
                        if !settle_ack(config, &mut ws, &mut pending, self_tx, &message_id, ok, ack_status, error).await {
                            fail_all_pending(&mut pending, "connection lost");
                            return SessionEnd::Disconnected;
                        }
                    }
                    Ok(Some(WsMessage::XDeliver { message_id, from_device, to_device, content, from_role, target_role, metadata })) => {
                        let delivery = Delivery {
                            message_id, from_device, to_device, content, from_role, target_role, metadata,
                            ack_tx: self_tx.clone(),
                        };
                        let _ = deliver_tx.send(delivery);
                    }
                    Ok(Some(WsMessage::Ping { ts })) => {
                        let _ = send_frame(&mut ws, &WsMessage::Pong { ts }).await;
                    }
                    Ok(Some(WsMessage::Pong { .. })) => {}
                    Ok(Some(other)) => {
                        debug!(?other, "unhandled frame on bridge connection");
                    }
                    Ok(None) => {
                        fail_all_pending(&mut pending, "connection closed");
                        return SessionEnd::Disconnected;
                    }
                    Err(e) => {
                        warn!("ws read error: {e}");
                        fail_all_pending(&mut pending, "connection error");
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }
}

/// Handles an inbound `xack` for a pending send: resolves it terminally on
/// success or a non-retryable nack, otherwise hands off to the same
/// retry path the timeout timer uses. Returns `false` if the socket died
/// while retrying.
async fn settle_ack(
    config: &BridgeConfig,
    ws: &mut WsStream,
    pending: &mut HashMap<String, PendingSend>,
    self_tx: &mpsc::UnboundedSender<Intent>,
    message_id: &str,
    ok: Option<bool>,
    ack_status: Option<String>,
    error: Option<String>,
) -> bool {
    let Some(entry) = pending.get_mut(message_id) else { return true };

    let succeeded = ok == Some(true);
    let retryable = ack_status.as_deref().is_some_and(is_retryable_nack);

    if succeeded || !retryable {
        if let Some(mut entry) = pending.remove(message_id) {
            if let Some(reply) = entry.reply.take() {
                let outcome = if succeeded {
                    SendOutcome::Acked { ok: true, status: ack_status, error }
                } else {
                    SendOutcome::Failed(ack_status.unwrap_or_else(|| "nacked".to_owned()))
                };
                let _ = reply.send(outcome);
            }
        }
        return true;
    }

    entry.last_status = ack_status;
    let attempt = entry.attempt;
    retry_or_finalize(config, ws, pending, self_tx, message_id, attempt).await
}

/// Retries a pending send in place (bypassing the remainder of its current
/// timeout window), or finalizes it as failed once retries are exhausted.
/// Shared by the timer-driven timeout path and the nack-driven early-retry
/// path. Returns `false` if writing the retry frame failed, meaning the
/// caller should treat the socket as dead.
async fn retry_or_finalize(
    config: &BridgeConfig,
    ws: &mut WsStream,
    pending: &mut HashMap<String, PendingSend>,
    self_tx: &mpsc::UnboundedSender<Intent>,
    message_id: &str,
    attempt: u32,
) -> bool {
    let Some(entry) = pending.get(message_id) else { return true };
    if entry.attempt != attempt {
        return true; // a later attempt already superseded this one
    }

    if attempt > config.ack_max_retries {
        if let Some(mut entry) = pending.remove(message_id) {
            if let Some(reply) = entry.reply.take() {
                let reason = entry
                    .last_status
                    .unwrap_or_else(|| status::TARGET_ACK_TIMEOUT.to_owned());
                let _ = reply.send(SendOutcome::Failed(reason));
            }
        }
        return true;
    }

    let frame = WsMessage::XSend {
        message_id: message_id.to_owned(),
        from_device: config.device_id.clone(),
        to_device: entry.to_device.clone(),
        content: entry.content.clone(),
        from_role: entry.from_role.clone(),
        target_role: entry.target_role.clone(),
        metadata: entry.metadata.clone(),
    };
    if send_frame(ws, &frame).await.is_err() {
        if let Some(mut entry) = pending.remove(message_id) {
            if let Some(reply) = entry.reply.take() {
                let _ = reply.send(SendOutcome::Failed("connection lost".into()));
            }
        }
        return false;
    }

    let next_attempt = attempt + 1;
    let Some(entry) = pending.get_mut(message_id) else { return true };
    entry.attempt = next_attempt;
    entry.timeout_task = spawn_ack_timeout(
        self_tx.clone(),
        message_id.to_owned(),
        next_attempt,
        ack_retry_delay(config.ack_timeout, next_attempt),
    );
    true
}

fn spawn_ack_timeout(
    self_tx: mpsc::UnboundedSender<Intent>,
    message_id: String,
    attempt: u32,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = self_tx.send(Intent::AckTimeout { message_id, attempt });
    })
}

fn fail_all_pending(pending: &mut HashMap<String, PendingSend>, reason: &str) {
    for (_, mut entry) in pending.drain() {
        if let Some(reply) = entry.reply.take() {
            let _ = reply.send(SendOutcome::Failed(reason.to_owned()));
        }
    }
}

async fn send_frame(ws: &mut WsStream, msg: &WsMessage) -> Result<(), ()> {
    let json = msg.to_json().map_err(|_| ())?;
    ws.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn recv_frame(ws: &mut WsStream) -> Result<Option<WsMessage>, String> {
    loop {
        match ws.next().await {
            None => return Ok(None),
            Some(Err(e)) => return Err(e.to_string()),
            Some(Ok(Message::Text(text))) => {
                return WsMessage::from_json(&text).map(Some).map_err(|e| e.to_string());
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

fn now_millis() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(i64::MAX)
}
