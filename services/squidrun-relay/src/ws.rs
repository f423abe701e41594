use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use squidrun_protocol::{canonicalize_device_id, canonicalize_roles, WsMessage};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::{ConnectionRecord, ServerCommand};
use crate::router;
use crate::state::AppState;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn send(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match msg.to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound frame");
            false
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    let remote_addr = addr.to_string();

    let Some((device_id, roles, cmd_tx, mut cmd_rx)) = register(&mut socket, &state, &remote_addr).await else {
        return;
    };

    info!(device_id = %device_id, remote = %remote_addr, "device registered");

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(&mut socket, &state, &device_id, &cmd_tx, &remote_addr, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => { let _ = socket.send(Message::Pong(data)).await; }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(device_id = %device_id, "device disconnected");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => { warn!(device_id = %device_id, "binary frames are not supported"); }
                    Some(Err(e)) => { warn!(device_id = %device_id, error = %e, "websocket error"); break; }
                }
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() { break; }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ServerCommand::Deliver(msg)) => { if !send(&mut socket, &msg).await { break; } }
                    Some(ServerCommand::Close { code, reason }) => {
                        let _ = socket.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        }))).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.unregister(&device_id, &cmd_tx).await;
    state.pending.drop_for_sender(&cmd_tx).await;
    state.pending.fail_targeting(&device_id).await;
    state.pairing.purge_for_initiator(&device_id).await;
    let _ = roles;
    info!(device_id = %device_id, "session cleaned up");
}

/// Waits for the mandatory first `register` frame, validates it, and
/// installs the connection record. Returns `None` if registration
/// failed (the socket has already been replied to and closed).
async fn register(
    socket: &mut WebSocket,
    state: &AppState,
    remote_addr: &str,
) -> Option<(String, Vec<String>, mpsc::UnboundedSender<ServerCommand>, mpsc::UnboundedReceiver<ServerCommand>)> {
    let frame = match tokio::time::timeout(REGISTER_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some("timeout waiting for register".into()) }).await;
            close(socket, 1008, "no register frame").await;
            return None;
        }
    };

    let parsed = match WsMessage::from_json(&frame) {
        Ok(WsMessage::Register { device_id, shared_secret, available_roles }) => (device_id, shared_secret, available_roles),
        Ok(_) => {
            let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some("expected register".into()) }).await;
            close(socket, 1008, "invalid register").await;
            return None;
        }
        Err(e) => {
            let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some(format!("invalid JSON: {e}")) }).await;
            close(socket, 1008, "invalid register").await;
            return None;
        }
    };
    let (device_id, shared_secret, available_roles) = parsed;

    let Some(canon_device) = canonicalize_device_id(&device_id) else {
        let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some("invalid device id".into()) }).await;
        close(socket, 1008, "invalid register").await;
        return None;
    };

    if shared_secret != state.config.shared_secret {
        let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some("auth failed".into()) }).await;
        close(socket, 1008, "auth failed").await;
        return None;
    }

    if let Some(allowlist) = &state.config.device_allowlist {
        if !allowlist.contains(&canon_device) {
            let _ = send(socket, &WsMessage::RegisterAck { ok: false, device_id: None, error: Some("device not allowlisted".into()) }).await;
            close(socket, 1008, "device not allowlisted").await;
            return None;
        }
    }

    let roles = canonicalize_roles(&available_roles);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    state
        .registry
        .register(ConnectionRecord {
            device_id: canon_device.clone(),
            roles: roles.clone(),
            connected_since: crate::registry::now_millis(),
            remote_addr: remote_addr.to_owned(),
            cmd_tx: cmd_tx.clone(),
        })
        .await;

    if !send(socket, &WsMessage::RegisterAck { ok: true, device_id: Some(canon_device.clone()), error: None }).await {
        state.registry.unregister(&canon_device, &cmd_tx).await;
        return None;
    }

    Some((canon_device, roles, cmd_tx, cmd_rx))
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

/// Dispatches one parsed text frame for an already-registered
/// connection. Returns `false` if the connection loop should end.
async fn dispatch(
    socket: &mut WebSocket,
    state: &AppState,
    device_id: &str,
    cmd_tx: &mpsc::UnboundedSender<ServerCommand>,
    remote_addr: &str,
    text: &str,
) -> bool {
    let msg = match WsMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = send(socket, &WsMessage::Error { error: Some(format!("invalid_json: {e}")) }).await;
            return true;
        }
    };

    match msg {
        WsMessage::XSend { message_id, from_device, to_device, content, from_role, target_role, metadata } => {
            if let Some(reply) = router::handle_xsend(state, device_id, cmd_tx, message_id, from_device, to_device, content, from_role, target_role, metadata).await {
                let _ = send(socket, &reply).await;
            }
        }
        WsMessage::XAck { message_id, ok, accepted, queued, verified, status, error, .. } => {
            if let Some(reply) = router::handle_xack(state, device_id, message_id, ok, accepted, queued, verified, status, error).await {
                let _ = send(socket, &reply).await;
            }
        }
        WsMessage::XDiscovery { request_id, .. } => {
            let reply = router::handle_xdiscovery(state, request_id).await;
            let _ = send(socket, &reply).await;
        }
        WsMessage::PairingInit {} => {
            let reply = router::handle_pairing_init(state, device_id).await;
            let _ = send(socket, &reply).await;
        }
        WsMessage::PairingJoin { code } => {
            let relay_url = state.config.effective_public_url();
            let result = router::handle_pairing_join(state, device_id, &code, remote_addr, &relay_url).await;
            let _ = send(socket, &result.reply_to_joiner).await;
            if let Some((initiator_tx, msg)) = result.push_to_initiator {
                let _ = initiator_tx.send(ServerCommand::Deliver(msg));
            }
        }
        WsMessage::Ping { ts } => { let _ = send(socket, &WsMessage::Pong { ts }).await; }
        WsMessage::Register { .. } => {
            let _ = send(socket, &WsMessage::Error { error: Some("already registered".into()) }).await;
        }
        other => {
            warn!(device_id = %device_id, frame = ?other, "unhandled frame kind");
        }
    }
    true
}
