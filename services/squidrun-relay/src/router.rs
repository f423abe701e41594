use rand::RngCore;
use squidrun_protocol::{
    canonicalize_device_id, normalize_structured, pairing_reason, status, ConnectedDevice,
    Metadata, StructuredMessage, WsMessage, COORDINATOR_ROLE,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::pairing::JoinOutcome;
use crate::registry::ServerCommand;
use crate::state::AppState;

/// Resolves the destination role from the three places the wire format
/// allows it to appear, in priority order: `targetRole`, then
/// `metadata.targetRole`, then `metadata.envelope.target.role`.
fn resolve_target_role(target_role: Option<&str>, metadata: &Metadata) -> Option<String> {
    if let Some(r) = target_role {
        if !r.trim().is_empty() {
            return Some(r.to_owned());
        }
    }
    if let Some(r) = &metadata.target_role {
        if !r.trim().is_empty() {
            return Some(r.clone());
        }
    }
    metadata
        .envelope
        .as_ref()
        .and_then(|v| v.pointer("/target/role"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

fn nack(message_id: &str, from_device: &str, to_device: &str, reason: &str) -> WsMessage {
    WsMessage::XAck {
        message_id: message_id.to_owned(),
        ok: Some(false),
        accepted: Some(false),
        queued: Some(false),
        verified: Some(false),
        status: Some(reason.to_owned()),
        error: Some(reason.to_owned()),
        from_device: Some(from_device.to_owned()),
        to_device: Some(to_device.to_owned()),
        unknown_device: None,
        connected_devices: None,
    }
}

/// Handles an inbound `xsend`. Returns `Some(reply)` when the sender
/// should receive an immediate rejection; returns `None` when the frame
/// was admitted and forwarded — the sender's eventual `xack` arrives
/// later via the pending-ack tracker.
#[allow(clippy::too_many_arguments)]
pub async fn handle_xsend(
    state: &AppState,
    sender_device: &str,
    sender_cmd_tx: &mpsc::UnboundedSender<ServerCommand>,
    message_id: String,
    from_device: String,
    to_device: String,
    content: String,
    from_role: Option<String>,
    target_role: Option<String>,
    metadata: Metadata,
) -> Option<WsMessage> {
    let Some(canon_from) = canonicalize_device_id(&from_device) else {
        return Some(nack(&message_id, &from_device, &to_device, status::INVALID_PAYLOAD));
    };
    if canon_from != sender_device {
        return Some(nack(&message_id, &from_device, &to_device, status::SENDER_MISMATCH));
    }

    let message_id = message_id.trim().to_owned();
    let Some(canon_to) = canonicalize_device_id(&to_device) else {
        return Some(nack(&message_id, &from_device, &to_device, status::INVALID_PAYLOAD));
    };
    if message_id.is_empty() || content.trim().is_empty() {
        return Some(nack(&message_id, &from_device, &canon_to, status::INVALID_PAYLOAD));
    }

    let resolved_role = resolve_target_role(target_role.as_deref(), &metadata);
    if resolved_role.as_deref() != Some(COORDINATOR_ROLE) {
        return Some(nack(&message_id, &canon_from, &canon_to, status::TARGET_ROLE_REJECTED));
    }

    let Some(target) = state.registry.lookup(&canon_to).await else {
        let connected = state.registry.list().await;
        let unknown_device = connected.iter().all(|d| d.device_id != canon_to).then(|| canon_to.clone());
        return Some(offline_nack(&message_id, &canon_from, &canon_to, unknown_device, connected));
    };

    let structured = normalize_structured(
        metadata.structured.as_ref().map(|s| structured_type_str(s)),
        metadata.structured.as_ref().map(|s| s.payload.clone()),
        &content,
    );
    let deliver = WsMessage::XDeliver {
        message_id: message_id.clone(),
        from_device: canon_from.clone(),
        to_device: canon_to.clone(),
        content,
        from_role: Some(from_role.unwrap_or_else(|| COORDINATOR_ROLE.to_owned())),
        target_role: COORDINATOR_ROLE.to_owned(),
        metadata: Metadata {
            structured: Some(structured),
            target_role: Some(COORDINATOR_ROLE.to_owned()),
            envelope: metadata.envelope,
        },
    };

    if target.cmd_tx.send(ServerCommand::Deliver(deliver)).is_err() {
        return Some(nack(&message_id, &canon_from, &canon_to, status::TARGET_SEND_FAILED));
    }

    state
        .pending
        .install(message_id, canon_from, canon_to, sender_cmd_tx.clone(), state.config.pending_ttl)
        .await;
    None
}

fn structured_type_str(msg: &StructuredMessage) -> &'static str {
    match msg.kind {
        squidrun_protocol::StructuredType::Fyi => "FYI",
        squidrun_protocol::StructuredType::ConflictCheck => "ConflictCheck",
        squidrun_protocol::StructuredType::Blocker => "Blocker",
        squidrun_protocol::StructuredType::Approval => "Approval",
        squidrun_protocol::StructuredType::ConflictResult => "ConflictResult",
        squidrun_protocol::StructuredType::ApprovalResult => "ApprovalResult",
    }
}

fn offline_nack(message_id: &str, from_device: &str, to_device: &str, unknown_device: Option<String>, connected: Vec<ConnectedDevice>) -> WsMessage {
    match nack(message_id, from_device, to_device, status::TARGET_OFFLINE) {
        WsMessage::XAck { message_id, ok, accepted, queued, verified, status, error, from_device, to_device, .. } => {
            WsMessage::XAck {
                message_id, ok, accepted, queued, verified, status, error, from_device, to_device,
                unknown_device,
                connected_devices: Some(connected),
            }
        }
        _ => unreachable!("nack always returns an XAck"),
    }
}

/// Handles an inbound `xack`. Forwards the ack to the original sender
/// (via its pending entry) and returns `Some(reply)` only when the
/// acker itself made a protocol error worth echoing back directly.
#[allow(clippy::too_many_arguments)]
pub async fn handle_xack(
    state: &AppState,
    acker_device: &str,
    message_id: String,
    ok: Option<bool>,
    accepted: Option<bool>,
    queued: Option<bool>,
    verified: Option<bool>,
    status_field: Option<String>,
    error: Option<String>,
) -> Option<WsMessage> {
    let Some(entry) = state.pending.take(&message_id).await else {
        // Unknown or already-resolved message id: a late ack. Silently dropped.
        return None;
    };

    if entry.to_device != acker_device {
        // Put the entry back so the legitimate target can still ack it.
        state
            .pending
            .install(message_id.clone(), entry.from_device.clone(), entry.to_device.clone(), entry.sender_cmd_tx.clone(), state.config.pending_ttl)
            .await;
        return Some(nack(&message_id, &entry.from_device, &entry.to_device, status::ACK_SENDER_MISMATCH));
    }

    let verified = verified.unwrap_or(false);
    let accepted = accepted.unwrap_or(false);
    let queued = queued.unwrap_or(false) || accepted;
    // A verified ack implies ok, same as an ok ack implies accepted/queued/verified.
    let ok = ok.unwrap_or(false) || verified;
    let (accepted, queued, verified) = if ok {
        (Some(true), Some(true), Some(true))
    } else {
        (Some(accepted), Some(queued), Some(verified))
    };
    let resolved_status = status_field.unwrap_or_else(|| {
        if ok {
            status::BRIDGE_DELIVERED.to_owned()
        } else {
            status::BRIDGE_DELIVERY_FAILED.to_owned()
        }
    });

    let forwarded = WsMessage::XAck {
        message_id,
        ok: Some(ok),
        accepted,
        queued,
        verified,
        status: Some(resolved_status),
        error,
        from_device: Some(entry.from_device),
        to_device: Some(entry.to_device),
        unknown_device: None,
        connected_devices: None,
    };
    let _ = entry.sender_cmd_tx.send(ServerCommand::Deliver(forwarded));
    None
}

pub async fn handle_xdiscovery(state: &AppState, request_id: Option<String>) -> WsMessage {
    WsMessage::XDiscovery {
        request_id,
        ok: Some(true),
        connected_devices: Some(state.registry.list().await),
    }
}

pub async fn handle_pairing_init(state: &AppState, initiator_device: &str) -> WsMessage {
    match state.pairing.init(initiator_device.to_owned()).await {
        Some((code, expires_at)) => WsMessage::PairingInitAck { code, expires_at },
        None => WsMessage::PairingFailed { reason: pairing_reason::RATE_LIMITED.to_owned() },
    }
}

/// Outcome of a `pairing-join`: the reply for the joining socket, plus
/// an optional push for the initiator's socket (looked up in the
/// registry, which is the only mutable state the pairing engine shares
/// with the rest of the relay).
pub struct PairingJoinResult {
    pub reply_to_joiner: WsMessage,
    pub push_to_initiator: Option<(mpsc::UnboundedSender<ServerCommand>, WsMessage)>,
}

pub async fn handle_pairing_join(state: &AppState, joiner_device: &str, raw_code: &str, source: &str, relay_url: &str) -> PairingJoinResult {
    if let Some(initiator) = state.pairing.peek_initiator(raw_code).await {
        if initiator == joiner_device {
            let tripped = state.pairing.record_failure(raw_code, source).await;
            let reason = if tripped { pairing_reason::RATE_LIMITED } else { pairing_reason::INVALID_CODE };
            return PairingJoinResult {
                reply_to_joiner: WsMessage::PairingFailed { reason: reason.to_owned() },
                push_to_initiator: None,
            };
        }
    }

    match state.pairing.join(raw_code, source).await {
        JoinOutcome::Success { entry } => {
            let shared_secret = random_hex_secret();
            let complete_for_joiner = WsMessage::PairingComplete {
                device_id: joiner_device.to_owned(),
                shared_secret: shared_secret.clone(),
                relay_url: relay_url.to_owned(),
                paired_device_id: entry.initiator_device.clone(),
            };
            let push = match state.registry.lookup(&entry.initiator_device).await {
                Some(initiator_conn) => {
                    let complete_for_initiator = WsMessage::PairingComplete {
                        device_id: entry.initiator_device.clone(),
                        shared_secret,
                        relay_url: relay_url.to_owned(),
                        paired_device_id: joiner_device.to_owned(),
                    };
                    Some((initiator_conn.cmd_tx, complete_for_initiator))
                }
                None => {
                    warn!(initiator = %entry.initiator_device, "pairing completed but initiator socket vanished");
                    None
                }
            };
            PairingJoinResult { reply_to_joiner: complete_for_joiner, push_to_initiator: push }
        }
        JoinOutcome::InvalidCode => PairingJoinResult {
            reply_to_joiner: WsMessage::PairingFailed { reason: pairing_reason::INVALID_CODE.to_owned() },
            push_to_initiator: None,
        },
        JoinOutcome::Expired => PairingJoinResult {
            reply_to_joiner: WsMessage::PairingFailed { reason: pairing_reason::EXPIRED.to_owned() },
            push_to_initiator: None,
        },
        JoinOutcome::RateLimited => PairingJoinResult {
            reply_to_joiner: WsMessage::PairingFailed { reason: pairing_reason::RATE_LIMITED.to_owned() },
            push_to_initiator: None,
        },
    }
}

fn random_hex_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
