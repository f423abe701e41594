//! Wire schema and frame-level normalization for the cross-device relay.
//!
//! This crate is a pure library: it defines [`WsMessage`], the discriminated
//! union of every frame the relay and the bridge exchange, plus the
//! canonicalization rules (`canonicalize_device_id`, `canonicalize_role`) and
//! structured-message normalization (`normalize_structured`) that every other
//! crate in the workspace builds on. Nothing here touches a socket.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Nack / info status strings used on `xack` and `error` frames.
///
/// These are the only values the relay is allowed to emit in the `status`
/// field of a negative `xack`; clients should match on them as opaque
/// strings rather than attempt to parse structure out of them.
pub mod status {
    pub const SENDER_NOT_REGISTERED: &str = "sender_not_registered";
    pub const SENDER_MISMATCH: &str = "sender_mismatch";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const TARGET_ROLE_REJECTED: &str = "target_role_rejected";
    pub const TARGET_OFFLINE: &str = "target_offline";
    pub const TARGET_SEND_FAILED: &str = "target_send_failed";
    pub const TARGET_DISCONNECTED: &str = "target_disconnected";
    pub const TARGET_ACK_TIMEOUT: &str = "target_ack_timeout";
    pub const ACK_SENDER_MISMATCH: &str = "ack_sender_mismatch";
    pub const SUPERSEDED: &str = "superseded";

    /// Default `status` applied to a successful ack whose target omitted one.
    pub const BRIDGE_DELIVERED: &str = "bridge_delivered";
    /// Default `status` applied to a failed ack whose target omitted one.
    pub const BRIDGE_DELIVERY_FAILED: &str = "bridge_delivery_failed";
}

/// Pairing-only failure reasons. No other strings may appear in
/// `pairing-failed` frames.
pub mod pairing_reason {
    pub const INVALID_CODE: &str = "invalid_code";
    pub const EXPIRED: &str = "expired";
    pub const RATE_LIMITED: &str = "rate_limited";
}

/// The single coordinating role a remote `xsend` is permitted to target.
pub const COORDINATOR_ROLE: &str = "architect";

/// Alphabet for pairing codes: uppercase and digits, with `0 O 1 I`
/// removed so a code can be read aloud or copied off a screen without
/// ambiguity.
pub const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Errors produced while decoding or validating a frame, before it is
/// handed to router logic.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid_json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid_payload: {0}")]
    InvalidPayload(String),
}

/// Canonicalizes a device identifier: uppercase, restricted to
/// `[A-Z0-9_-]`, trimmed of everything else. Returns `None` if nothing
/// survives the filter.
#[must_use]
pub fn canonicalize_device_id(raw: &str) -> Option<String> {
    let canon: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    (!canon.is_empty()).then_some(canon)
}

/// Canonicalizes a single role token: lowercase, restricted to
/// `[a-z0-9_-]`.
#[must_use]
pub fn canonicalize_role(raw: &str) -> Option<String> {
    let canon: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    (!canon.is_empty()).then_some(canon)
}

/// Canonicalizes a list of roles, dropping empties and duplicates while
/// preserving first-seen order.
#[must_use]
pub fn canonicalize_roles(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|r| canonicalize_role(r))
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

/// Accepts `availableRoles` either as a JSON array of strings or as a
/// single comma/whitespace-separated string, per the Frame Codec's role
/// list contract.
fn deserialize_roles<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RolesInput {
        List(Vec<String>),
        Delimited(String),
    }
    Ok(match RolesInput::deserialize(deserializer)? {
        RolesInput::List(list) => list,
        RolesInput::Delimited(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_owned)
            .filter(|part| !part.is_empty())
            .collect(),
    })
}

/// The bounded vocabulary of structured bridge-message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StructuredType {
    #[serde(rename = "FYI")]
    Fyi,
    ConflictCheck,
    Blocker,
    Approval,
    ConflictResult,
    ApprovalResult,
}

impl StructuredType {
    /// Case-insensitive lookup against the canonical vocabulary.
    #[must_use]
    pub fn normalize(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "fyi" => Some(Self::Fyi),
            "conflictcheck" => Some(Self::ConflictCheck),
            "blocker" => Some(Self::Blocker),
            "approval" => Some(Self::Approval),
            "conflictresult" => Some(Self::ConflictResult),
            "approvalresult" => Some(Self::ApprovalResult),
            _ => None,
        }
    }
}

/// `metadata.structured` envelope carried on `xsend` / `xdeliver`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredMessage {
    #[serde(rename = "type")]
    pub kind: StructuredType,
    pub payload: serde_json::Value,
}

/// Builds the `metadata.structured` envelope for an outbound `xdeliver`,
/// applying the fallback-to-FYI rule: a recognized type passes through
/// untouched, an unrecognized one is downgraded to `Fyi` with a
/// synthesized status payload that preserves the caller's original type
/// string under `originalType`.
#[must_use]
pub fn normalize_structured(
    raw_type: Option<&str>,
    raw_payload: Option<serde_json::Value>,
    fallback_content: &str,
) -> StructuredMessage {
    match raw_type.and_then(StructuredType::normalize) {
        Some(kind) => StructuredMessage {
            kind,
            payload: raw_payload.unwrap_or(serde_json::Value::Null),
        },
        None => {
            let mut payload = serde_json::json!({
                "category": "status",
                "detail": fallback_content,
                "impact": "context-only",
            });
            if let Some(serde_json::Value::Object(extra)) = raw_payload {
                if let serde_json::Value::Object(ref mut map) = payload {
                    map.extend(extra);
                }
            }
            if let Some(t) = raw_type {
                if let serde_json::Value::Object(ref mut map) = payload {
                    map.insert("originalType".into(), serde_json::Value::String(t.into()));
                }
            }
            StructuredMessage {
                kind: StructuredType::Fyi,
                payload,
            }
        }
    }
}

/// Free-form routing metadata attached to `xsend` / `xdeliver`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredMessage>,
    #[serde(rename = "targetRole", skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<serde_json::Value>,
}

/// One entry in an `xdiscovery` reply's `connected_devices` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub device_id: String,
    pub roles: Vec<String>,
    pub connected_since: i64,
}

/// Every frame exchanged between a bridge and the relay, tagged on the
/// wire by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsMessage {
    Register {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "sharedSecret")]
        shared_secret: String,
        #[serde(rename = "availableRoles", default, deserialize_with = "deserialize_roles")]
        available_roles: Vec<String>,
    },
    RegisterAck {
        ok: bool,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "xsend")]
    XSend {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "fromDevice")]
        from_device: String,
        #[serde(rename = "toDevice")]
        to_device: String,
        content: String,
        #[serde(rename = "fromRole", default)]
        from_role: Option<String>,
        #[serde(rename = "targetRole", default)]
        target_role: Option<String>,
        #[serde(default)]
        metadata: Metadata,
    },
    #[serde(rename = "xdeliver")]
    XDeliver {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "fromDevice")]
        from_device: String,
        #[serde(rename = "toDevice")]
        to_device: String,
        content: String,
        #[serde(rename = "fromRole", default)]
        from_role: Option<String>,
        #[serde(rename = "targetRole")]
        target_role: String,
        #[serde(default)]
        metadata: Metadata,
    },
    #[serde(rename = "xack")]
    XAck {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        ok: Option<bool>,
        #[serde(default)]
        accepted: Option<bool>,
        #[serde(default)]
        queued: Option<bool>,
        #[serde(default)]
        verified: Option<bool>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(rename = "fromDevice", default)]
        from_device: Option<String>,
        #[serde(rename = "toDevice", default)]
        to_device: Option<String>,
        /// Present only on a `target_offline` nack, and only when the
        /// target device has never been seen by this relay instance.
        #[serde(rename = "unknownDevice", default, skip_serializing_if = "Option::is_none")]
        unknown_device: Option<String>,
        /// Present only on a `target_offline` nack: the currently
        /// connected devices, to aid operator debugging.
        #[serde(rename = "connectedDevices", default, skip_serializing_if = "Option::is_none")]
        connected_devices: Option<Vec<ConnectedDevice>>,
    },
    /// Both the discovery request and its reply travel as this one frame
    /// type: a request carries only `request_id` (if any); the reply
    /// additionally sets `ok` and `connected_devices`, echoing
    /// `request_id` back under its snake_case name.
    #[serde(rename = "xdiscovery")]
    XDiscovery {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connected_devices: Option<Vec<ConnectedDevice>>,
    },
    PairingInit {},
    PairingInitAck {
        code: String,
        expires_at: i64,
    },
    PairingJoin {
        code: String,
    },
    PairingComplete {
        device_id: String,
        shared_secret: String,
        relay_url: String,
        paired_device_id: String,
    },
    PairingFailed {
        reason: String,
    },
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    Pong {
        #[serde(default)]
        ts: Option<i64>,
    },
    Info {
        #[serde(default)]
        status: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<String>,
    },
}

impl WsMessage {
    /// Parses a single text frame's payload. Unknown fields are ignored
    /// by `serde` by default; an unrecognized `type` tag is the only
    /// rejection case surfaced here.
    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(CodecError::from)
    }

    /// Serializes a frame to its wire JSON form.
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_device_id() {
        assert_eq!(canonicalize_device_id(" dev-a_1 "), Some("DEV-A_1".into()));
        assert_eq!(canonicalize_device_id("!!!"), None);
        assert_eq!(canonicalize_device_id("héllo"), Some("LLO".into()));
    }

    #[test]
    fn canonicalizes_role() {
        assert_eq!(canonicalize_role(" Architect "), Some("architect".into()));
        assert_eq!(canonicalize_role(""), None);
    }

    #[test]
    fn canonicalize_roles_dedupes_preserving_order() {
        let raw = vec!["Builder".to_string(), "builder".to_string(), "Oracle".to_string()];
        assert_eq!(canonicalize_roles(&raw), vec!["builder", "oracle"]);
    }

    #[test]
    fn structured_type_roundtrips_known_values() {
        assert_eq!(StructuredType::normalize("blocker"), Some(StructuredType::Blocker));
        assert_eq!(StructuredType::normalize("APPROVALRESULT"), Some(StructuredType::ApprovalResult));
        assert_eq!(StructuredType::normalize("something-else"), None);
    }

    #[test]
    fn normalize_structured_passes_through_known_type() {
        let msg = normalize_structured(Some("Approval"), Some(serde_json::json!({"summary": "ok"})), "fallback");
        assert_eq!(msg.kind, StructuredType::Approval);
        assert_eq!(msg.payload["summary"], "ok");
    }

    #[test]
    fn normalize_structured_downgrades_unknown_type_to_fyi() {
        let msg = normalize_structured(Some("WeirdType"), None, "hello there");
        assert_eq!(msg.kind, StructuredType::Fyi);
        assert_eq!(msg.payload["originalType"], "WeirdType");
        assert_eq!(msg.payload["detail"], "hello there");
        assert_eq!(msg.payload["impact"], "context-only");
    }

    #[test]
    fn normalize_structured_with_no_metadata_builds_minimal_fyi() {
        let msg = normalize_structured(None, None, "just text");
        assert_eq!(msg.kind, StructuredType::Fyi);
        assert_eq!(msg.payload["detail"], "just text");
    }

    #[test]
    fn xsend_round_trips_through_json() {
        let frame = WsMessage::XSend {
            message_id: "m1".into(),
            from_device: "A".into(),
            to_device: "B".into(),
            content: "hello".into(),
            from_role: None,
            target_role: Some("architect".into()),
            metadata: Metadata::default(),
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"xsend\""));
        let back = WsMessage::from_json(&json).unwrap();
        match back {
            WsMessage::XSend { message_id, to_device, .. } => {
                assert_eq!(message_id, "m1");
                assert_eq!(to_device, "B");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn register_ack_omits_absent_optional_fields() {
        let frame = WsMessage::RegisterAck { ok: true, device_id: Some("A".into()), error: None };
        let json = frame.to_json().unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn available_roles_accepts_a_delimited_string() {
        let parsed = WsMessage::from_json(
            r#"{"type":"register","deviceId":"A","sharedSecret":"s","availableRoles":"architect, builder"}"#,
        )
        .unwrap();
        match parsed {
            WsMessage::Register { available_roles, .. } => {
                assert_eq!(available_roles, vec!["architect", "builder"]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn pairing_complete_and_discovery_reply_use_snake_case_on_the_wire() {
        let complete = WsMessage::PairingComplete {
            device_id: "A".into(),
            shared_secret: "abc".into(),
            relay_url: "ws://x".into(),
            paired_device_id: "B".into(),
        };
        let json = complete.to_json().unwrap();
        assert!(json.contains("\"paired_device_id\":\"B\""));
        assert!(json.contains("\"relay_url\":\"ws://x\""));

        let discovery = WsMessage::XDiscovery {
            request_id: Some("r1".into()),
            ok: Some(true),
            connected_devices: Some(vec![ConnectedDevice {
                device_id: "A".into(),
                roles: vec!["architect".into()],
                connected_since: 0,
            }]),
        };
        let json = discovery.to_json().unwrap();
        assert!(json.contains("\"type\":\"xdiscovery\""));
        assert!(json.contains("\"request_id\":\"r1\""));
        assert!(json.contains("\"connected_devices\":["));
        assert!(json.contains("\"device_id\":\"A\""));
    }

    #[test]
    fn unknown_type_tag_is_a_codec_error() {
        let err = WsMessage::from_json(r#"{"type":"not-a-real-type"}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson(_)));
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        let err = WsMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson(_)));
    }
}
