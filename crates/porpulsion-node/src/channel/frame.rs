// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire frames for the peer channel — UTF-8 JSON text, three shapes:
//!
//! ```text
//! Request  {"id": "<uuid-hex>", "type": "<method>", "payload": {...}}
//! Reply    {"id": "<same>",     "type": "reply",    "ok": true|false,
//!           "payload": {...},   "error": "<str>"}     # error only when ok=false
//! Push     {"type": "<event>",  "payload": {...}}     # no id — fire-and-forget
//! ```
//!
//! Known method types: `remoteapp/receive`, `remoteapp/status`,
//! `remoteapp/delete`, `remoteapp/scale`, `remoteapp/detail`,
//! `remoteapp/spec-update`, `remoteapp/logs`, `proxy/request`,
//! `peer/disconnect`, `version/announce`, `ping`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const REPLY: &str = "reply";
pub const PING: &str = "ping";
pub const VERSION_ANNOUNCE: &str = "version/announce";
pub const PEER_DISCONNECT: &str = "peer/disconnect";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id; absent on pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn request(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Frame {
            id: Some(id.into()),
            kind: kind.into(),
            ok: None,
            error: None,
            payload,
        }
    }

    pub fn push(kind: impl Into<String>, payload: Value) -> Self {
        Frame {
            id: None,
            kind: kind.into(),
            ok: None,
            error: None,
            payload,
        }
    }

    pub fn reply_ok(id: impl Into<String>, payload: Value) -> Self {
        Frame {
            id: Some(id.into()),
            kind: REPLY.to_string(),
            ok: Some(true),
            error: None,
            payload,
        }
    }

    pub fn reply_err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Frame {
            id: Some(id.into()),
            kind: REPLY.to_string(),
            ok: Some(false),
            error: Some(error.into()),
            payload: Value::Object(Default::default()),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_has_no_id_on_the_wire() {
        let json = serde_json::to_value(Frame::push(PING, serde_json::json!({}))).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn reply_err_carries_error_and_ok_false() {
        let json =
            serde_json::to_value(Frame::reply_err("abc", "unknown type: remoteapp/freeze"))
                .unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "unknown type: remoteapp/freeze");
        assert_eq!(json["type"], "reply");
    }

    #[test]
    fn request_round_trip() {
        let frame = Frame::request("id1", "remoteapp/receive", serde_json::json!({"name": "x"}));
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id.as_deref(), Some("id1"));
        assert_eq!(back.kind, "remoteapp/receive");
        assert_eq!(back.payload["name"], "x");
        assert!(back.ok.is_none());
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let back: Frame = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(back.payload.is_null());
        assert!(back.id.is_none());
    }
}
