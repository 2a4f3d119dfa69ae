//! Application-layer JSON message vocabulary.
//!
//! The broker itself moves opaque payloads; it never parses them. This module
//! is the vocabulary the demo binary and the end-to-end tests speak *inside*
//! those payloads, one JSON document per frame:
//!
//! ```text
//! {
//!   "ver": "1.0",
//!   "type": "Hello|Welcome|Heartbeat|Request|Response|Notify|Goodbye|Error",
//!   "msgId": "req-3a04f1",
//!   "clientId": "CLI-001",        // on client-scoped types
//!   "timestamp": 1733800000000,   // milliseconds UTC, sender-assigned
//!   "payload": { ... }            // shape depends on "type"
//! }
//! ```
//!
//! Request/response matching is by `msgId`: a `Response` carries the `msgId`
//! of the `Request` it answers (see [`Envelope::response_to`]).

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::now_ms;

/// Protocol version stamped into every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

// ─── Envelope ──────────────────────────────────────────────────────────────

/// One application-layer message, JSON-encoded into a frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// First structured message a client sends after the bind handshake.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Protocol version, currently `"1.0"`.
        ver: String,
        /// Unique message id.
        msg_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Client self-description.
        payload: HelloPayload,
    },

    /// Server's reply to `Hello`.
    #[serde(rename_all = "camelCase")]
    Welcome {
        /// Protocol version.
        ver: String,
        /// Unique message id.
        msg_id: String,
        /// The identifier the client is bound under.
        client_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Server self-description.
        payload: WelcomePayload,
    },

    /// Periodic client keepalive.
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Protocol version.
        ver: String,
        /// Unique message id.
        msg_id: String,
        /// Sending client's identifier.
        client_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Monotonic sequence counter.
        payload: HeartbeatPayload,
    },

    /// RPC-style request; the server answers with a `Response` carrying the
    /// same `msg_id`.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Protocol version.
        ver: String,
        /// Unique message id, echoed by the matching `Response`.
        msg_id: String,
        /// Sending client's identifier.
        client_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Action name plus free-form parameters.
        payload: RequestPayload,
    },

    /// Server's answer to a `Request`.
    #[serde(rename_all = "camelCase")]
    Response {
        /// Protocol version.
        ver: String,
        /// The `msg_id` of the `Request` this answers.
        msg_id: String,
        /// Addressed client's identifier.
        client_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Free-form result document.
        payload: Value,
    },

    /// Unsolicited server push, typically broadcast.
    #[serde(rename_all = "camelCase")]
    Notify {
        /// Protocol version.
        ver: String,
        /// Unique message id.
        msg_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Free-form notification document.
        payload: Value,
    },

    /// Client announces it is about to disconnect.
    #[serde(rename_all = "camelCase")]
    Goodbye {
        /// Protocol version.
        ver: String,
        /// Unique message id.
        msg_id: String,
        /// Sending client's identifier.
        client_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Disconnect reason.
        payload: GoodbyePayload,
    },

    /// Failure report for a request or a protocol problem.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Protocol version.
        ver: String,
        /// The `msg_id` of the offending message where applicable, otherwise
        /// a fresh id.
        msg_id: String,
        /// Sender-assigned milliseconds UTC.
        timestamp: u64,
        /// Machine-readable code and human-readable message.
        error: ErrorInfo,
    },
}

// ─── Payload types ─────────────────────────────────────────────────────────

/// `Hello` payload: who is connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Application name.
    pub app_name: String,
    /// Application version string.
    pub app_version: String,
    /// The identifier the client bound (or intends to bind) with.
    pub client_id_hint: String,
    /// Client process id.
    pub pid: u32,
}

/// `Welcome` payload: who is serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Broker/server version string.
    pub server_version: String,
}

/// `Heartbeat` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Monotonic per-client sequence number.
    pub seq: u64,
}

/// `Request` payload: an action name plus free-form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Action name, e.g. `"ping"` or `"SetConfig"`.
    pub action: String,
    /// Action parameters, passed through untouched.
    pub params: Value,
}

/// `Goodbye` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    /// Why the client is leaving, e.g. `"UserExit"`.
    pub reason: String,
}

/// `Error` detail carried in the `error` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code, e.g. `"BadRequest"`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

// ─── Constructors & codec ──────────────────────────────────────────────────

impl Envelope {
    /// A `Hello` announcing this process under `client_id`.
    pub fn hello(client_id: &str, app_name: &str, app_version: &str) -> Self {
        Self::Hello {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("hello"),
            timestamp: now_ms(),
            payload: HelloPayload {
                app_name: app_name.to_owned(),
                app_version: app_version.to_owned(),
                client_id_hint: client_id.to_owned(),
                pid: std::process::id(),
            },
        }
    }

    /// A `Welcome` addressed to `client_id`, carrying this crate's version.
    pub fn welcome(client_id: &str) -> Self {
        Self::Welcome {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("welcome"),
            client_id: client_id.to_owned(),
            timestamp: now_ms(),
            payload: WelcomePayload {
                server_version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        }
    }

    /// A `Heartbeat` with sequence number `seq`.
    pub fn heartbeat(client_id: &str, seq: u64) -> Self {
        Self::Heartbeat {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("hb"),
            client_id: client_id.to_owned(),
            timestamp: now_ms(),
            payload: HeartbeatPayload { seq },
        }
    }

    /// A `Request` invoking `action` with `params`.
    pub fn request(client_id: &str, action: &str, params: Value) -> Self {
        Self::Request {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("req"),
            client_id: client_id.to_owned(),
            timestamp: now_ms(),
            payload: RequestPayload {
                action: action.to_owned(),
                params,
            },
        }
    }

    /// A `Response` answering the request identified by `request_msg_id`.
    pub fn response_to(request_msg_id: &str, client_id: &str, payload: Value) -> Self {
        Self::Response {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: request_msg_id.to_owned(),
            client_id: client_id.to_owned(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// An unsolicited `Notify` push.
    pub fn notify(payload: Value) -> Self {
        Self::Notify {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("notify"),
            timestamp: now_ms(),
            payload,
        }
    }

    /// A `Goodbye` announcing disconnect for `reason`.
    pub fn goodbye(client_id: &str, reason: &str) -> Self {
        Self::Goodbye {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("bye"),
            client_id: client_id.to_owned(),
            timestamp: now_ms(),
            payload: GoodbyePayload {
                reason: reason.to_owned(),
            },
        }
    }

    /// An `Error` report.
    pub fn error(code: &str, message: &str) -> Self {
        Self::Error {
            ver: PROTOCOL_VERSION.to_owned(),
            msg_id: make_msg_id("err"),
            timestamp: now_ms(),
            error: ErrorInfo {
                code: code.to_owned(),
                message: message.to_owned(),
            },
        }
    }

    /// Serialize to the JSON bytes that go into a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("envelope serialization cannot fail")
    }

    /// Parse an envelope from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| anyhow!("invalid envelope JSON: {e}"))
    }
}

/// Generate a process-unique message id: `{prefix}-{seq}{rand}`.
///
/// A monotonic counter guarantees uniqueness within the process; the random
/// suffix keeps ids from colliding across processes sharing a broker.
pub fn make_msg_id(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("{prefix}-{seq:x}{rand:04x}")
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heartbeat_wire_shape() {
        let hb = Envelope::heartbeat("CLI-001", 7);
        let value: Value = serde_json::from_slice(&hb.encode()).unwrap();

        assert_eq!(value["type"], "Heartbeat");
        assert_eq!(value["ver"], PROTOCOL_VERSION);
        assert_eq!(value["clientId"], "CLI-001");
        assert_eq!(value["payload"]["seq"], 7);
        assert!(value["msgId"].as_str().unwrap().starts_with("hb-"));
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_request_round_trip() {
        let req = Envelope::request("CLI-001", "SetConfig", json!({"logLevel": "Debug"}));
        let decoded = Envelope::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);

        let Envelope::Request { payload, .. } = decoded else {
            panic!("expected Request, got {decoded:?}");
        };
        assert_eq!(payload.action, "SetConfig");
        assert_eq!(payload.params["logLevel"], "Debug");
    }

    #[test]
    fn test_response_carries_request_msg_id() {
        let req = Envelope::request("CLI-001", "ping", json!({}));
        let Envelope::Request { msg_id: req_id, .. } = &req else {
            panic!("expected Request");
        };

        let resp = Envelope::response_to(req_id, "CLI-001", json!({"status": "ok"}));
        let Envelope::Response { msg_id, payload, .. } = resp else {
            panic!("expected Response");
        };
        assert_eq!(&msg_id, req_id);
        assert_eq!(payload["status"], "ok");
    }

    #[test]
    fn test_hello_payload_fields() {
        let hello = Envelope::hello("CLI-001", "pipehub-demo", "0.2.1");
        let value: Value = serde_json::from_slice(&hello.encode()).unwrap();

        assert_eq!(value["type"], "Hello");
        assert_eq!(value["payload"]["appName"], "pipehub-demo");
        assert_eq!(value["payload"]["clientIdHint"], "CLI-001");
        assert_eq!(value["payload"]["pid"], std::process::id());
    }

    #[test]
    fn test_error_shape_uses_error_field() {
        let err = Envelope::error("BadRequest", "params must be an object");
        let value: Value = serde_json::from_slice(&err.encode()).unwrap();

        assert_eq!(value["type"], "Error");
        assert_eq!(value["error"]["code"], "BadRequest");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let bogus = br#"{"ver":"1.0","type":"Telepathy","msgId":"x","timestamp":1}"#;
        assert!(Envelope::decode(bogus).is_err());
    }

    #[test]
    fn test_non_json_rejected() {
        assert!(Envelope::decode(b"\x00\x01\x02").is_err());
    }

    #[test]
    fn test_msg_ids_are_unique() {
        let a = make_msg_id("req");
        let b = make_msg_id("req");
        assert_ne!(a, b, "counter suffix must make consecutive ids distinct");
    }
}
