//! Gateway wire format.
//!
//! Every frame is a JSON object discriminated by `type`:
//! - client → server: `request`, `ping`
//! - server → client: `response`, `error`, `event`, `pong`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorBody;
use mise_common::id::{prefix, prefixed_ulid};

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Request(RequestEnvelope),
    Ping(PingFrame),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    pub category: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl RequestEnvelope {
    /// `category.action`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.category, self.action)
    }
}

/// Transport keepalive. Never rate limited.
#[derive(Debug, Deserialize)]
pub struct PingFrame {
    #[serde(default)]
    pub timestamp: Option<Value>,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Response,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    pub fn success(request_id: impl Into<String>, data: Value, at: DateTime<Utc>) -> Self {
        Self {
            id: prefixed_ulid(prefix::RESPONSE),
            kind: ResponseKind::Response,
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: at,
        }
    }

    pub fn error(request_id: impl Into<String>, error: ErrorBody, at: DateTime<Utc>) -> Self {
        Self {
            id: prefixed_ulid(prefix::RESPONSE),
            kind: ResponseKind::Error,
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error),
            timestamp: at,
        }
    }
}

/// Answer to a [`PingFrame`], echoing the caller's timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PongFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    pub timestamp: Option<Value>,
    pub server_time: DateTime<Utc>,
}

impl PongFrame {
    pub fn new(timestamp: Option<Value>, at: DateTime<Utc>) -> Self {
        Self {
            kind: "pong",
            timestamp,
            server_time: at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Unsolicited server push.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    pub category: String,
    pub action: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<EventScope>,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        category: impl Into<String>,
        action: impl Into<String>,
        data: Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "event",
            category: category.into(),
            action: action.into(),
            data,
            scope: None,
            timestamp: at,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.scope = Some(EventScope {
            tenant_id: Some(tenant_id.into()),
        });
        self
    }
}
