//! Inbound frame dispatch: decode, throttle, route, validate, authorize, run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};

use super::action::{Access, Action, RequestContext, Route};
use super::connection::Connection;
use super::events::{ClientFrame, PongFrame, RequestEnvelope, ResponseEnvelope};
use crate::error::{FieldError, GatewayError};
use crate::AppState;

/// Answered inline, ahead of the rate limiter.
pub const SYSTEM_PING: &str = "system.ping";

/// Routing table from `category.action` to handler.
#[derive(Default)]
pub struct MessageRouter {
    routes: HashMap<&'static str, Arc<dyn Route>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its key. A later registration replaces an
    /// earlier one with the same key.
    pub fn register<A: Action>(&mut self, action: A) -> &mut Self {
        if self.routes.insert(A::KEY, Arc::new(action)).is_some() {
            tracing::warn!(key = A::KEY, "gateway action registered twice");
        }
        self
    }

    pub fn has_route(&self, key: &str) -> bool {
        key == SYSTEM_PING || self.routes.contains_key(key)
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self.routes.keys().copied().collect();
        keys.push(SYSTEM_PING);
        keys.sort_unstable();
        keys
    }

    pub fn access(&self, key: &str) -> Option<Access> {
        if key == SYSTEM_PING {
            return Some(Access::Public);
        }
        self.routes.get(key).map(|r| r.access())
    }

    /// Process one text frame and produce the frame to send back.
    ///
    /// Never fails: every problem becomes an error envelope correlated with
    /// the request id when one could be read.
    pub async fn handle_frame(&self, state: &AppState, conn: &Arc<Connection>, text: &str) -> String {
        let expose = state.config.expose_internal_errors;
        let now = state.clock.now();

        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(connection_id = %conn.id, error = %e, "malformed frame");
                let err = GatewayError::invalid_field("frame", "Malformed JSON");
                return encode(&ResponseEnvelope::error("", err.to_body(expose), now));
            }
        };
        let request_id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let frame: ClientFrame = match serde_json::from_value(raw) {
            Ok(f) => f,
            Err(e) => {
                let err = GatewayError::Validation(vec![FieldError::new("frame", e.to_string())]);
                return encode(&ResponseEnvelope::error(request_id, err.to_body(expose), now));
            }
        };

        let request = match frame {
            ClientFrame::Ping(ping) => return encode(&PongFrame::new(ping.timestamp, now)),
            ClientFrame::Request(request) => request,
        };

        let result = self.dispatch(state, conn, &request).await;
        let envelope = match result {
            Ok(data) => ResponseEnvelope::success(request.id, data, state.clock.now()),
            Err(err) => {
                log_failure(conn, &request, &err);
                ResponseEnvelope::error(request.id, err.to_body(expose), state.clock.now())
            }
        };
        encode(&envelope)
    }

    async fn dispatch(
        &self,
        state: &AppState,
        conn: &Arc<Connection>,
        request: &RequestEnvelope,
    ) -> Result<Value, GatewayError> {
        let key = request.routing_key();

        if key == SYSTEM_PING {
            return Ok(json!({ "pong": true, "timestamp": request.timestamp }));
        }

        if request.id.trim().is_empty() {
            return Err(GatewayError::invalid_field("id", "is required"));
        }

        conn.throttle(state.clock.now()).map_err(|retry_after_secs| {
            GatewayError::RateLimited {
                message: format!("Too many messages. Try again in {retry_after_secs} seconds."),
                retry_after_secs,
            }
        })?;

        let route = self
            .routes
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| GatewayError::UnknownAction(key.clone()))?;

        let call = route.clone().prepare(request.payload.clone())?;

        let identity = match route.access() {
            Access::Public => None,
            Access::Authenticated => Some(authorize(state, conn).await?),
        };

        // Only ids that reach the handler are spent; a rejected request may
        // be retried under the same id.
        if !conn.remember_request(&request.id) {
            return Err(GatewayError::DuplicateRequest(request.id.clone()));
        }

        let ctx = RequestContext::new(state.clone(), conn.clone(), request.id.clone(), identity);
        match AssertUnwindSafe(call(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                tracing::error!(connection_id = %conn.id, key, %detail, "gateway handler panicked");
                Err(GatewayError::internal(format!("handler for {key} panicked: {detail}")))
            }
        }
    }
}

/// Re-check the connection's bound session. A session that is no longer
/// usable is unbound from the connection; the socket stays open.
async fn authorize(
    state: &AppState,
    conn: &Connection,
) -> Result<crate::auth::session::Validated, GatewayError> {
    let session_id = conn.session_id().ok_or(GatewayError::SessionRequired)?;

    match state.sessions.check(&session_id).await {
        Ok(validated) => Ok(validated),
        Err(err) => {
            if err.is_session_failure() {
                tracing::info!(connection_id = %conn.id, %session_id, code = err.code(), "bound session rejected");
                state.registry.deauthenticate(&conn.id);
            }
            Err(err)
        }
    }
}

fn log_failure(conn: &Connection, request: &RequestEnvelope, err: &GatewayError) {
    match err {
        GatewayError::Internal(message) => tracing::error!(
            connection_id = %conn.id,
            request_id = %request.id,
            category = %request.category,
            action = %request.action,
            %message,
            "request failed"
        ),
        other => tracing::debug!(
            connection_id = %conn.id,
            request_id = %request.id,
            category = %request.category,
            action = %request.action,
            code = other.code(),
            "request rejected"
        ),
    }
}

fn encode<T: serde::Serialize>(frame: &T) -> String {
    serde_json::to_string(frame).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode outbound frame");
        r#"{"type":"error","success":false,"error":{"code":"INTERNAL_ERROR","message":"An internal error occurred"}}"#.to_string()
    })
}
