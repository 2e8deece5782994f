//! Per-socket connection state.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::permissions::GlobalFlags;
use crate::rate_limit::{FixedWindow, WindowLimit};
use mise_common::id::{prefix, prefixed_ulid};

/// Request ids remembered per connection for duplicate detection.
const RECENT_REQUEST_CAPACITY: usize = 256;

/// Frames queued for the socket's write task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Close { code: u16, reason: String },
}

/// Identity bound to a connection. Empty until authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub account_id: Option<String>,
    pub session_id: Option<String>,
    pub global_flags: GlobalFlags,
    pub active_tenant_id: Option<String>,
}

impl AuthSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Bounded set of recently seen request ids, oldest evicted first.
#[derive(Debug, Default)]
struct RecentRequests {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentRequests {
    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > RECENT_REQUEST_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// A live client socket.
///
/// Identity, active tenant and subscriptions are written only by
/// [`ConnectionRegistry`](super::registry::ConnectionRegistry) so its indexes
/// never disagree with the connection.
pub struct Connection {
    pub id: String,
    pub remote_ip: IpAddr,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    auth: Mutex<AuthSnapshot>,
    message_limit: WindowLimit,
    throttle: Mutex<FixedWindow>,
    subscriptions: Mutex<HashSet<String>>,
    recent_requests: Mutex<RecentRequests>,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    pub fn new(
        remote_ip: IpAddr,
        user_agent: Option<String>,
        connected_at: DateTime<Utc>,
        message_limit: WindowLimit,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id: prefixed_ulid(prefix::CONNECTION),
            remote_ip,
            user_agent,
            connected_at,
            auth: Mutex::new(AuthSnapshot::default()),
            message_limit,
            throttle: Mutex::new(FixedWindow::new(connected_at, message_limit)),
            subscriptions: Mutex::new(HashSet::new()),
            recent_requests: Mutex::new(RecentRequests::default()),
            tx,
        }
    }

    pub fn auth(&self) -> AuthSnapshot {
        self.auth.lock().clone()
    }

    pub fn account_id(&self) -> Option<String> {
        self.auth.lock().account_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.auth.lock().session_id.clone()
    }

    pub fn active_tenant_id(&self) -> Option<String> {
        self.auth.lock().active_tenant_id.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.lock().is_authenticated()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        channels.sort();
        channels
    }

    pub(super) fn set_auth(&self, auth: AuthSnapshot) -> AuthSnapshot {
        std::mem::replace(&mut *self.auth.lock(), auth)
    }

    pub(super) fn set_active_tenant(&self, tenant_id: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.auth.lock().active_tenant_id, tenant_id)
    }

    pub(super) fn add_subscription(&self, channel: &str) -> bool {
        self.subscriptions.lock().insert(channel.to_string())
    }

    pub(super) fn remove_subscription(&self, channel: &str) -> bool {
        self.subscriptions.lock().remove(channel)
    }

    /// Remove and return every subscription matching `pred`.
    pub(super) fn drain_subscriptions(&self, pred: impl Fn(&str) -> bool) -> Vec<String> {
        let mut subs = self.subscriptions.lock();
        let matched: Vec<String> = subs.iter().filter(|c| pred(c)).cloned().collect();
        for channel in &matched {
            subs.remove(channel);
        }
        matched
    }

    /// Count one inbound message against the connection's window.
    ///
    /// Returns the seconds until the window resets when over the limit.
    pub fn throttle(&self, now: DateTime<Utc>) -> Result<(), u64> {
        self.throttle.lock().hit(now, self.message_limit)
    }

    /// Record a request id. Returns `false` if it was seen recently.
    pub fn remember_request(&self, request_id: &str) -> bool {
        self.recent_requests.lock().insert(request_id)
    }

    /// Queue a text frame without waiting.
    ///
    /// Returns `false` if the outbound queue is full or the socket is gone.
    pub fn send(&self, frame: Arc<str>) -> bool {
        self.tx.try_send(Outbound::Text(frame)).is_ok()
    }

    /// Queue a response frame, waiting for room in the queue.
    ///
    /// Events are best-effort; responses are not. Returns `false` only once
    /// the socket's write task is gone.
    pub async fn respond(&self, frame: Arc<str>) -> bool {
        self.tx.send(Outbound::Text(frame)).await.is_ok()
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(json.into()),
            Err(e) => {
                tracing::error!(connection_id = %self.id, ?e, "failed to serialize outbound frame");
                false
            }
        }
    }

    /// Ask the write task to close the socket.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.tx
            .try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_ip", &self.remote_ip)
            .field("auth", &*self.auth.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    use chrono::Duration;

    let (tx, rx) = mpsc::channel(capacity);
    let conn = Connection::new(
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        Some("test-agent".into()),
        Utc::now(),
        WindowLimit::new(100, Duration::seconds(60)),
        tx,
    );
    (Arc::new(conn), rx)
}
