//! Live connection registry with account, session, channel and tenant indexes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::connection::{AuthSnapshot, Connection};
use super::events::EventEnvelope;
use crate::error::code;
use crate::permissions::GlobalFlags;

/// Close code sent to sockets whose session was revoked from elsewhere.
pub const CLOSE_SESSION_REVOKED: u16 = 4001;

/// Which connections [`ConnectionRegistry::disconnect`] should drop.
#[derive(Debug, Clone, Copy)]
pub enum DisconnectTarget<'a> {
    Account(&'a str),
    Session(&'a str),
}

#[derive(Default)]
struct Indexes {
    by_account: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, String>,
    by_channel: HashMap<String, HashSet<String>>,
    by_tenant: HashMap<String, HashSet<String>>,
}

impl Indexes {
    fn unlink(map: &mut HashMap<String, HashSet<String>>, key: &str, connection_id: &str) {
        if let Some(ids) = map.get_mut(key) {
            ids.remove(connection_id);
            if ids.is_empty() {
                map.remove(key);
            }
        }
    }

    fn link(map: &mut HashMap<String, HashSet<String>>, key: &str, connection_id: &str) {
        map.entry(key.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    /// Drop every identity-derived entry for a connection.
    fn unlink_identity(&mut self, connection_id: &str, auth: &AuthSnapshot) {
        if let Some(account_id) = &auth.account_id {
            Self::unlink(&mut self.by_account, account_id, connection_id);
        }
        if let Some(session_id) = &auth.session_id {
            // A later authenticate may have moved the session elsewhere.
            if self.by_session.get(session_id).map(String::as_str) == Some(connection_id) {
                self.by_session.remove(session_id);
            }
        }
        if let Some(tenant_id) = &auth.active_tenant_id {
            Self::unlink(&mut self.by_tenant, tenant_id, connection_id);
        }
    }

    fn unlink_channels(&mut self, connection_id: &str, channels: &[String]) {
        for channel in channels {
            Self::unlink(&mut self.by_channel, channel, connection_id);
        }
    }
}

/// Every live connection, plus lookup indexes kept consistent under one lock.
///
/// Connections are stored in a `DashMap` for lock-free lookups by id. The
/// secondary indexes share a single `parking_lot::Mutex` so any change to a
/// connection's identity updates all of them atomically. The index lock is
/// always taken before a connection's own locks, never the other way round.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    indexes: Mutex<Indexes>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) {
        tracing::debug!(connection_id = %connection.id, ip = %connection.remote_ip, "connection registered");
        self.connections.insert(connection.id.clone(), connection);
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    pub fn snapshot(&self, connection_id: &str) -> Option<AuthSnapshot> {
        self.get(connection_id).map(|c| c.auth())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Bind an identity to a connection.
    ///
    /// A session maps to at most one connection: authenticating a second
    /// connection with the same session id displaces the first mapping.
    /// Returns `false` if the connection is not registered.
    pub fn authenticate(
        &self,
        connection_id: &str,
        account_id: &str,
        session_id: &str,
        global_flags: GlobalFlags,
    ) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };

        let mut idx = self.indexes.lock();
        if !self.connections.contains_key(connection_id) {
            return false;
        }
        let previous = conn.auth();

        // Tenant and channel access belong to the account; a different
        // account starts from nothing.
        let same_account = previous.account_id.as_deref() == Some(account_id);
        let active_tenant_id = if same_account {
            previous.active_tenant_id.clone()
        } else {
            let dropped = conn.drain_subscriptions(|_| true);
            idx.unlink_channels(connection_id, &dropped);
            None
        };
        idx.unlink_identity(connection_id, &previous);

        Indexes::link(&mut idx.by_account, account_id, connection_id);
        if let Some(displaced) = idx
            .by_session
            .insert(session_id.to_string(), connection_id.to_string())
        {
            if displaced != connection_id {
                tracing::debug!(session_id, %displaced, connection_id, "session mapping displaced");
            }
        }
        if let Some(tenant_id) = &active_tenant_id {
            Indexes::link(&mut idx.by_tenant, tenant_id, connection_id);
        }

        conn.set_auth(AuthSnapshot {
            account_id: Some(account_id.to_string()),
            session_id: Some(session_id.to_string()),
            global_flags,
            active_tenant_id,
        });
        drop(idx);

        tracing::info!(connection_id, account_id, session_id, "connection authenticated");
        true
    }

    /// Clear a connection's identity and its channel subscriptions. The
    /// socket stays open.
    pub fn deauthenticate(&self, connection_id: &str) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };

        let mut idx = self.indexes.lock();
        if !self.connections.contains_key(connection_id) {
            return false;
        }
        let previous = conn.set_auth(AuthSnapshot::default());
        idx.unlink_identity(connection_id, &previous);
        let dropped = conn.drain_subscriptions(|_| true);
        idx.unlink_channels(connection_id, &dropped);
        drop(idx);

        if previous.is_authenticated() {
            tracing::info!(
                connection_id,
                account_id = previous.account_id.as_deref().unwrap_or_default(),
                "connection deauthenticated"
            );
        }
        true
    }

    /// Remove a connection from the registry and every index.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(connection_id)?;

        let mut idx = self.indexes.lock();
        idx.unlink_identity(connection_id, &conn.auth());
        idx.unlink_channels(connection_id, &conn.subscriptions());
        drop(idx);

        tracing::debug!(connection_id, "connection unregistered");
        Some(conn)
    }

    /// Set or clear the tenant a connection is working in.
    pub fn set_active_tenant(&self, connection_id: &str, tenant_id: Option<&str>) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };

        let mut idx = self.indexes.lock();
        if !self.connections.contains_key(connection_id) {
            return false;
        }
        if let Some(previous) = conn.set_active_tenant(tenant_id.map(str::to_string)) {
            Indexes::unlink(&mut idx.by_tenant, &previous, connection_id);
        }
        if let Some(tenant_id) = tenant_id {
            Indexes::link(&mut idx.by_tenant, tenant_id, connection_id);
        }
        true
    }

    /// Returns `false` if the connection is unknown or already subscribed.
    pub fn subscribe(&self, connection_id: &str, channel: &str) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };

        let mut idx = self.indexes.lock();
        if !self.connections.contains_key(connection_id) || !conn.add_subscription(channel) {
            return false;
        }
        Indexes::link(&mut idx.by_channel, channel, connection_id);
        true
    }

    /// Returns `false` if the connection is unknown or was not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, channel: &str) -> bool {
        let Some(conn) = self.get(connection_id) else {
            return false;
        };

        let mut idx = self.indexes.lock();
        if !self.connections.contains_key(connection_id) || !conn.remove_subscription(channel) {
            return false;
        }
        Indexes::unlink(&mut idx.by_channel, channel, connection_id);
        true
    }

    /// Drop every subscription of `connection_id` whose name matches `pred`.
    /// Returns how many were removed.
    pub fn unsubscribe_where(&self, connection_id: &str, pred: impl Fn(&str) -> bool) -> usize {
        let Some(conn) = self.get(connection_id) else {
            return 0;
        };

        let mut idx = self.indexes.lock();
        let dropped = conn.drain_subscriptions(pred);
        idx.unlink_channels(connection_id, &dropped);
        dropped.len()
    }

    pub fn connection_for_session(&self, session_id: &str) -> Option<String> {
        self.indexes.lock().by_session.get(session_id).cloned()
    }

    pub fn connections_for_account(&self, account_id: &str) -> Vec<String> {
        Self::sorted(self.indexes.lock().by_account.get(account_id))
    }

    pub fn connections_in_channel(&self, channel: &str) -> Vec<String> {
        Self::sorted(self.indexes.lock().by_channel.get(channel))
    }

    pub fn connections_in_tenant(&self, tenant_id: &str) -> Vec<String> {
        Self::sorted(self.indexes.lock().by_tenant.get(tenant_id))
    }

    fn sorted(ids: Option<&HashSet<String>>) -> Vec<String> {
        let mut ids: Vec<String> = ids.map(|s| s.iter().cloned().collect()).unwrap_or_default();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Every connection authenticated as `account_id`.
    pub fn to_account(&self, account_id: &str, event: &EventEnvelope) -> usize {
        let ids = self.connections_for_account(account_id);
        self.deliver(ids, event)
    }

    /// Every connection subscribed to `channel`.
    pub fn to_channel(&self, channel: &str, event: &EventEnvelope) -> usize {
        let ids = self.connections_in_channel(channel);
        self.deliver(ids, event)
    }

    /// Every connection whose active tenant is `tenant_id`.
    pub fn to_tenant(&self, tenant_id: &str, event: &EventEnvelope) -> usize {
        let ids = self.connections_in_tenant(tenant_id);
        self.deliver(ids, event)
    }

    /// An explicit recipient list. Each connection gets the event once.
    pub fn to_connections(&self, mut ids: Vec<String>, event: &EventEnvelope) -> usize {
        ids.sort();
        ids.dedup();
        self.deliver(ids, event)
    }

    /// Every authenticated connection.
    pub fn to_all(&self, event: &EventEnvelope) -> usize {
        let ids: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.is_authenticated())
            .map(|c| c.key().clone())
            .collect();
        self.deliver(ids, event)
    }

    /// Best-effort fan-out. Failures are logged, never raised.
    /// Returns how many connections the event was queued for.
    fn deliver(&self, ids: Vec<String>, event: &EventEnvelope) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let frame: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::warn!(category = %event.category, action = %event.action, error = %e, "failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        for id in &ids {
            match self.get(id) {
                Some(conn) if conn.send(frame.clone()) => delivered += 1,
                Some(_) => {
                    tracing::warn!(connection_id = %id, category = %event.category, action = %event.action, "failed to send event to client");
                }
                None => {}
            }
        }
        tracing::debug!(
            category = %event.category,
            action = %event.action,
            recipients = ids.len(),
            delivered,
            "broadcast event"
        );
        delivered
    }

    /// Deauthenticate matching connections and ask their sockets to close.
    /// Returns how many connections were affected.
    pub fn disconnect(&self, target: DisconnectTarget<'_>, reason: &str) -> usize {
        let ids = match target {
            DisconnectTarget::Account(account_id) => self.connections_for_account(account_id),
            DisconnectTarget::Session(session_id) => {
                self.connection_for_session(session_id).into_iter().collect()
            }
        };

        let mut count = 0;
        for id in ids {
            let Some(conn) = self.get(&id) else {
                continue;
            };
            self.deauthenticate(&id);
            if !conn.close(CLOSE_SESSION_REVOKED, code::SESSION_REVOKED) {
                tracing::warn!(connection_id = %id, "failed to queue close frame");
            }
            count += 1;
        }
        tracing::info!(?target, reason, count, "connections disconnected");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::{test_connection, Outbound};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn registered(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = test_connection(capacity);
        registry.register(conn.clone());
        (conn, rx)
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new("booking", "created", json!({ "id": "bkg_1" }), chrono::Utc::now())
    }

    #[test]
    fn authenticate_indexes_account_and_session() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = registered(&registry, 4);
        let (b, _rb) = registered(&registry, 4);

        assert!(registry.authenticate(&a.id, "acc_1", "ses_a", GlobalFlags::DEFAULT));
        assert!(registry.authenticate(&b.id, "acc_1", "ses_b", GlobalFlags::DEFAULT));

        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(registry.connections_for_account("acc_1"), expected);
        assert_eq!(registry.connection_for_session("ses_a"), Some(a.id.clone()));
        assert_eq!(a.auth().global_flags, GlobalFlags::DEFAULT);
        assert!(!registry.authenticate("conn_missing", "acc_1", "ses_x", GlobalFlags::EMPTY));
    }

    #[test]
    fn later_authenticate_displaces_session_mapping() {
        let registry = ConnectionRegistry::new();
        let (first, _r1) = registered(&registry, 4);
        let (second, _r2) = registered(&registry, 4);

        registry.authenticate(&first.id, "acc_1", "ses_1", GlobalFlags::EMPTY);
        registry.authenticate(&second.id, "acc_1", "ses_1", GlobalFlags::EMPTY);
        assert_eq!(registry.connection_for_session("ses_1"), Some(second.id.clone()));

        // Tearing down the displaced connection must not drop the new mapping.
        registry.unregister(&first.id);
        assert_eq!(registry.connection_for_session("ses_1"), Some(second.id.clone()));
    }

    #[test]
    fn unregister_clears_every_index() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);

        registry.authenticate(&conn.id, "acc_1", "ses_1", GlobalFlags::EMPTY);
        registry.set_active_tenant(&conn.id, Some("ten_1"));
        registry.subscribe(&conn.id, "tenant:ten_1:bookings");
        registry.subscribe(&conn.id, "account:acc_1");

        assert!(registry.unregister(&conn.id).is_some());
        assert!(registry.get(&conn.id).is_none());
        assert!(registry.connections_for_account("acc_1").is_empty());
        assert!(registry.connection_for_session("ses_1").is_none());
        assert!(registry.connections_in_tenant("ten_1").is_empty());
        assert!(registry.connections_in_channel("tenant:ten_1:bookings").is_empty());
        assert!(registry.connections_in_channel("account:acc_1").is_empty());
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.unregister(&conn.id).is_none());
    }

    #[test]
    fn deauthenticate_drops_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        registry.authenticate(&conn.id, "acc_1", "ses_1", GlobalFlags::DEFAULT);
        registry.set_active_tenant(&conn.id, Some("ten_1"));
        registry.subscribe(&conn.id, "tenant:ten_1:members");

        assert!(registry.deauthenticate(&conn.id));
        assert_eq!(conn.auth(), AuthSnapshot::default());
        assert!(registry.connections_for_account("acc_1").is_empty());
        assert!(registry.connections_in_tenant("ten_1").is_empty());
        assert!(registry.connections_in_channel("tenant:ten_1:members").is_empty());
        assert!(conn.subscriptions().is_empty());
        assert!(registry.get(&conn.id).is_some());
        assert_eq!(registry.to_channel("tenant:ten_1:members", &event()), 0);
    }

    #[test]
    fn switching_account_drops_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        registry.authenticate(&conn.id, "acc_1", "ses_1", GlobalFlags::EMPTY);
        registry.subscribe(&conn.id, "account:acc_1");

        // Same account keeps them.
        registry.authenticate(&conn.id, "acc_1", "ses_2", GlobalFlags::EMPTY);
        assert_eq!(registry.connections_in_channel("account:acc_1"), vec![conn.id.clone()]);

        registry.authenticate(&conn.id, "acc_2", "ses_3", GlobalFlags::EMPTY);
        assert!(registry.connections_in_channel("account:acc_1").is_empty());
        assert!(!conn.is_subscribed("account:acc_1"));
    }

    #[test]
    fn unsubscribe_where_drops_only_matching_channels() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        registry.subscribe(&conn.id, "tenant:ten_1");
        registry.subscribe(&conn.id, "tenant:ten_1:kitchen");
        registry.subscribe(&conn.id, "tenant:ten_2");

        assert_eq!(registry.unsubscribe_where(&conn.id, |c| c.starts_with("tenant:ten_1")), 2);
        assert!(registry.connections_in_channel("tenant:ten_1").is_empty());
        assert!(registry.connections_in_channel("tenant:ten_1:kitchen").is_empty());
        assert_eq!(registry.connections_in_channel("tenant:ten_2"), vec![conn.id.clone()]);
    }

    #[test]
    fn mutations_after_unregister_leave_no_index_entries() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        registry.unregister(&conn.id);

        assert!(!registry.authenticate(&conn.id, "acc_1", "ses_1", GlobalFlags::EMPTY));
        assert!(!registry.set_active_tenant(&conn.id, Some("ten_1")));
        assert!(!registry.subscribe(&conn.id, "tenant:ten_1"));
        assert!(registry.connections_for_account("acc_1").is_empty());
        assert!(registry.connection_for_session("ses_1").is_none());
        assert!(registry.connections_in_tenant("ten_1").is_empty());
        assert!(registry.connections_in_channel("tenant:ten_1").is_empty());
    }

    #[test]
    fn switching_tenant_moves_the_index_entry() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        registry.authenticate(&conn.id, "acc_1", "ses_1", GlobalFlags::EMPTY);

        registry.set_active_tenant(&conn.id, Some("ten_1"));
        registry.set_active_tenant(&conn.id, Some("ten_2"));
        assert!(registry.connections_in_tenant("ten_1").is_empty());
        assert_eq!(registry.connections_in_tenant("ten_2"), vec![conn.id.clone()]);

        // Re-authenticating as the same account keeps the tenant.
        registry.authenticate(&conn.id, "acc_1", "ses_2", GlobalFlags::EMPTY);
        assert_eq!(conn.active_tenant_id().as_deref(), Some("ten_2"));
        assert!(registry.connection_for_session("ses_1").is_none());

        // A different account starts with no tenant.
        registry.authenticate(&conn.id, "acc_2", "ses_3", GlobalFlags::EMPTY);
        assert!(conn.active_tenant_id().is_none());
        assert!(registry.connections_in_tenant("ten_2").is_empty());
        assert!(registry.connections_for_account("acc_1").is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = registered(&registry, 4);
        assert!(registry.subscribe(&conn.id, "tenant:ten_1"));
        assert!(!registry.subscribe(&conn.id, "tenant:ten_1"));
        assert!(registry.unsubscribe(&conn.id, "tenant:ten_1"));
        assert!(!registry.unsubscribe(&conn.id, "tenant:ten_1"));
        assert!(registry.connections_in_channel("tenant:ten_1").is_empty());
    }

    #[tokio::test]
    async fn broadcasts_reach_only_matching_connections() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = registered(&registry, 4);
        let (b, mut rb) = registered(&registry, 4);
        let (_anon, mut ranon) = registered(&registry, 4);

        registry.authenticate(&a.id, "acc_1", "ses_a", GlobalFlags::EMPTY);
        registry.authenticate(&b.id, "acc_2", "ses_b", GlobalFlags::EMPTY);
        registry.set_active_tenant(&a.id, Some("ten_1"));

        assert_eq!(registry.to_tenant("ten_1", &event()), 1);
        assert_eq!(registry.to_account("acc_2", &event()), 1);
        assert_eq!(registry.to_all(&event()), 2);
        assert_eq!(registry.to_channel("nobody", &event()), 0);
        assert_eq!(registry.to_connections(vec![b.id.clone(), b.id.clone()], &event()), 1);

        let Some(Outbound::Text(frame)) = ra.recv().await else {
            panic!("expected a text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["action"], "created");

        assert!(matches!(rb.recv().await, Some(Outbound::Text(_))));
        assert!(ranon.try_recv().is_err());
    }

    #[test]
    fn full_queue_is_skipped_not_raised() {
        let registry = ConnectionRegistry::new();
        let (slow, _rs) = registered(&registry, 1);
        let (fast, _rf) = registered(&registry, 8);
        registry.authenticate(&slow.id, "acc_1", "ses_s", GlobalFlags::EMPTY);
        registry.authenticate(&fast.id, "acc_1", "ses_f", GlobalFlags::EMPTY);

        assert_eq!(registry.to_account("acc_1", &event()), 2);
        // The slow connection's single slot is now taken.
        assert_eq!(registry.to_account("acc_1", &event()), 1);
    }

    #[tokio::test]
    async fn disconnect_session_closes_and_deauthenticates() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = registered(&registry, 4);
        let (b, _rb) = registered(&registry, 4);
        registry.authenticate(&a.id, "acc_1", "ses_a", GlobalFlags::EMPTY);
        registry.authenticate(&b.id, "acc_1", "ses_b", GlobalFlags::EMPTY);

        assert_eq!(registry.disconnect(DisconnectTarget::Session("ses_a"), "logout_all"), 1);
        assert!(!a.is_authenticated());
        assert!(b.is_authenticated());
        assert_eq!(
            ra.recv().await,
            Some(Outbound::Close {
                code: CLOSE_SESSION_REVOKED,
                reason: "SESSION_REVOKED".into()
            })
        );

        assert_eq!(registry.disconnect(DisconnectTarget::Account("acc_1"), "admin"), 1);
        assert!(registry.connections_for_account("acc_1").is_empty());
    }
}
