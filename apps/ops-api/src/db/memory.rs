use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::store::{Store, StoreError};
use crate::models::account::Account;
use crate::models::booking::Booking;
use crate::models::invitation::Invitation;
use crate::models::membership::Membership;
use crate::models::session::{RevokeReason, Session};
use crate::models::tenant::Tenant;

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, Session>,
    tenants: HashMap<String, Tenant>,
    /// Keyed by (tenant_id, account_id).
    memberships: HashMap<(String, String), Membership>,
    invitations: HashMap<String, Invitation>,
    bookings: HashMap<String, Booking>,
}

/// In-process [`Store`] for local runs and tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    session_touches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `touch_session` writes performed so far.
    pub fn session_touches(&self) -> usize {
        self.session_touches.load(Ordering::Relaxed)
    }

    pub fn booking_count(&self) -> usize {
        self.tables.lock().bookings.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if t.accounts.values().any(|a| a.email == account.email) {
            return Err(StoreError::Conflict(format!("account email {}", account.email)));
        }
        t.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.tables.lock().accounts.get(id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .tables
            .lock()
            .accounts
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.tables
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.tables.lock().sessions.get(id).cloned())
    }

    async fn find_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self
            .tables
            .lock()
            .sessions
            .values()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn touch_session(
        &self,
        id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.session_touches.fetch_add(1, Ordering::Relaxed);
        if let Some(s) = self.tables.lock().sessions.get_mut(id) {
            s.last_activity_at = last_activity_at;
            s.expires_at = expires_at;
        }
        Ok(())
    }

    async fn revoke_session(
        &self,
        id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.lock();
        match t.sessions.get_mut(id) {
            Some(s) if s.revoked_at.is_none() => {
                s.revoked_at = Some(at);
                s.revoked_reason = Some(reason);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_sessions_for_account(
        &self,
        account_id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
        except_session_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let mut t = self.tables.lock();
        let mut revoked = Vec::new();
        for s in t.sessions.values_mut() {
            if s.account_id != account_id || s.revoked_at.is_some() {
                continue;
            }
            if except_session_id == Some(s.id.as_str()) {
                continue;
            }
            s.revoked_at = Some(at);
            s.revoked_reason = Some(reason);
            revoked.push(s.id.clone());
        }
        Ok(revoked)
    }

    async fn list_sessions_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<Session>, StoreError> {
        let t = self.tables.lock();
        let mut sessions: Vec<Session> = t
            .sessions
            .values()
            .filter(|s| s.account_id == account_id && s.revoked_at.is_none())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn insert_tenant(&self, tenant: &Tenant, owner: &Membership) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if t.tenants.contains_key(&tenant.id) {
            return Err(StoreError::Conflict(format!("tenant {}", tenant.id)));
        }
        t.tenants.insert(tenant.id.clone(), tenant.clone());
        t.memberships.insert(
            (owner.tenant_id.clone(), owner.account_id.clone()),
            owner.clone(),
        );
        Ok(())
    }

    async fn find_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tables.lock().tenants.get(id).cloned())
    }

    async fn find_membership(
        &self,
        account_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Membership>, StoreError> {
        Ok(self
            .tables
            .lock()
            .memberships
            .get(&(tenant_id.to_string(), account_id.to_string()))
            .cloned())
    }

    async fn upsert_membership(&self, membership: &Membership) -> Result<(), StoreError> {
        self.tables.lock().memberships.insert(
            (membership.tenant_id.clone(), membership.account_id.clone()),
            membership.clone(),
        );
        Ok(())
    }

    async fn delete_membership(
        &self,
        account_id: &str,
        tenant_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .lock()
            .memberships
            .remove(&(tenant_id.to_string(), account_id.to_string()))
            .is_some())
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), StoreError> {
        let mut t = self.tables.lock();
        if t.invitations.contains_key(&invitation.code) {
            return Err(StoreError::Conflict(format!("invitation {}", invitation.code)));
        }
        t.invitations
            .insert(invitation.code.clone(), invitation.clone());
        Ok(())
    }

    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError> {
        Ok(self.tables.lock().invitations.get(code).cloned())
    }

    async fn accept_invitation(&self, code: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut t = self.tables.lock();
        match t.invitations.get_mut(code) {
            Some(inv) if inv.accepted_at.is_none() => {
                inv.accepted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        self.tables
            .lock()
            .bookings
            .insert(booking.id.clone(), booking.clone());
        Ok(())
    }
}
