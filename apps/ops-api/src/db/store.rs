use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::account::Account;
use crate::models::booking::Booking;
use crate::models::invitation::Invitation;
use crate::models::membership::Membership;
use crate::models::session::{RevokeReason, Session};
use crate::models::tenant::Tenant;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Storage for sessions, accounts, memberships and the records the reference
/// handlers need.
///
/// Backed by Postgres (`PgStore`) in production and an in-memory map
/// (`MemoryStore`) for local runs and tests.
#[async_trait]
pub trait Store: Send + Sync {
    // Accounts

    /// Fails with [`StoreError::Conflict`] if the email is taken.
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError>;
    async fn find_account(&self, id: &str) -> Result<Option<Account>, StoreError>;
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;

    // Sessions

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn find_session_by_token_hash(&self, token_hash: &str)
        -> Result<Option<Session>, StoreError>;

    /// Record activity and push the expiry forward.
    async fn touch_session(
        &self,
        id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns `false` if the session does not exist or was already revoked.
    async fn revoke_session(
        &self,
        id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Revoke every live session of an account, optionally sparing one.
    /// Returns the ids that were revoked by this call.
    async fn revoke_sessions_for_account(
        &self,
        account_id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
        except_session_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError>;

    /// Sessions of an account that have not been revoked, newest first.
    async fn list_sessions_for_account(&self, account_id: &str)
        -> Result<Vec<Session>, StoreError>;

    // Tenants and memberships

    /// Create a tenant together with its owner's membership.
    async fn insert_tenant(&self, tenant: &Tenant, owner: &Membership) -> Result<(), StoreError>;
    async fn find_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError>;
    async fn find_membership(
        &self,
        account_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Membership>, StoreError>;
    async fn upsert_membership(&self, membership: &Membership) -> Result<(), StoreError>;

    /// Returns `false` if there was no such membership.
    async fn delete_membership(&self, account_id: &str, tenant_id: &str)
        -> Result<bool, StoreError>;

    // Invitations

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), StoreError>;
    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError>;

    /// Mark an invitation used. Returns `false` if it was already accepted.
    async fn accept_invitation(&self, code: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    // Bookings

    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError>;
}
