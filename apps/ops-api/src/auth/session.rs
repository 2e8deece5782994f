//! Session lifecycle: issue, validate with sliding expiry, revoke.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::auth::tokens::{generate_session_token, TokenHasher};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::store::Store;
use crate::error::GatewayError;
use crate::models::account::Account;
use crate::models::session::{RevokeReason, Session};
use mise_common::id::{prefix, prefixed_ulid};

/// Transport metadata recorded on a new session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub tenant_id: Option<String>,
}

/// A newly created session and its bearer token.
///
/// The raw token exists only here; it is never stored.
#[derive(Debug)]
pub struct IssuedSession {
    pub token: String,
    pub session: Session,
}

/// A session that passed validation, with its account.
#[derive(Debug, Clone)]
pub struct Validated {
    pub session: Session,
    pub account: Account,
}

pub struct SessionService {
    store: Arc<dyn Store>,
    hasher: TokenHasher,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    extend_threshold: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            store,
            hasher: TokenHasher::new(&config.token_secret),
            clock,
            ttl: config.session_ttl,
            extend_threshold: config.session_extend_threshold,
        }
    }

    pub async fn create(
        &self,
        account_id: &str,
        meta: CreateSession,
    ) -> Result<IssuedSession, GatewayError> {
        let now = self.clock.now();
        let token = generate_session_token();
        let session = Session {
            id: prefixed_ulid(prefix::SESSION),
            token_hash: self.hasher.hash(&token),
            account_id: account_id.to_string(),
            tenant_id: meta.tenant_id,
            user_agent: meta.user_agent,
            ip_address: meta.ip_address,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.ttl,
            revoked_at: None,
            revoked_reason: None,
        };
        self.store.insert_session(&session).await?;

        tracing::info!(session_id = %session.id, account_id, "session created");
        Ok(IssuedSession { token, session })
    }

    /// Validate a bearer token.
    pub async fn validate(&self, token: &str) -> Result<Validated, GatewayError> {
        if token.is_empty() {
            return Err(GatewayError::SessionInvalid);
        }
        let session = self
            .store
            .find_session_by_token_hash(&self.hasher.hash(token))
            .await?;
        self.verify(session).await
    }

    /// Re-validate a session already bound to a connection.
    pub async fn check(&self, session_id: &str) -> Result<Validated, GatewayError> {
        let session = self.store.find_session(session_id).await?;
        self.verify(session).await
    }

    async fn verify(&self, session: Option<Session>) -> Result<Validated, GatewayError> {
        let mut session = session.ok_or(GatewayError::SessionInvalid)?;
        let now = self.clock.now();

        if session.revoked_at.is_some() {
            return Err(GatewayError::SessionRevoked);
        }
        if now >= session.expires_at {
            return Err(GatewayError::SessionExpired);
        }

        let account = self
            .store
            .find_account(&session.account_id)
            .await?
            .ok_or(GatewayError::SessionInvalid)?;
        if account.disabled {
            return Err(GatewayError::AccountDisabled);
        }

        if self.should_extend(&session, now) {
            session.last_activity_at = now;
            session.expires_at = now + self.ttl;
            self.spawn_extend(&session);
        }

        Ok(Validated { session, account })
    }

    fn should_extend(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_activity_at > self.extend_threshold
    }

    /// Persist the new expiry off the request path. Failures are only logged.
    fn spawn_extend(&self, session: &Session) {
        let store = self.store.clone();
        let id = session.id.clone();
        let last_activity_at = session.last_activity_at;
        let expires_at = session.expires_at;
        tokio::spawn(async move {
            if let Err(err) = store.touch_session(&id, last_activity_at, expires_at).await {
                tracing::warn!(session_id = %id, ?err, "failed to extend session");
            }
        });
    }

    /// Returns `false` if the session was unknown or already revoked.
    pub async fn revoke(&self, session_id: &str, reason: RevokeReason) -> Result<bool, GatewayError> {
        let revoked = self
            .store
            .revoke_session(session_id, reason, self.clock.now())
            .await?;
        if revoked {
            tracing::info!(session_id, %reason, "session revoked");
        }
        Ok(revoked)
    }

    /// Revoke every live session of an account except `except_session_id`.
    pub async fn revoke_all_for_account(
        &self,
        account_id: &str,
        reason: RevokeReason,
        except_session_id: Option<&str>,
    ) -> Result<Vec<String>, GatewayError> {
        let revoked = self
            .store
            .revoke_sessions_for_account(account_id, reason, self.clock.now(), except_session_id)
            .await?;
        tracing::info!(account_id, %reason, count = revoked.len(), "sessions revoked");
        Ok(revoked)
    }

    /// Live sessions of an account, newest first.
    pub async fn list_for_account(&self, account_id: &str) -> Result<Vec<Session>, GatewayError> {
        let now = self.clock.now();
        let sessions = self.store.list_sessions_for_account(account_id).await?;
        Ok(sessions.into_iter().filter(|s| s.is_usable(now)).collect())
    }
}
