//! `auth.*` actions: registration, login, binding a session to a socket,
//! logout and the active-session listing.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::session::{CreateSession, IssuedSession};
use crate::auth::tokens::{check_password, hash_password_blocking};
use crate::db::store::StoreError;
use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, NoPayload, RequestContext, Validate, Violations};
use crate::gateway::registry::DisconnectTarget;
use crate::models::account::Account;
use crate::models::membership::Membership;
use crate::models::session::RevokeReason;
use crate::permissions::GlobalFlags;
use crate::rate_limit::LoginLimiter;
use crate::AppState;

use super::respond;
use mise_common::id::{prefix, prefixed_ulid};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;
const MAX_EMAIL_LEN: usize = 254;
const MAX_DISPLAY_NAME_LEN: usize = 64;

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn check_email(v: &mut Violations, email: &str) {
    let email = email.trim();
    v.required(email, "email");
    if !email.is_empty() {
        v.check(
            email.len() <= MAX_EMAIL_LEN && email.contains('@'),
            "email",
            "must be a valid email address",
        );
    }
}

/// Session summary returned by login and authenticate.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub account: Account,
}

impl SessionGrant {
    pub fn issued(issued: IssuedSession, account: Account) -> Self {
        Self {
            session_id: issued.session.id,
            session_token: Some(issued.token),
            expires_at: issued.session.expires_at,
            account,
        }
    }
}

/// Check an email/password pair under a per-IP failure limiter.
///
/// Unknown email and wrong password look the same to the caller, down to
/// the Argon2 work done. The attempt is counted before the password is
/// checked.
pub async fn verify_credentials(
    state: &AppState,
    limiter: &LoginLimiter,
    ip: IpAddr,
    email: &str,
    password: &str,
) -> Result<Account, GatewayError> {
    limiter.reserve(ip)?;

    let account = state.store.find_account_by_email(&normalize_email(email)).await?;
    let stored = account.as_ref().map(|a| a.password_hash.clone());
    let matched = check_password(password.to_owned(), stored).await?;
    let Some(account) = account.filter(|_| matched) else {
        tracing::info!(%ip, "login failed");
        return Err(GatewayError::invalid_credentials());
    };

    if account.disabled {
        return Err(GatewayError::AccountDisabled);
    }
    limiter.record_success(ip);
    Ok(account)
}

// ---------------------------------------------------------------------------
// auth.register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub email: String,
    pub password: String,
    pub display_name: String,
    #[serde(default)]
    pub invitation_code: Option<String>,
}

impl Validate for RegisterPayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut v = Violations::new();
        check_email(&mut v, &self.email);
        v.check(
            (MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&self.password.chars().count()),
            "password",
            "must be between 8 and 128 characters",
        )
        .required(&self.display_name, "displayName")
        .check(
            self.display_name.trim().chars().count() <= MAX_DISPLAY_NAME_LEN,
            "displayName",
            "must be at most 64 characters",
        );
        v.finish()
    }
}

pub struct Register;

#[async_trait]
impl Action for Register {
    type Payload = RegisterPayload;
    const KEY: &'static str = "auth.register";
    const ACCESS: Access = Access::Public;

    async fn run(&self, ctx: RequestContext, p: RegisterPayload) -> Result<Value, GatewayError> {
        let state = &ctx.state;
        let now = state.clock.now();

        let invitation = match p.invitation_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let invitation = state
                    .store
                    .find_invitation(code)
                    .await?
                    .filter(|inv| inv.is_redeemable(now))
                    .ok_or_else(|| GatewayError::not_found("Invitation not found or expired"))?;
                Some(invitation)
            }
            None => None,
        };

        let account = Account {
            id: prefixed_ulid(prefix::ACCOUNT),
            email: normalize_email(&p.email),
            display_name: p.display_name.trim().to_string(),
            password_hash: hash_password_blocking(p.password.clone()).await?,
            global_flags: GlobalFlags::DEFAULT,
            disabled: false,
            created_at: now,
        };
        match state.store.insert_account(&account).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(GatewayError::conflict("An account with this email already exists"));
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(account_id = %account.id, "account registered");

        let mut membership: Option<Membership> = None;
        if let Some(inv) = invitation {
            if state.store.accept_invitation(&inv.code, now).await? {
                let m = Membership {
                    tenant_id: inv.tenant_id.clone(),
                    account_id: account.id.clone(),
                    access_flags: inv.access_flags,
                    priority: inv.priority,
                    joined_at: now,
                };
                state.store.upsert_membership(&m).await?;
                membership = Some(m);
            } else {
                tracing::warn!(code = %inv.code, account_id = %account.id, "invitation claimed concurrently");
            }
        }

        let grant = open_session(&ctx, &account, membership.as_ref().map(|m| m.tenant_id.clone())).await?;
        if let Some(m) = &membership {
            state.registry.set_active_tenant(&ctx.connection.id, Some(&m.tenant_id));
        }

        Ok(json!({
            "session": respond(&grant)?,
            "membership": respond(&membership)?,
        }))
    }
}

/// Create a session for `account` and bind it to the calling connection.
async fn open_session(
    ctx: &RequestContext,
    account: &Account,
    tenant_id: Option<String>,
) -> Result<SessionGrant, GatewayError> {
    let conn = &ctx.connection;
    let issued = ctx
        .state
        .sessions
        .create(
            &account.id,
            CreateSession {
                user_agent: conn.user_agent.clone(),
                ip_address: Some(conn.remote_ip.to_string()),
                tenant_id,
            },
        )
        .await?;

    ctx.state
        .registry
        .authenticate(&conn.id, &account.id, &issued.session.id, account.global_flags);
    Ok(SessionGrant::issued(issued, account.clone()))
}

// ---------------------------------------------------------------------------
// auth.login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

impl Validate for LoginPayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut v = Violations::new();
        check_email(&mut v, &self.email);
        v.check(!self.password.is_empty(), "password", "is required");
        v.finish()
    }
}

pub struct Login;

#[async_trait]
impl Action for Login {
    type Payload = LoginPayload;
    const KEY: &'static str = "auth.login";
    const ACCESS: Access = Access::Public;

    async fn run(&self, ctx: RequestContext, p: LoginPayload) -> Result<Value, GatewayError> {
        let account = verify_credentials(
            &ctx.state,
            &ctx.state.ws_login_limiter,
            ctx.connection.remote_ip,
            &p.email,
            &p.password,
        )
        .await?;

        let grant = open_session(&ctx, &account, None).await?;
        respond(&grant)
    }
}

// ---------------------------------------------------------------------------
// auth.authenticate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub session_token: String,
}

impl Validate for AuthenticatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new().required(&self.session_token, "sessionToken").finish()
    }
}

/// Bind an existing session to this connection. Reachable without a bound
/// session, since that is what it establishes.
pub struct Authenticate;

#[async_trait]
impl Action for Authenticate {
    type Payload = AuthenticatePayload;
    const KEY: &'static str = "auth.authenticate";
    const ACCESS: Access = Access::Public;

    async fn run(&self, ctx: RequestContext, p: AuthenticatePayload) -> Result<Value, GatewayError> {
        let validated = ctx.state.sessions.validate(p.session_token.trim()).await?;
        let (session, account) = (validated.session, validated.account);

        ctx.state
            .registry
            .authenticate(&ctx.connection.id, &account.id, &session.id, account.global_flags);

        respond(&SessionGrant {
            session_id: session.id,
            session_token: None,
            expires_at: session.expires_at,
            account,
        })
    }
}

// ---------------------------------------------------------------------------
// auth.logout
// ---------------------------------------------------------------------------

pub struct Logout;

#[async_trait]
impl Action for Logout {
    type Payload = NoPayload;
    const KEY: &'static str = "auth.logout";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, _: NoPayload) -> Result<Value, GatewayError> {
        let session_id = ctx.identity()?.session.id.clone();
        let revoked = ctx.state.sessions.revoke(&session_id, RevokeReason::Logout).await?;
        ctx.state.registry.deauthenticate(&ctx.connection.id);
        Ok(json!({ "revoked": revoked }))
    }
}

// ---------------------------------------------------------------------------
// auth.logout_all
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutAllPayload {
    /// Also end the session making this request.
    #[serde(default)]
    pub include_current: bool,
}

impl Validate for LogoutAllPayload {}

/// Revoke the account's other sessions and close the sockets bound to them.
pub struct LogoutAll;

#[async_trait]
impl Action for LogoutAll {
    type Payload = LogoutAllPayload;
    const KEY: &'static str = "auth.logout_all";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: LogoutAllPayload) -> Result<Value, GatewayError> {
        let identity = ctx.identity()?;
        let account_id = identity.account.id.clone();
        let current = identity.session.id.clone();

        let except = if p.include_current { None } else { Some(current.as_str()) };
        let revoked = ctx
            .state
            .sessions
            .revoke_all_for_account(&account_id, RevokeReason::Security, except)
            .await?;

        let mut closed = 0;
        for session_id in &revoked {
            if *session_id == current {
                // This socket stays open to receive the response.
                ctx.state.registry.deauthenticate(&ctx.connection.id);
                continue;
            }
            closed += ctx
                .state
                .registry
                .disconnect(DisconnectTarget::Session(session_id), "logout_all");
        }

        Ok(json!({ "revokedCount": revoked.len(), "closedConnections": closed }))
    }
}

// ---------------------------------------------------------------------------
// auth.sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    id: String,
    user_agent: Option<String>,
    ip_address: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    current: bool,
}

pub struct Sessions;

#[async_trait]
impl Action for Sessions {
    type Payload = NoPayload;
    const KEY: &'static str = "auth.sessions";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, _: NoPayload) -> Result<Value, GatewayError> {
        let identity = ctx.identity()?;
        let sessions = ctx.state.sessions.list_for_account(&identity.account.id).await?;

        let summaries: Vec<SessionSummary> = sessions
            .into_iter()
            .map(|s| SessionSummary {
                current: s.id == identity.session.id,
                id: s.id,
                user_agent: s.user_agent,
                ip_address: s.ip_address,
                created_at: s.created_at,
                last_activity_at: s.last_activity_at,
                expires_at: s.expires_at,
            })
            .collect();
        Ok(json!({ "sessions": respond(&summaries)? }))
    }
}
