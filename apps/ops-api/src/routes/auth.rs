//! HTTP auth routes: password login, current session, logout.

use axum::extract::State;
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::{ClientIp, SessionAuth};
use crate::auth::session::CreateSession;
use crate::error::{ApiErrorBody, GatewayError};
use crate::gateway::registry::DisconnectTarget;
use crate::handlers::auth::verify_credentials;
use crate::models::account::Account;
use crate::models::session::{RevokeReason, Session};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/session", get(current_session))
        .route("/auth/logout", post(logout))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub global_flags: u64,
}

impl From<Account> for AccountInfo {
    fn from(a: Account) -> Self {
        Self {
            id: a.id,
            email: a.email,
            display_name: a.display_name,
            global_flags: a.global_flags.bits(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
    /// Only returned by login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub account: AccountInfo,
}

impl SessionResponse {
    fn new(session: &Session, token: Option<String>, account: Account) -> Self {
        Self {
            session_id: session.id.clone(),
            session_token: token,
            expires_at: session.expires_at,
            account: account.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session created", body = SessionResponse),
        (status = 401, description = "Invalid email or password", body = ApiErrorBody),
        (status = 403, description = "Account disabled", body = ApiErrorBody),
        (status = 429, description = "Too many failed attempts", body = ApiErrorBody),
    ),
)]
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, GatewayError> {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return Err(GatewayError::invalid_credentials());
    }

    let account =
        verify_credentials(&state, &state.http_login_limiter, ip, &body.email, &body.password).await?;

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let issued = state
        .sessions
        .create(
            &account.id,
            CreateSession {
                user_agent,
                ip_address: Some(ip.to_string()),
                tenant_id: None,
            },
        )
        .await?;

    tracing::info!(account_id = %account.id, session_id = %issued.session.id, "http login");
    Ok(Json(SessionResponse::new(&issued.session, Some(issued.token), account)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/auth/session
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/auth/session",
    tag = "Auth",
    security(("session" = [])),
    responses(
        (status = 200, description = "The caller's session", body = SessionResponse),
        (status = 401, description = "Missing or unusable session", body = ApiErrorBody),
    ),
)]
pub async fn current_session(auth: SessionAuth) -> Json<SessionResponse> {
    Json(SessionResponse::new(&auth.session, None, auth.account))
}

// ---------------------------------------------------------------------------
// POST /api/v1/auth/logout
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "Auth",
    security(("session" = [])),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 401, description = "Missing or unusable session", body = ApiErrorBody),
    ),
)]
pub async fn logout(
    State(state): State<AppState>,
    auth: SessionAuth,
) -> Result<StatusCode, GatewayError> {
    state.sessions.revoke(&auth.session.id, RevokeReason::Logout).await?;
    let closed = state
        .registry
        .disconnect(DisconnectTarget::Session(&auth.session.id), "logout");

    tracing::info!(session_id = %auth.session.id, closed, "http logout");
    Ok(StatusCode::NO_CONTENT)
}
