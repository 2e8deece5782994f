//! Request extractors for the HTTP surface: caller address and session.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::GatewayError;
use crate::models::account::Account;
use crate::models::session::Session;
use crate::AppState;

/// Authenticated caller extracted from the `Authorization: Session <token>` header.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub session: Session,
    pub account: Account,
}

impl FromRequestParts<AppState> for SessionAuth {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::SessionRequired)?;

        let token = header
            .strip_prefix("Session ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::SessionInvalid)?;

        let validated = state.sessions.validate(token).await?;
        Ok(SessionAuth {
            session: validated.session,
            account: validated.account,
        })
    }
}

/// Peer address of the TCP connection. Forwarded-for headers are ignored so a
/// client cannot pick its own rate-limit bucket.
///
/// Falls back to `0.0.0.0` when the server was not started with connect info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(ClientIp(ip))
    }
}
