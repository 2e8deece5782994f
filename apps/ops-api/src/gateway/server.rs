//! WebSocket upgrade handler and per-connection read/write loops.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::middleware::ClientIp;
use crate::auth::session::Validated;
use crate::error::GatewayError;
use crate::AppState;

use super::connection::{Connection, Outbound};
use super::events::ResponseEnvelope;

/// Frames a connection may have queued before sends start failing.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Session token that pre-authenticates the connection.
    pub token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    // A bad token is refused before the upgrade.
    let pre_auth = match query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => Some(state.sessions.validate(token).await?),
        None => None,
    };

    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let max = state.config.max_frame_bytes;

    Ok(ws
        .max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, ip, user_agent, pre_auth))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    ip: IpAddr,
    user_agent: Option<String>,
    pre_auth: Option<Validated>,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let conn = Arc::new(Connection::new(
        ip,
        user_agent,
        state.clock.now(),
        state.config.message_rate,
        tx,
    ));
    state.registry.register(conn.clone());
    if let Some(Validated { session, account }) = pre_auth {
        state
            .registry
            .authenticate(&conn.id, &account.id, &session.id, account.global_flags);
    }

    tracing::info!(
        connection_id = %conn.id,
        %ip,
        authenticated = conn.is_authenticated(),
        "gateway connection opened"
    );

    let mut writer = tokio::spawn(write_loop(conn.id.clone(), ws_tx, rx));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Each request runs on its own task; responses are
                        // correlated by request id, not by order.
                        let state = state.clone();
                        let conn = conn.clone();
                        tokio::spawn(async move {
                            let reply = state.router.handle_frame(&state, &conn, text.as_str()).await;
                            if !conn.respond(reply.into()).await {
                                tracing::debug!(connection_id = %conn.id, "response dropped, socket closed");
                            }
                        });
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = GatewayError::invalid_field("frame", "Binary frames are not supported");
                        conn.send_json(&ResponseEnvelope::error(
                            "",
                            err.to_body(state.config.expose_internal_errors),
                            state.clock.now(),
                        ));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %conn.id, "ws read error");
                        break;
                    }
                }
            }

            // The write side finished: a close was requested or the socket broke.
            _ = &mut writer => break,
        }
    }

    state.registry.unregister(&conn.id);
    writer.abort();

    tracing::info!(
        connection_id = %conn.id,
        account_id = ?conn.account_id(),
        "gateway connection closed"
    );
}

/// Drain the connection's outbound queue into the socket.
async fn write_loop(
    connection_id: String,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = ws_tx.send(Message::Text(text.as_ref().into())).await {
                    tracing::debug!(?e, %connection_id, "ws write error");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                if let Err(e) = send_close(&mut ws_tx, code, &reason).await {
                    tracing::debug!(?e, %connection_id, "failed to send close frame");
                }
                break;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
