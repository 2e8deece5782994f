#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ops_api::auth::tokens::hash_password;
use ops_api::clock::SystemClock;
use ops_api::config::Config;
use ops_api::db::memory::MemoryStore;
use ops_api::db::store::Store;
use ops_api::models::account::Account;
use ops_api::models::membership::Membership;
use ops_api::models::tenant::Tenant;
use ops_api::permissions::{GlobalFlags, MembershipFlags, Priority};
use ops_api::AppState;
use mise_common::id::{prefix, prefixed_ulid};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PASSWORD: &str = "correct horse battery";

pub fn test_config() -> Config {
    Config::with_secret("integration-test-secret")
}

/// Build a test AppState over an in-memory store.
pub fn test_state_with(config: Config) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(config, store.clone(), Arc::new(SystemClock));
    (state, store)
}

pub fn test_state() -> (AppState, Arc<MemoryStore>) {
    test_state_with(test_config())
}

/// Build the full application router wired to the given state.
pub fn test_app(state: &AppState) -> Router {
    ops_api::routes::router().with_state(state.clone())
}

/// Start an actual TCP server for WebSocket testing. Runs in the background.
pub async fn start_server(state: &AppState) -> SocketAddr {
    let app = test_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    addr
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Insert an account whose password is [`PASSWORD`].
pub async fn seed_account(state: &AppState, email: &str) -> Account {
    let account = Account {
        id: prefixed_ulid(prefix::ACCOUNT),
        email: email.to_string(),
        display_name: email.split('@').next().unwrap_or(email).to_string(),
        password_hash: hash_password(PASSWORD).expect("hash password"),
        global_flags: GlobalFlags::DEFAULT,
        disabled: false,
        created_at: chrono::Utc::now(),
    };
    state.store.insert_account(&account).await.expect("insert account");
    account
}

/// Create a tenant owned by `owner`.
pub async fn seed_tenant(state: &AppState, owner: &Account, name: &str) -> Tenant {
    let now = chrono::Utc::now();
    let tenant = Tenant {
        id: prefixed_ulid(prefix::TENANT),
        name: name.to_string(),
        owner_id: owner.id.clone(),
        created_at: now,
    };
    let membership = Membership {
        tenant_id: tenant.id.clone(),
        account_id: owner.id.clone(),
        access_flags: MembershipFlags::ALL,
        priority: Priority::OWNER,
        joined_at: now,
    };
    state
        .store
        .insert_tenant(&tenant, &membership)
        .await
        .expect("insert tenant");
    tenant
}

pub async fn add_member(
    state: &AppState,
    tenant: &Tenant,
    account: &Account,
    flags: MembershipFlags,
    priority: i32,
) {
    let membership = Membership {
        tenant_id: tenant.id.clone(),
        account_id: account.id.clone(),
        access_flags: flags,
        priority: Priority(priority),
        joined_at: chrono::Utc::now(),
    };
    state
        .store
        .upsert_membership(&membership)
        .await
        .expect("upsert membership");
}

// ---------------------------------------------------------------------------
// WebSocket client helpers
// ---------------------------------------------------------------------------

pub async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("ws connect");
    ws
}

pub async fn connect_with_token(addr: SocketAddr, token: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut Ws, frame: &Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Next text frame as JSON, skipping transport pings.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("parse frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got: {other:?}"),
        }
    }
}

/// Send a request frame without waiting for its response.
pub async fn send_request(ws: &mut Ws, id: &str, key: &str, payload: Value) {
    let (category, action) = key.split_once('.').expect("category.action");
    send_json(
        ws,
        &json!({
            "id": id,
            "type": "request",
            "category": category,
            "action": action,
            "payload": payload,
            "timestamp": chrono::Utc::now(),
        }),
    )
    .await;
}

/// Send a request and wait for the response carrying its id. Events that
/// arrive first are skipped.
pub async fn request(ws: &mut Ws, id: &str, key: &str, payload: Value) -> Value {
    send_request(ws, id, key, payload).await;
    loop {
        let frame = next_json(ws).await;
        if frame["requestId"] == id {
            return frame;
        }
    }
}

/// Wait for the next event frame, skipping anything else.
pub async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "event" {
            return frame;
        }
    }
}

/// Wait for the server to close the socket and return the close frame.
pub async fn expect_close(ws: &mut Ws) -> Option<CloseFrame> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Log in over a socket and return the raw session token.
pub async fn ws_login(ws: &mut Ws, email: &str) -> String {
    let resp = request(ws, "login", "auth.login", json!({ "email": email, "password": PASSWORD })).await;
    assert_eq!(resp["success"], true, "login failed: {resp}");
    resp["data"]["sessionToken"]
        .as_str()
        .expect("sessionToken present")
        .to_string()
}
