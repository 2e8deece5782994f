pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod permissions;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;

use auth::session::SessionService;
use clock::Clock;
use config::Config;
use db::store::Store;
use gateway::registry::ConnectionRegistry;
use gateway::router::MessageRouter;
use rate_limit::LoginLimiter;

/// Shared application state available to all route and gateway handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<SessionService>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    /// Failed `auth.login` attempts over the socket, per IP.
    pub ws_login_limiter: Arc<LoginLimiter>,
    /// Failed `POST /api/v1/auth/login` attempts, per IP.
    pub http_login_limiter: Arc<LoginLimiter>,
}

impl AppState {
    /// State with every built-in gateway action registered.
    pub fn new(config: Config, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self::with_router(config, store, clock, handlers::router())
    }

    pub fn with_router(
        config: Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        router: MessageRouter,
    ) -> Self {
        let sessions = SessionService::new(store.clone(), clock.clone(), &config);
        let ws_login_limiter = LoginLimiter::new(config.ws_login_rate, clock.clone());
        let http_login_limiter = LoginLimiter::new(config.http_login_rate, clock.clone());

        Self {
            config: Arc::new(config),
            store,
            clock,
            sessions: Arc::new(sessions),
            registry: Arc::new(ConnectionRegistry::new()),
            router: Arc::new(router),
            ws_login_limiter: Arc::new(ws_login_limiter),
            http_login_limiter: Arc::new(http_login_limiter),
        }
    }
}
