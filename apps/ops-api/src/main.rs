use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ops_api::clock::{Clock, SystemClock};
use ops_api::config::{self, Config};
use ops_api::db::memory::MemoryStore;
use ops_api::db::pg::PgStore;
use ops_api::db::store::Store;
use ops_api::AppState;

#[tokio::main]
async fn main() {
    config::load_dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let store: Arc<dyn Store> = match config.database_url.as_deref() {
        Some(url) => match ops_api::db::pool::connect(url) {
            Ok(pool) => Arc::new(PgStore::new(pool)),
            Err(err) => {
                tracing::error!(?err, "failed to create database pool");
                return;
            }
        },
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sweep_every = config
        .rate_limit_sweep_interval
        .to_std()
        .unwrap_or(Duration::from_secs(60));
    let state = AppState::new(config, store, clock);
    tokio::spawn(sweep_login_limiters(state.clone(), sweep_every));

    tracing::info!(actions = ?state.router.keys(), "gateway actions registered");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(ops_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "ops-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");
}

/// Evict expired login windows so idle IPs do not accumulate.
async fn sweep_login_limiters(state: AppState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = state.ws_login_limiter.sweep() + state.http_login_limiter.sweep();
        if evicted > 0 {
            tracing::debug!(evicted, "login limiter sweep");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
