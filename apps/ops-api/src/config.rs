use std::path::Path;

use chrono::Duration;

use crate::rate_limit::WindowLimit;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. When unset the server runs on an in-memory store.
    pub database_url: Option<String>,
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Server secret keying the session-token hash.
    pub token_secret: String,
    /// Fixed validity horizon of a new (or freshly extended) session.
    pub session_ttl: Duration,
    /// Minimum idle time before a validation rewrites `expires_at`.
    pub session_extend_threshold: Duration,
    /// Largest WebSocket message accepted, in bytes.
    pub max_frame_bytes: usize,
    /// Per-connection message throttle.
    pub message_rate: WindowLimit,
    /// Per-IP throttle for `auth.login` over the socket.
    pub ws_login_rate: WindowLimit,
    /// Per-IP throttle for `POST /api/v1/auth/login`.
    pub http_login_rate: WindowLimit,
    /// How often expired limiter entries are swept.
    pub rate_limit_sweep_interval: Duration,
    /// Send internal error messages to clients. Never enable in production.
    pub expose_internal_errors: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = Self::with_secret(required_var("SESSION_TOKEN_SECRET"));

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            port: parsed_var("PORT").unwrap_or(defaults.port),
            session_ttl: parsed_var("SESSION_TTL_HOURS")
                .map(Duration::hours)
                .unwrap_or(defaults.session_ttl),
            session_extend_threshold: parsed_var("SESSION_EXTEND_THRESHOLD_SECS")
                .map(Duration::seconds)
                .unwrap_or(defaults.session_extend_threshold),
            max_frame_bytes: parsed_var("MAX_FRAME_BYTES").unwrap_or(defaults.max_frame_bytes),
            message_rate: window_var("MESSAGE_RATE", defaults.message_rate),
            ws_login_rate: window_var("WS_LOGIN_RATE", defaults.ws_login_rate),
            http_login_rate: window_var("HTTP_LOGIN_RATE", defaults.http_login_rate),
            rate_limit_sweep_interval: parsed_var("RATE_LIMIT_SWEEP_SECS")
                .map(Duration::seconds)
                .unwrap_or(defaults.rate_limit_sweep_interval),
            expose_internal_errors: parsed_var("EXPOSE_INTERNAL_ERRORS").unwrap_or(false),
            token_secret: defaults.token_secret,
        }
    }

    /// Default settings around the given secret. No database.
    pub fn with_secret(token_secret: impl Into<String>) -> Self {
        Self {
            database_url: None,
            port: 4100,
            token_secret: token_secret.into(),
            session_ttl: Duration::days(30),
            session_extend_threshold: Duration::minutes(5),
            max_frame_bytes: 64 * 1024,
            message_rate: WindowLimit::new(100, Duration::seconds(60)),
            ws_login_rate: WindowLimit::new(5, Duration::minutes(5)),
            http_login_rate: WindowLimit::new(20, Duration::minutes(15)),
            rate_limit_sweep_interval: Duration::seconds(60),
            expose_internal_errors: false,
        }
    }
}

/// Load `.env` from the working directory, falling back to the crate root.
/// Missing files are fine; variables may be set externally.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }
}

/// Point a database URL at its `_test` sibling database.
pub fn with_test_db_suffix(database_url: &str) -> String {
    let (base, query) = match database_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (database_url, None),
    };

    let Some((prefix, db_name)) = base.rsplit_once('/') else {
        return database_url.to_string();
    };
    if db_name.is_empty() || db_name.ends_with("_test") {
        return database_url.to_string();
    }

    match query {
        Some(query) => format!("{prefix}/{db_name}_test?{query}"),
        None => format!("{prefix}/{db_name}_test"),
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Reads `<PREFIX>_MAX` and `<PREFIX>_WINDOW_SECS`.
fn window_var(prefix: &str, default: WindowLimit) -> WindowLimit {
    let max = parsed_var(&format!("{prefix}_MAX")).unwrap_or(default.max);
    let window = parsed_var(&format!("{prefix}_WINDOW_SECS"))
        .map(Duration::seconds)
        .unwrap_or(default.window);
    WindowLimit::new(max, window)
}
