pub mod auth;
pub mod health;

use axum::Router;
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", auth::router())
}

/// `Authorization: Session <token>` is not a standard HTTP auth scheme, so it
/// is documented as a header key.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "session",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "Authorization",
                    "Session <token>",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        auth::login,
        auth::current_session,
        auth::logout,
    ),
    components(
        schemas(
            crate::error::ApiErrorBody,
            crate::error::ErrorBody,
            crate::error::FieldError,
            health::HealthResponse,
            auth::LoginRequest,
            auth::SessionResponse,
            auth::AccountInfo,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Auth", description = "Password login and session management"),
    )
)]
pub struct ApiDoc;
