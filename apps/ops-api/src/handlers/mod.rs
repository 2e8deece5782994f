//! Built-in gateway actions.

pub mod auth;
pub mod booking;
pub mod channel;
pub mod invitation;
pub mod member;
pub mod tenant;

use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::gateway::router::MessageRouter;

/// Routing table with every built-in action registered.
pub fn router() -> MessageRouter {
    let mut router = MessageRouter::new();
    router
        .register(auth::Register)
        .register(auth::Login)
        .register(auth::Authenticate)
        .register(auth::Logout)
        .register(auth::LogoutAll)
        .register(auth::Sessions)
        .register(invitation::ValidateInvitation)
        .register(invitation::CreateInvitation)
        .register(tenant::CreateTenant)
        .register(tenant::SwitchTenant)
        .register(member::UpdateMember)
        .register(member::RemoveMember)
        .register(channel::Subscribe)
        .register(channel::Unsubscribe)
        .register(booking::CreateBooking);
    router
}

pub(crate) fn respond<T: Serialize>(value: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::internal(format!("serialize response: {e}")))
}
