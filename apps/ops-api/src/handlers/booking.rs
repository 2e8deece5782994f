use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, RequestContext, Validate, Violations};
use crate::gateway::events::EventEnvelope;
use crate::models::booking::Booking;
use crate::permissions::{require_membership, MembershipFlags};
use mise_common::id::{prefix, prefixed_ulid};

use super::respond;

const MAX_PARTY_SIZE: i32 = 100;
const MAX_GUEST_NAME_LEN: usize = 120;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    /// Defaults to the connection's active tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub guest_name: String,
    pub party_size: i32,
    pub starts_at: DateTime<Utc>,
}

impl Validate for CreatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new()
            .required(&self.guest_name, "guestName")
            .check(
                self.guest_name.trim().chars().count() <= MAX_GUEST_NAME_LEN,
                "guestName",
                "must be at most 120 characters",
            )
            .check(
                (1..=MAX_PARTY_SIZE).contains(&self.party_size),
                "partySize",
                "must be between 1 and 100",
            )
            .finish()
    }
}

/// Record a booking and push `booking.created` to the tenant's connections.
pub struct CreateBooking;

#[async_trait]
impl Action for CreateBooking {
    type Payload = CreatePayload;
    const KEY: &'static str = "booking.create";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: CreatePayload) -> Result<Value, GatewayError> {
        let account_id = ctx.account_id()?;
        let tenant_id = p
            .tenant_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| ctx.connection.active_tenant_id())
            .ok_or_else(|| GatewayError::invalid_field("tenantId", "is required when no tenant is active"))?;

        require_membership(
            ctx.state.store.as_ref(),
            account_id,
            &tenant_id,
            MembershipFlags::MANAGE_BOOKINGS,
        )
        .await?;

        let booking = Booking {
            id: prefixed_ulid(prefix::BOOKING),
            tenant_id,
            guest_name: p.guest_name.trim().to_string(),
            party_size: p.party_size,
            starts_at: p.starts_at,
            created_by: account_id.to_string(),
            created_at: ctx.state.clock.now(),
        };
        ctx.state.store.insert_booking(&booking).await?;

        let body = respond(&booking)?;
        let event = EventEnvelope::new("booking", "created", body.clone(), ctx.state.clock.now())
            .in_tenant(&booking.tenant_id);
        let delivered = ctx.state.registry.to_tenant(&booking.tenant_id, &event);
        tracing::info!(
            booking_id = %booking.id,
            tenant_id = %booking.tenant_id,
            delivered,
            "booking created"
        );

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::Outbound;
    use crate::handlers::testing::Fixture;

    fn payload(tenant_id: Option<String>) -> CreatePayload {
        CreatePayload {
            tenant_id,
            guest_name: "Ada".into(),
            party_size: 4,
            starts_at: Utc::now(),
        }
    }

    #[test]
    fn party_size_is_bounded() {
        let mut p = payload(None);
        p.party_size = 0;
        assert_eq!(p.validate().unwrap_err()[0].field, "partySize");
        p.party_size = 101;
        assert!(p.validate().is_err());
        p.party_size = 100;
        assert!(p.validate().is_ok());
    }

    #[tokio::test]
    async fn falls_back_to_active_tenant_and_broadcasts() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (bob_ctx, mut bob_rx) = fx.signed_in_context(&fx.bob).await;
        fx.state.registry.set_active_tenant(&bob_ctx.connection.id, Some(&fx.tenant.id));

        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;
        fx.state.registry.set_active_tenant(&ctx.connection.id, Some(&fx.tenant.id));

        let out = CreateBooking.run(ctx, payload(None)).await.unwrap();
        assert_eq!(out["tenantId"], fx.tenant.id.as_str());
        assert_eq!(fx.store.booking_count(), 1);

        let Outbound::Text(text) = bob_rx.try_recv().unwrap() else {
            panic!("expected an event frame");
        };
        let event: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event["type"], "event");
        assert_eq!(event["category"], "booking");
        assert_eq!(event["action"], "created");
        assert_eq!(event["scope"]["tenantId"], fx.tenant.id.as_str());
    }

    #[tokio::test]
    async fn missing_tenant_is_a_validation_error() {
        let fx = Fixture::new().await;
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        let err = CreateBooking.run(ctx, payload(None)).await.unwrap_err();
        match err {
            GatewayError::Validation(fields) => assert_eq!(fields[0].field, "tenantId"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn member_without_manage_bookings_is_denied() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.bob).await;

        let err = CreateBooking
            .run(ctx, payload(Some(fx.tenant.id.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied));
        assert_eq!(fx.store.booking_count(), 0);
    }
}
