use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::tokens::generate_opaque_token;
use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, RequestContext, Validate, Violations};
use crate::models::invitation::Invitation;
use crate::permissions::{require_membership, require_outranks, MembershipFlags, Priority};
use mise_common::id::prefix;

use super::respond;

const DEFAULT_EXPIRY_HOURS: i64 = 72;
const MAX_EXPIRY_HOURS: i64 = 24 * 30;

// ---------------------------------------------------------------------------
// invitation.validate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ValidatePayload {
    pub code: String,
}

impl Validate for ValidatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new().required(&self.code, "code").finish()
    }
}

/// Look up an invitation before registering with it.
pub struct ValidateInvitation;

#[async_trait]
impl Action for ValidateInvitation {
    type Payload = ValidatePayload;
    const KEY: &'static str = "invitation.validate";
    const ACCESS: Access = Access::Public;

    async fn run(&self, ctx: RequestContext, p: ValidatePayload) -> Result<Value, GatewayError> {
        let store = &ctx.state.store;
        let now = ctx.state.clock.now();

        let invitation = store
            .find_invitation(p.code.trim())
            .await?
            .filter(|inv| inv.is_redeemable(now))
            .ok_or_else(|| GatewayError::not_found("Invitation not found or expired"))?;
        let tenant = store
            .find_tenant(&invitation.tenant_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("Invitation not found or expired"))?;

        Ok(json!({
            "code": invitation.code,
            "tenantId": tenant.id,
            "tenantName": tenant.name,
            "expiresAt": invitation.expires_at,
        }))
    }
}

// ---------------------------------------------------------------------------
// invitation.create
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayload {
    pub tenant_id: String,
    pub access_flags: MembershipFlags,
    pub priority: i32,
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

impl Validate for CreatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        let hours = self.expires_in_hours.unwrap_or(DEFAULT_EXPIRY_HOURS);
        Violations::new()
            .required(&self.tenant_id, "tenantId")
            .check(
                MembershipFlags::ALL.contains(self.access_flags),
                "accessFlags",
                "contains unknown permission bits",
            )
            .check(
                (1..=MAX_EXPIRY_HOURS).contains(&hours),
                "expiresInHours",
                "must be between 1 and 720",
            )
            .finish()
    }
}

/// Issue an invitation granting at most the creator's own flags, at a
/// priority strictly below the creator's.
pub struct CreateInvitation;

#[async_trait]
impl Action for CreateInvitation {
    type Payload = CreatePayload;
    const KEY: &'static str = "invitation.create";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: CreatePayload) -> Result<Value, GatewayError> {
        let account_id = ctx.account_id()?;
        let creator = require_membership(
            ctx.state.store.as_ref(),
            account_id,
            &p.tenant_id,
            MembershipFlags::MANAGE_INVITATIONS,
        )
        .await?;

        if !creator.access_flags.contains(p.access_flags) {
            return Err(GatewayError::forbidden("You cannot grant permissions you do not hold"));
        }
        require_outranks(&creator, Priority(p.priority))?;

        let now = ctx.state.clock.now();
        let invitation = Invitation {
            code: generate_opaque_token(prefix::INVITATION, 12),
            tenant_id: p.tenant_id,
            access_flags: p.access_flags,
            priority: Priority(p.priority),
            created_by: account_id.to_string(),
            expires_at: now + Duration::hours(p.expires_in_hours.unwrap_or(DEFAULT_EXPIRY_HOURS)),
            accepted_at: None,
            created_at: now,
        };
        ctx.state.store.insert_invitation(&invitation).await?;

        tracing::info!(tenant_id = %invitation.tenant_id, created_by = account_id, "invitation created");
        respond(&invitation)
    }
}
