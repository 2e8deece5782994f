use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, RequestContext, Validate, Violations};
use crate::models::membership::Membership;
use crate::models::tenant::Tenant;
use crate::permissions::{require_global, GlobalFlags, MembershipFlags, Priority};
use mise_common::id::{prefix, prefixed_ulid};

use super::respond;

const MAX_TENANT_NAME_LEN: usize = 100;

// ---------------------------------------------------------------------------
// tenant.create
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePayload {
    pub name: String,
}

impl Validate for CreatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new()
            .required(&self.name, "name")
            .check(
                self.name.trim().chars().count() <= MAX_TENANT_NAME_LEN,
                "name",
                "must be at most 100 characters",
            )
            .finish()
    }
}

/// Create a tenant owned by the caller and make it the connection's active
/// tenant.
pub struct CreateTenant;

#[async_trait]
impl Action for CreateTenant {
    type Payload = CreatePayload;
    const KEY: &'static str = "tenant.create";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: CreatePayload) -> Result<Value, GatewayError> {
        let account = &ctx.identity()?.account;
        require_global(account.global_flags, GlobalFlags::CREATE_TENANT)?;

        let now = ctx.state.clock.now();
        let tenant = Tenant {
            id: prefixed_ulid(prefix::TENANT),
            name: p.name.trim().to_string(),
            owner_id: account.id.clone(),
            created_at: now,
        };
        let owner = Membership {
            tenant_id: tenant.id.clone(),
            account_id: account.id.clone(),
            access_flags: MembershipFlags::ALL,
            priority: Priority::OWNER,
            joined_at: now,
        };
        ctx.state.store.insert_tenant(&tenant, &owner).await?;
        ctx.state
            .registry
            .set_active_tenant(&ctx.connection.id, Some(&tenant.id));

        tracing::info!(tenant_id = %tenant.id, owner_id = %account.id, "tenant created");
        Ok(json!({
            "tenant": respond(&tenant)?,
            "membership": respond(&owner)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// tenant.switch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchPayload {
    /// `null` leaves every tenant.
    pub tenant_id: Option<String>,
}

impl Validate for SwitchPayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        match &self.tenant_id {
            Some(id) => Violations::new().required(id, "tenantId").finish(),
            None => Ok(()),
        }
    }
}

/// Change which tenant the connection receives tenant broadcasts for.
pub struct SwitchTenant;

#[async_trait]
impl Action for SwitchTenant {
    type Payload = SwitchPayload;
    const KEY: &'static str = "tenant.switch";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: SwitchPayload) -> Result<Value, GatewayError> {
        let account_id = ctx.account_id()?;

        let membership = match &p.tenant_id {
            Some(tenant_id) => Some(
                ctx.state
                    .store
                    .find_membership(account_id, tenant_id)
                    .await?
                    .ok_or(GatewayError::PermissionDenied)?,
            ),
            None => None,
        };

        ctx.state
            .registry
            .set_active_tenant(&ctx.connection.id, p.tenant_id.as_deref());
        tracing::debug!(
            connection_id = %ctx.connection.id,
            tenant_id = ?p.tenant_id,
            "active tenant switched"
        );

        Ok(json!({
            "activeTenantId": p.tenant_id,
            "membership": respond(&membership)?,
        }))
    }
}
