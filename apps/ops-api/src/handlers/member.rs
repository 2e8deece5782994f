//! `member.*` actions. Every change is bounded by the actor's own priority
//! and flags.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, RequestContext, Validate, Violations};
use crate::gateway::events::EventEnvelope;
use crate::models::membership::Membership;
use crate::permissions::{require_membership, require_outranks, MembershipFlags, Priority};

use super::channel::{is_tenant_channel, tenant_channel};
use super::respond;

/// Load the actor's and the target's memberships and check the actor may
/// act on the target.
async fn load_pair(
    ctx: &RequestContext,
    tenant_id: &str,
    target_account_id: &str,
) -> Result<(Membership, Membership), GatewayError> {
    let actor_id = ctx.account_id()?;
    let actor = require_membership(
        ctx.state.store.as_ref(),
        actor_id,
        tenant_id,
        MembershipFlags::MANAGE_MEMBERS,
    )
    .await?;

    if actor_id == target_account_id {
        return Err(GatewayError::forbidden("You cannot modify your own membership"));
    }

    let target = ctx
        .state
        .store
        .find_membership(target_account_id, tenant_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Member not found"))?;
    require_outranks(&actor, target.priority)?;

    Ok((actor, target))
}

fn announce(ctx: &RequestContext, action: &str, tenant_id: &str, target_account_id: &str, data: Value) {
    let event = EventEnvelope::new("member", action, data, ctx.state.clock.now()).in_tenant(tenant_id);
    let registry = &ctx.state.registry;
    let mut recipients = registry.connections_in_channel(&tenant_channel(tenant_id, Some("members")));
    recipients.extend(registry.connections_for_account(target_account_id));
    let delivered = registry.to_connections(recipients, &event);
    tracing::debug!(tenant_id, action, delivered, "member event broadcast");
}

// ---------------------------------------------------------------------------
// member.update
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub tenant_id: String,
    pub account_id: String,
    pub access_flags: MembershipFlags,
    pub priority: i32,
}

impl Validate for UpdatePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new()
            .required(&self.tenant_id, "tenantId")
            .required(&self.account_id, "accountId")
            .check(
                MembershipFlags::ALL.contains(self.access_flags),
                "accessFlags",
                "contains unknown permission bits",
            )
            .finish()
    }
}

pub struct UpdateMember;

#[async_trait]
impl Action for UpdateMember {
    type Payload = UpdatePayload;
    const KEY: &'static str = "member.update";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: UpdatePayload) -> Result<Value, GatewayError> {
        let (actor, target) = load_pair(&ctx, &p.tenant_id, &p.account_id).await?;

        // Promoting to the actor's own rank would lock the actor out.
        require_outranks(&actor, Priority(p.priority))?;
        if !actor.access_flags.contains(p.access_flags) {
            return Err(GatewayError::forbidden("You cannot grant permissions you do not hold"));
        }

        let updated = Membership {
            access_flags: p.access_flags,
            priority: Priority(p.priority),
            ..target
        };
        ctx.state.store.upsert_membership(&updated).await?;

        tracing::info!(
            tenant_id = %updated.tenant_id,
            account_id = %updated.account_id,
            actor_id = %actor.account_id,
            "membership updated"
        );

        let body = respond(&updated)?;
        announce(&ctx, "updated", &updated.tenant_id, &updated.account_id, body.clone());
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// member.remove
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePayload {
    pub tenant_id: String,
    pub account_id: String,
}

impl Validate for RemovePayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new()
            .required(&self.tenant_id, "tenantId")
            .required(&self.account_id, "accountId")
            .finish()
    }
}

pub struct RemoveMember;

#[async_trait]
impl Action for RemoveMember {
    type Payload = RemovePayload;
    const KEY: &'static str = "member.remove";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: RemovePayload) -> Result<Value, GatewayError> {
        let (actor, target) = load_pair(&ctx, &p.tenant_id, &p.account_id).await?;

        if !ctx.state.store.delete_membership(&target.account_id, &target.tenant_id).await? {
            return Err(GatewayError::not_found("Member not found"));
        }

        // The target's sockets stop receiving the tenant's broadcasts.
        let registry = &ctx.state.registry;
        for connection_id in registry.connections_for_account(&target.account_id) {
            if let Some(conn) = registry.get(&connection_id) {
                if conn.active_tenant_id().as_deref() == Some(target.tenant_id.as_str()) {
                    registry.set_active_tenant(&connection_id, None);
                }
            }
            registry.unsubscribe_where(&connection_id, |c| is_tenant_channel(c, &target.tenant_id));
        }

        tracing::info!(
            tenant_id = %target.tenant_id,
            account_id = %target.account_id,
            actor_id = %actor.account_id,
            "membership removed"
        );

        let body = json!({ "tenantId": target.tenant_id, "accountId": target.account_id });
        announce(&ctx, "removed", &target.tenant_id, &target.account_id, body.clone());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::Store;
    use crate::gateway::connection::Outbound;
    use crate::handlers::testing::Fixture;
    use crate::permissions::GlobalFlags;

    fn update(fx: &Fixture, account_id: &str, flags: MembershipFlags, priority: i32) -> UpdatePayload {
        UpdatePayload {
            tenant_id: fx.tenant.id.clone(),
            account_id: account_id.into(),
            access_flags: flags,
            priority,
        }
    }

    #[tokio::test]
    async fn owner_updates_lower_member_and_target_is_notified() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (_bob_ctx, mut bob_rx) = fx.signed_in_context(&fx.bob).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        let flags = MembershipFlags::VIEW_BOOKINGS | MembershipFlags::MANAGE_BOOKINGS;
        let out = UpdateMember.run(ctx, update(&fx, &fx.bob.id, flags, 50)).await.unwrap();
        assert_eq!(out["priority"], 50);

        let stored = fx.store.find_membership(&fx.bob.id, &fx.tenant.id).await.unwrap().unwrap();
        assert_eq!(stored.access_flags, flags);

        match bob_rx.try_recv().unwrap() {
            Outbound::Text(text) => {
                let event: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(event["category"], "member");
                assert_eq!(event["action"], "updated");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribed_target_gets_one_event() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (bob_ctx, mut bob_rx) = fx.signed_in_context(&fx.bob).await;
        fx.state
            .registry
            .subscribe(&bob_ctx.connection.id, &tenant_channel(&fx.tenant.id, Some("members")));
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        UpdateMember
            .run(ctx, update(&fx, &fx.bob.id, MembershipFlags::VIEW_BOOKINGS, 20))
            .await
            .unwrap();

        assert!(matches!(bob_rx.try_recv(), Ok(Outbound::Text(_))));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cannot_modify_equal_or_higher_priority() {
        let fx = Fixture::new().await;
        let carol = fx.account("carol@example.com", GlobalFlags::DEFAULT).await;
        fx.join(&fx.bob, MembershipFlags::ALL, 500).await;
        fx.join(&carol, MembershipFlags::VIEW_BOOKINGS, 500).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.bob).await;

        let err = UpdateMember
            .run(ctx, update(&fx, &carol.id, MembershipFlags::VIEW_BOOKINGS, 10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn cannot_raise_member_to_own_priority() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        let err = UpdateMember
            .run(ctx, update(&fx, &fx.bob.id, MembershipFlags::VIEW_BOOKINGS, 1000))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn cannot_grant_flags_actor_lacks() {
        let fx = Fixture::new().await;
        let carol = fx.account("carol@example.com", GlobalFlags::DEFAULT).await;
        fx.join(&fx.bob, MembershipFlags::MANAGE_MEMBERS, 500).await;
        fx.join(&carol, MembershipFlags::EMPTY, 10).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.bob).await;

        let err = UpdateMember
            .run(ctx, update(&fx, &carol.id, MembershipFlags::MANAGE_BOOKINGS, 10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn non_manager_is_denied() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 500).await;
        let (ctx, _rx) = fx.signed_in_context(&fx.bob).await;

        let err = RemoveMember
            .run(
                ctx,
                RemovePayload {
                    tenant_id: fx.tenant.id.clone(),
                    account_id: fx.alice.id.clone(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied));
    }

    #[tokio::test]
    async fn remove_clears_target_tenant_access() {
        let fx = Fixture::new().await;
        fx.join(&fx.bob, MembershipFlags::VIEW_BOOKINGS, 10).await;
        let (bob_ctx, _bob_rx) = fx.signed_in_context(&fx.bob).await;
        let members = tenant_channel(&fx.tenant.id, Some("members"));
        let own = format!("account:{}", fx.bob.id);
        fx.state.registry.set_active_tenant(&bob_ctx.connection.id, Some(&fx.tenant.id));
        fx.state.registry.subscribe(&bob_ctx.connection.id, &members);
        fx.state.registry.subscribe(&bob_ctx.connection.id, &own);
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        RemoveMember
            .run(
                ctx,
                RemovePayload {
                    tenant_id: fx.tenant.id.clone(),
                    account_id: fx.bob.id.clone(),
                },
            )
            .await
            .unwrap();

        assert!(fx.store.find_membership(&fx.bob.id, &fx.tenant.id).await.unwrap().is_none());
        assert!(bob_ctx.connection.active_tenant_id().is_none());
        assert!(fx.state.registry.connections_in_channel(&members).is_empty());
        assert_eq!(bob_ctx.connection.subscriptions(), vec![own]);
    }

    #[tokio::test]
    async fn unknown_member_is_not_found() {
        let fx = Fixture::new().await;
        let (ctx, _rx) = fx.signed_in_context(&fx.alice).await;

        let err = RemoveMember
            .run(
                ctx,
                RemovePayload {
                    tenant_id: fx.tenant.id.clone(),
                    account_id: fx.bob.id.clone(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
