//! `channel.*` actions.
//!
//! Channel names are `tenant:<id>`, `tenant:<id>:<topic>` or `account:<id>`.
//! Tenant channels need a membership in that tenant; account channels are
//! only open to that account.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{FieldError, GatewayError};
use crate::gateway::action::{Access, Action, RequestContext, Validate, Violations};

const MAX_CHANNEL_LEN: usize = 128;

pub fn tenant_channel(tenant_id: &str, topic: Option<&str>) -> String {
    match topic {
        Some(topic) => format!("tenant:{tenant_id}:{topic}"),
        None => format!("tenant:{tenant_id}"),
    }
}

/// Whether `channel` is `tenant:<tenant_id>` or one of its topics.
pub fn is_tenant_channel(channel: &str, tenant_id: &str) -> bool {
    parse_channel(channel) == Some(ChannelScope::Tenant(tenant_id))
}

#[derive(Debug, PartialEq, Eq)]
enum ChannelScope<'a> {
    Tenant(&'a str),
    Account(&'a str),
}

fn parse_channel(name: &str) -> Option<ChannelScope<'_>> {
    let mut parts = name.splitn(3, ':');
    let kind = parts.next()?;
    let id = parts.next().filter(|id| !id.is_empty())?;
    let topic = parts.next();

    match (kind, topic) {
        ("tenant", None) => Some(ChannelScope::Tenant(id)),
        ("tenant", Some(topic)) if !topic.is_empty() && !topic.contains(':') => {
            Some(ChannelScope::Tenant(id))
        }
        ("account", None) => Some(ChannelScope::Account(id)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct ChannelPayload {
    pub channel: String,
}

impl Validate for ChannelPayload {
    fn validate(&self) -> Result<(), Vec<FieldError>> {
        Violations::new()
            .required(&self.channel, "channel")
            .check(self.channel.len() <= MAX_CHANNEL_LEN, "channel", "must be at most 128 characters")
            .check(
                self.channel.is_empty() || parse_channel(&self.channel).is_some(),
                "channel",
                "must be tenant:<id>, tenant:<id>:<topic> or account:<id>",
            )
            .finish()
    }
}

pub struct Subscribe;

#[async_trait]
impl Action for Subscribe {
    type Payload = ChannelPayload;
    const KEY: &'static str = "channel.subscribe";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: ChannelPayload) -> Result<Value, GatewayError> {
        let account_id = ctx.account_id()?;
        let scope = parse_channel(&p.channel)
            .ok_or_else(|| GatewayError::invalid_field("channel", "Unrecognized channel"))?;

        match scope {
            ChannelScope::Tenant(tenant_id) => {
                ctx.state
                    .store
                    .find_membership(account_id, tenant_id)
                    .await?
                    .ok_or(GatewayError::PermissionDenied)?;
            }
            ChannelScope::Account(id) if id == account_id => {}
            ChannelScope::Account(_) => return Err(GatewayError::PermissionDenied),
        }

        let added = ctx.state.registry.subscribe(&ctx.connection.id, &p.channel);
        tracing::debug!(connection_id = %ctx.connection.id, channel = %p.channel, added, "subscribed");
        Ok(json!({ "channel": p.channel, "subscribed": true }))
    }
}

pub struct Unsubscribe;

#[async_trait]
impl Action for Unsubscribe {
    type Payload = ChannelPayload;
    const KEY: &'static str = "channel.unsubscribe";
    const ACCESS: Access = Access::Authenticated;

    async fn run(&self, ctx: RequestContext, p: ChannelPayload) -> Result<Value, GatewayError> {
        let removed = ctx.state.registry.unsubscribe(&ctx.connection.id, &p.channel);
        Ok(json!({ "channel": p.channel, "subscribed": false, "wasSubscribed": removed }))
    }
}
