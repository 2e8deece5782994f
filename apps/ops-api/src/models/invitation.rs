use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::invitations;
use crate::permissions::{MembershipFlags, Priority};

/// A single-use code that grants a membership in a tenant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub code: String,
    pub tenant_id: String,
    pub access_flags: MembershipFlags,
    pub priority: Priority,
    pub created_by: String,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        self.accepted_at.is_none() && now < self.expires_at
    }
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = invitations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InvitationRow {
    pub code: String,
    pub tenant_id: String,
    pub access_flags: i64,
    pub priority: i32,
    pub created_by: String,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<InvitationRow> for Invitation {
    fn from(row: InvitationRow) -> Self {
        Self {
            code: row.code,
            tenant_id: row.tenant_id,
            access_flags: MembershipFlags::from_bits(row.access_flags as u64),
            priority: Priority(row.priority),
            created_by: row.created_by,
            expires_at: row.expires_at,
            accepted_at: row.accepted_at,
            created_at: row.created_at,
        }
    }
}

impl From<&Invitation> for InvitationRow {
    fn from(inv: &Invitation) -> Self {
        Self {
            code: inv.code.clone(),
            tenant_id: inv.tenant_id.clone(),
            access_flags: inv.access_flags.bits() as i64,
            priority: inv.priority.0,
            created_by: inv.created_by.clone(),
            expires_at: inv.expires_at,
            accepted_at: inv.accepted_at,
            created_at: inv.created_at,
        }
    }
}
