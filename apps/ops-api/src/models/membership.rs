use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::memberships;
use crate::permissions::{MembershipFlags, Priority};

/// An account's membership in one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub tenant_id: String,
    pub account_id: String,
    pub access_flags: MembershipFlags,
    pub priority: Priority,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = memberships)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MembershipRow {
    pub tenant_id: String,
    pub account_id: String,
    pub access_flags: i64,
    pub priority: i32,
    pub joined_at: DateTime<Utc>,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            account_id: row.account_id,
            access_flags: MembershipFlags::from_bits(row.access_flags as u64),
            priority: Priority(row.priority),
            joined_at: row.joined_at,
        }
    }
}

impl From<&Membership> for MembershipRow {
    fn from(m: &Membership) -> Self {
        Self {
            tenant_id: m.tenant_id.clone(),
            account_id: m.account_id.clone(),
            access_flags: m.access_flags.bits() as i64,
            priority: m.priority.0,
            joined_at: m.joined_at,
        }
    }
}
