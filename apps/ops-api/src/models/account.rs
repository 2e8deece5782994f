use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::accounts;
use crate::permissions::GlobalFlags;

/// A user identity. Carries the cross-tenant [`GlobalFlags`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(skip)]
    pub password_hash: String,
    pub global_flags: GlobalFlags,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AccountRow {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub global_flags: i64,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            password_hash: row.password_hash,
            global_flags: GlobalFlags::from_bits(row.global_flags as u64),
            disabled: row.disabled,
            created_at: row.created_at,
        }
    }
}

impl From<&Account> for AccountRow {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            email: account.email.clone(),
            display_name: account.display_name.clone(),
            password_hash: account.password_hash.clone(),
            global_flags: account.global_flags.bits() as i64,
            disabled: account.disabled,
            created_at: account.created_at,
        }
    }
}
