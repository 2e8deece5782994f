//! Postgres-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, OptionalExtension};
use diesel::upsert::excluded;
use diesel_async::pooled_connection::deadpool::PoolError;
use diesel_async::AsyncConnection;
use scoped_futures::ScopedFutureExt;

use super::pool::DbPool;
use super::schema::{accounts, bookings, invitations, memberships, sessions, tenants};
use super::store::{Store, StoreError};
use crate::models::account::{Account, AccountRow};
use crate::models::booking::Booking;
use crate::models::invitation::{Invitation, InvitationRow};
use crate::models::membership::{Membership, MembershipRow};
use crate::models::session::{RevokeReason, Session, SessionRow};
use crate::models::tenant::Tenant;

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

fn session_from_row(row: SessionRow) -> Result<Session, StoreError> {
    Session::try_from(row).map_err(StoreError::Corrupt)
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(accounts::table).values(AccountRow::from(account)),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn find_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<AccountRow> = diesel_async::RunQueryDsl::get_result(
            accounts::table.find(id).select(AccountRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(row.map(Account::from))
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<AccountRow> = diesel_async::RunQueryDsl::get_result(
            accounts::table
                .filter(accounts::email.eq(email))
                .select(AccountRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(row.map(Account::from))
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(sessions::table).values(SessionRow::from(session)),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn find_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            sessions::table.find(id).select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        row.map(session_from_row).transpose()
    }

    async fn find_session_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<SessionRow> = diesel_async::RunQueryDsl::get_result(
            sessions::table
                .filter(sessions::token_hash.eq(token_hash))
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        row.map(session_from_row).transpose()
    }

    async fn touch_session(
        &self,
        id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::update(sessions::table.find(id)).set((
                sessions::last_activity_at.eq(last_activity_at),
                sessions::expires_at.eq(expires_at),
            )),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn revoke_session(
        &self,
        id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                sessions::table
                    .find(id)
                    .filter(sessions::revoked_at.is_null()),
            )
            .set((
                sessions::revoked_at.eq(Some(at)),
                sessions::revoked_reason.eq(Some(reason.as_str())),
            )),
            &mut conn,
        )
        .await?;
        Ok(updated > 0)
    }

    async fn revoke_sessions_for_account(
        &self,
        account_id: &str,
        reason: RevokeReason,
        at: DateTime<Utc>,
        except_session_id: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.get().await?;
        // Session ids are never empty, so "" spares nothing.
        let spared = except_session_id.unwrap_or("");
        let revoked: Vec<String> = diesel_async::RunQueryDsl::get_results(
            diesel::update(
                sessions::table
                    .filter(sessions::account_id.eq(account_id))
                    .filter(sessions::revoked_at.is_null())
                    .filter(sessions::id.ne(spared)),
            )
            .set((
                sessions::revoked_at.eq(Some(at)),
                sessions::revoked_reason.eq(Some(reason.as_str())),
            ))
            .returning(sessions::id),
            &mut conn,
        )
        .await?;
        Ok(revoked)
    }

    async fn list_sessions_for_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<Session>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<SessionRow> = diesel_async::RunQueryDsl::load(
            sessions::table
                .filter(sessions::account_id.eq(account_id))
                .filter(sessions::revoked_at.is_null())
                .order(sessions::created_at.desc())
                .select(SessionRow::as_select()),
            &mut conn,
        )
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    async fn insert_tenant(&self, tenant: &Tenant, owner: &Membership) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let owner_row = MembershipRow::from(owner);
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                diesel_async::RunQueryDsl::execute(
                    diesel::insert_into(tenants::table).values(tenant),
                    conn,
                )
                .await?;
                diesel_async::RunQueryDsl::execute(
                    diesel::insert_into(memberships::table).values(&owner_row),
                    conn,
                )
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await?;
        Ok(())
    }

    async fn find_tenant(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        let mut conn = self.pool.get().await?;
        let tenant = diesel_async::RunQueryDsl::get_result(
            tenants::table.find(id).select(Tenant::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(tenant)
    }

    async fn find_membership(
        &self,
        account_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Membership>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<MembershipRow> = diesel_async::RunQueryDsl::get_result(
            memberships::table
                .find((tenant_id, account_id))
                .select(MembershipRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(row.map(Membership::from))
    }

    async fn upsert_membership(&self, membership: &Membership) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(memberships::table)
                .values(MembershipRow::from(membership))
                .on_conflict((memberships::tenant_id, memberships::account_id))
                .do_update()
                .set((
                    memberships::access_flags.eq(excluded(memberships::access_flags)),
                    memberships::priority.eq(excluded(memberships::priority)),
                )),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn delete_membership(
        &self,
        account_id: &str,
        tenant_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(memberships::table.find((tenant_id, account_id))),
            &mut conn,
        )
        .await?;
        Ok(deleted > 0)
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(invitations::table).values(InvitationRow::from(invitation)),
            &mut conn,
        )
        .await?;
        Ok(())
    }

    async fn find_invitation(&self, code: &str) -> Result<Option<Invitation>, StoreError> {
        let mut conn = self.pool.get().await?;
        let row: Option<InvitationRow> = diesel_async::RunQueryDsl::get_result(
            invitations::table
                .find(code)
                .select(InvitationRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?;
        Ok(row.map(Invitation::from))
    }

    async fn accept_invitation(&self, code: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(
                invitations::table
                    .find(code)
                    .filter(invitations::accepted_at.is_null()),
            )
            .set(invitations::accepted_at.eq(Some(at))),
            &mut conn,
        )
        .await?;
        Ok(updated > 0)
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(bookings::table).values(booking),
            &mut conn,
        )
        .await?;
        Ok(())
    }
}
