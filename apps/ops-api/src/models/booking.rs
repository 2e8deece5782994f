use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::bookings;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub tenant_id: String,
    pub guest_name: String,
    pub party_size: i32,
    pub starts_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}
