//! Bitflag permission evaluator.
//!
//! Two scopes that must never be compared with each other:
//! - [`GlobalFlags`] live on the account and gate cross-tenant actions.
//! - [`MembershipFlags`] live on an (account, tenant) membership and gate
//!   in-tenant actions.
//!
//! [`Priority`] is orthogonal to both and only prevents privilege escalation
//! between members of the same tenant.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::db::store::Store;
use crate::error::GatewayError;
use crate::models::membership::Membership;

/// `true` iff every bit in `required` is set in `flags`. Vacuously true for `required == 0`.
pub fn has_permission(flags: u64, required: u64) -> bool {
    flags & required == required
}

/// `true` iff at least one bit in `possible` is set in `flags`. Always false for `possible == 0`.
pub fn has_any(flags: u64, possible: u64) -> bool {
    flags & possible != 0
}

macro_rules! flag_type {
    ($name:ident) => {
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const EMPTY: Self = Self(0);

            pub const fn from_bits(bits: u64) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u64 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// All bits of `required` are present.
            pub fn contains(self, required: Self) -> bool {
                has_permission(self.0, required.0)
            }

            /// At least one bit of `possible` is present.
            pub fn intersects(self, possible: Self) -> bool {
                has_any(self.0, possible.0)
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

flag_type!(GlobalFlags);
flag_type!(MembershipFlags);

impl GlobalFlags {
    pub const CREATE_TENANT: Self = Self(1 << 0);
    pub const MANAGE_ACCOUNTS: Self = Self(1 << 1);
    pub const VIEW_ALL_TENANTS: Self = Self(1 << 2);
    pub const PLATFORM_ADMIN: Self = Self(1 << 15);

    /// Flags granted to a self-registered account.
    pub const DEFAULT: Self = Self::CREATE_TENANT;
}

impl MembershipFlags {
    pub const VIEW_BOOKINGS: Self = Self(1 << 0);
    pub const MANAGE_BOOKINGS: Self = Self(1 << 1);
    pub const VIEW_MENU: Self = Self(1 << 2);
    pub const MANAGE_MENU: Self = Self(1 << 3);
    pub const VIEW_STAFF: Self = Self(1 << 4);
    pub const MANAGE_STAFF: Self = Self(1 << 5);
    pub const MANAGE_MEMBERS: Self = Self(1 << 6);
    pub const MANAGE_SETTINGS: Self = Self(1 << 7);
    pub const MANAGE_INVITATIONS: Self = Self(1 << 8);

    pub const ALL: Self = Self(
        Self::VIEW_BOOKINGS.0
            | Self::MANAGE_BOOKINGS.0
            | Self::VIEW_MENU.0
            | Self::MANAGE_MENU.0
            | Self::VIEW_STAFF.0
            | Self::MANAGE_STAFF.0
            | Self::MANAGE_MEMBERS.0
            | Self::MANAGE_SETTINGS.0
            | Self::MANAGE_INVITATIONS.0,
    );
}

/// Escalation guard between members of one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Priority given to a tenant's creator.
    pub const OWNER: Self = Self(1000);

    /// An actor may act on a target only when the target ranks strictly lower.
    pub fn can_act_on(self, target: Priority) -> bool {
        target < self
    }
}

/// Gate a cross-tenant action on the account's global flags.
///
/// An empty requirement is rejected: routes without a permission requirement
/// are declared public or authenticated-only, never with a zero mask.
pub fn require_global(flags: GlobalFlags, required: GlobalFlags) -> Result<(), GatewayError> {
    if required.is_empty() {
        tracing::warn!("global permission check with an empty requirement");
        return Err(GatewayError::PermissionDenied);
    }
    if flags.contains(required) {
        Ok(())
    } else {
        Err(GatewayError::PermissionDenied)
    }
}

/// Load the caller's membership in `tenant_id` and require `required` on it.
///
/// A missing membership is a denial, the same as a missing bit.
pub async fn require_membership(
    store: &dyn Store,
    account_id: &str,
    tenant_id: &str,
    required: MembershipFlags,
) -> Result<Membership, GatewayError> {
    if required.is_empty() {
        tracing::warn!(tenant_id, "membership permission check with an empty requirement");
        return Err(GatewayError::PermissionDenied);
    }

    let membership = store
        .find_membership(account_id, tenant_id)
        .await?
        .ok_or(GatewayError::PermissionDenied)?;

    if membership.access_flags.contains(required) {
        Ok(membership)
    } else {
        Err(GatewayError::PermissionDenied)
    }
}

/// Require that `actor` outranks `target` before modifying or removing it.
pub fn require_outranks(actor: &Membership, target_priority: Priority) -> Result<(), GatewayError> {
    if actor.priority.can_act_on(target_priority) {
        Ok(())
    } else {
        Err(GatewayError::forbidden(
            "You cannot modify a member whose priority is equal to or higher than yours",
        ))
    }
}
