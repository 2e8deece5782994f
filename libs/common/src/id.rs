use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = mise_common::id::prefixed_ulid("acc");
/// assert!(id.starts_with("acc_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const ACCOUNT: &str = "acc";
    pub const SESSION: &str = "ses";
    pub const TENANT: &str = "ten";
    pub const CONNECTION: &str = "conn";
    pub const RESPONSE: &str = "res";
    pub const BOOKING: &str = "bkg";
    pub const INVITATION: &str = "inv";
}
