//! Session bearer tokens and password hashing.

use std::sync::LazyLock;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::GatewayError;

/// Prefix of every session bearer token.
pub const SESSION_TOKEN_PREFIX: &str = "mst";

/// Random bytes in a session token, before encoding.
const SESSION_TOKEN_BYTES: usize = 32;

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// A fresh session bearer token. Unrelated to the session id.
pub fn generate_session_token() -> String {
    generate_opaque_token(SESSION_TOKEN_PREFIX, SESSION_TOKEN_BYTES)
}

/// Keyed hash of bearer tokens. Only the hash is ever persisted.
#[derive(Clone)]
pub struct TokenHasher {
    secret: Vec<u8>,
}

impl TokenHasher {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Hex-encoded HMAC-SHA256 of `token`.
    pub fn hash(&self, token: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(token.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Hash a password using Argon2id with a random salt.
pub fn hash_password(password: &str) -> Result<String, GatewayError> {
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(?e, "password hashing failed");
            GatewayError::internal("Failed to process password")
        })
}

/// Check a password against an Argon2id PHC string.
///
/// A malformed stored hash counts as a mismatch.
pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::Argon2;
    use password_hash::{PasswordHash, PasswordVerifier};

    let Ok(parsed) = PasswordHash::new(hash) else {
        tracing::warn!("stored password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Hash checked when the account does not exist, so unknown emails cost the
/// same Argon2 work as wrong passwords.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("mise-placeholder-password").ok());

/// Argon2 runs on the blocking pool, off the async workers.
async fn off_thread<T, F>(f: F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        tracing::error!(?e, "password task failed");
        GatewayError::internal("Failed to process password")
    })
}

/// [`hash_password`] on the blocking pool.
pub async fn hash_password_blocking(password: String) -> Result<String, GatewayError> {
    off_thread(move || hash_password(&password)).await?
}

/// Check `password` against the stored hash, or against a dummy hash when
/// there is none. Runs on the blocking pool.
pub async fn check_password(password: String, stored: Option<String>) -> Result<bool, GatewayError> {
    off_thread(move || match stored {
        Some(hash) => verify_password(&password, &hash),
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                verify_password(&password, dummy);
            }
            false
        }
    })
    .await
}
