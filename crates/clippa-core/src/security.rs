use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

/// bcrypt work factor for stored party secrets.
pub const DEFAULT_SECRET_COST: u32 = 10;

/// Lowest work factor bcrypt accepts.
pub const MIN_SECRET_COST: u32 = 4;

/// Length of tokens produced by [`random_token`].
pub const TOKEN_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("hash secret: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// A party secret as supplied by a client. Redacted in Debug.
#[derive(Clone)]
pub struct PartySecret(pub SecretString);

impl PartySecret {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub fn is_blank(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }
}

impl std::fmt::Debug for PartySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PartySecret([REDACTED])")
    }
}

/// bcrypt-hash a secret at `cost`. Blocks the calling thread for the whole hash.
pub fn hash_secret(secret: &PartySecret, cost: u32) -> Result<String, SecretError> {
    Ok(bcrypt::hash(secret.0.expose_secret(), cost)?)
}

/// Check a secret against a stored bcrypt hash. Malformed hashes never verify.
pub fn verify_secret(secret: &PartySecret, stored: &str) -> bool {
    bcrypt::verify(secret.0.expose_secret(), stored).unwrap_or(false)
}

/// A random URL-safe token of [`TOKEN_LEN`] characters.
pub fn random_token() -> String {
    // 48 bytes encode to exactly 64 base64 characters.
    let mut bytes = [0u8; TOKEN_LEN / 4 * 3];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_redacted() {
        let secret = PartySecret::new("s3cr3t");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("s3cr3t"), "secret leaked in debug: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn hash_then_verify() {
        let secret = PartySecret::new("correct-secret");
        let stored = hash_secret(&secret, MIN_SECRET_COST).unwrap();
        assert!(stored.starts_with("$2b$04$"));
        assert!(verify_secret(&secret, &stored));
        assert!(!verify_secret(&PartySecret::new("bad-secret"), &stored));
    }

    #[test]
    fn hashes_are_salted() {
        let secret = PartySecret::new("same");
        assert_ne!(
            hash_secret(&secret, MIN_SECRET_COST).unwrap(),
            hash_secret(&secret, MIN_SECRET_COST).unwrap()
        );
    }

    #[test]
    fn malformed_hash_never_verifies() {
        let secret = PartySecret::new("x");
        assert!(!verify_secret(&secret, ""));
        assert!(!verify_secret(&secret, "$2b$04$short"));
        assert!(!verify_secret(&secret, "sha256$AAAA$BBBB"));
        assert!(!verify_secret(&secret, "$9z$10$not-a-real-hash-at-all"));
    }

    #[test]
    fn blank_detection() {
        assert!(PartySecret::new("   ").is_blank());
        assert!(!PartySecret::new(" a ").is_blank());
    }

    #[test]
    fn random_tokens_are_url_safe() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn cost_is_recorded_in_hash() {
        let secret = PartySecret::new("s");
        let stored = hash_secret(&secret, 5).unwrap();
        assert!(stored.starts_with("$2b$05$"));
        assert!(verify_secret(&secret, &stored));
    }

    #[test]
    fn out_of_range_cost_is_an_error() {
        let secret = PartySecret::new("s");
        assert!(matches!(hash_secret(&secret, 3), Err(SecretError::Hash(_))));
    }
}
