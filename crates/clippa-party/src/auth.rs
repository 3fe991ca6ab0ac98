use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use clippa_core::ids::PartyId;
use clippa_core::security::random_token;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("token does not match party")]
    PartyMismatch,
}

#[derive(Clone, Debug, Default)]
pub struct TokenConfig {
    /// Tokens older than this fail to resolve. `None` keeps them until used.
    pub ttl: Option<Duration>,
}

struct IssuedToken {
    party_id: PartyId,
    issued_at: Instant,
}

/// Single-use join tokens, held in memory.
pub struct TokenService {
    config: TokenConfig,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a token that admits one join to `party_id`.
    pub fn issue(&self, party_id: PartyId) -> String {
        let token = random_token();
        let mut tokens = self.tokens.lock();
        self.purge_expired(&mut tokens);
        tokens.insert(
            token.clone(),
            IssuedToken {
                party_id,
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// Consume `token`, returning the party it was issued for.
    pub fn resolve(&self, token: &str) -> Option<PartyId> {
        let mut tokens = self.tokens.lock();
        let issued = tokens.remove(token)?;
        if self.is_expired(&issued) {
            debug!("token expired");
            return None;
        }
        Some(issued.party_id)
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.lock().remove(token);
    }

    /// Consume `token` only if it was issued for `party_id`. A token for a
    /// different party is left in place.
    pub fn redeem(&self, token: &str, party_id: &PartyId) -> Result<(), AuthError> {
        let mut tokens = self.tokens.lock();
        let (expired, matches) = match tokens.get(token) {
            Some(issued) => (self.is_expired(issued), &issued.party_id == party_id),
            None => return Err(AuthError::InvalidToken),
        };
        if expired {
            tokens.remove(token);
            return Err(AuthError::InvalidToken);
        }
        if !matches {
            warn!(party_id = %party_id, "token issued for another party");
            return Err(AuthError::PartyMismatch);
        }
        tokens.remove(token);
        Ok(())
    }

    /// Outstanding tokens, expired ones included until the next purge.
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, issued: &IssuedToken) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| issued.issued_at.elapsed() >= ttl)
    }

    fn purge_expired(&self, tokens: &mut HashMap<String, IssuedToken>) {
        if self.config.ttl.is_some() {
            tokens.retain(|_, issued| !self.is_expired(issued));
        }
    }
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new(TokenConfig::default())
    }
}
