use clippa_core::protocol::{ProtocolError, INVALID_MESSAGE, LEADER_NOT_SET};
use clippa_store::StoreError;

/// Wire token for a join that raced with hub retirement.
pub const HUB_RETIRED: &str = "HUB_RETIRED";

#[derive(Debug, thiserror::Error)]
pub enum PartyError {
    #[error(transparent)]
    InvalidMessage(#[from] ProtocolError),

    #[error("leader not set: {0}")]
    LeaderNotSet(StoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("hub retired")]
    HubRetired,
}

impl PartyError {
    /// Error token carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => INVALID_MESSAGE,
            Self::LeaderNotSet(_) | Self::Store(_) => LEADER_NOT_SET,
            Self::HubRetired => HUB_RETIRED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        let invalid = PartyError::from(ProtocolError::InvalidMessage("bad".into()));
        assert_eq!(invalid.code(), "INVALID_MESSAGE");

        let leader = PartyError::LeaderNotSet(StoreError::NotFound("party x".into()));
        assert_eq!(leader.code(), "LEADER_NOT_SET");
        assert!(leader.to_string().contains("party x"));

        assert_eq!(PartyError::HubRetired.code(), "HUB_RETIRED");
    }
}
