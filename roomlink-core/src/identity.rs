//! Peer identity and negotiation roles
//!
//! Every participant in a room is addressed by a [`PeerId`]. Peer ids are
//! totally ordered, and that order is what decides which side of a pair is
//! polite during offer collisions: both sides compute the same answer from
//! the two ids alone.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

/// Identifier of a room participant, unique within a room
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from any string
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generate a fresh random peer id
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role of the local side in a negotiating pair
///
/// The polite side yields on an offer collision: it rolls back its own
/// offer and answers the remote one. The impolite side ignores the remote
/// offer and waits for the answer to its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    /// Local id sorts after the remote id
    Polite,
    /// Local id sorts before the remote id
    Impolite,
}

impl NegotiationRole {
    /// Role of `local` when negotiating with `remote`
    #[must_use]
    pub fn between(local: &PeerId, remote: &PeerId) -> Self {
        if local > remote {
            Self::Polite
        } else {
            Self::Impolite
        }
    }

    /// Whether this side yields on collision
    #[must_use]
    pub fn is_polite(self) -> bool {
        self == Self::Polite
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_peer_id_display_and_serde() {
        let id = PeerId::new("peerA");
        assert_eq!(id.to_string(), "peerA");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"peerA\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_larger_id_is_polite() {
        let a = PeerId::from("peerA");
        let b = PeerId::from("peerB");
        assert_eq!(NegotiationRole::between(&b, &a), NegotiationRole::Polite);
        assert_eq!(NegotiationRole::between(&a, &b), NegotiationRole::Impolite);
    }

    proptest! {
        #[test]
        fn exactly_one_side_is_polite(a in "[a-zA-Z0-9-]{1,16}", b in "[a-zA-Z0-9-]{1,16}") {
            prop_assume!(a != b);
            let a = PeerId::new(a);
            let b = PeerId::new(b);
            let a_polite = NegotiationRole::between(&a, &b).is_polite();
            let b_polite = NegotiationRole::between(&b, &a).is_polite();
            prop_assert!(a_polite != b_polite);
            // The larger id always yields
            prop_assert_eq!(a_polite, a > b);
        }
    }
}
