//! Participant identity
//!
//! Participants are identified by the user id the signaling authority knows
//! them by. Ids are totally ordered: glare resolution between two peers that
//! offered at the same time relies on both sides comparing the same pair of
//! ids and reaching the same verdict.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Debug, Display};

/// Identifier of a call participant (the LMS user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a participant id, rejecting blank input
    ///
    /// # Errors
    ///
    /// Returns error if `s` is empty or whitespace only
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("participant id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Which side of a simultaneous-offer collision this participant is on
    /// when negotiating with `remote`.
    ///
    /// The side whose id sorts lower yields: it drops its own outgoing offer
    /// and answers the remote one.
    #[must_use]
    pub fn glare_role(&self, remote: &ParticipantId) -> GlareRole {
        match self.cmp(remote) {
            Ordering::Less => GlareRole::Yield,
            Ordering::Greater | Ordering::Equal => GlareRole::Hold,
        }
    }
}

/// Outcome of id comparison during glare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareRole {
    /// Discard the local offer and answer the inbound one
    Yield,
    /// Keep the local offer in flight and ignore the inbound one
    Hold,
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
