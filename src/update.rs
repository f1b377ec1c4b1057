//! Update messages and identifier validation.
//!
//! An [`UpdateMessage`] is the unit of work that flows from the REST intake
//! (or a peer node) through the update queue, the dispatcher and the router.
//! It only lives for one dispatch cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::MAX_ID_LEN;

/// Channel version. Monotonically non-decreasing per channel.
pub type Version = u64;

/// Invalid UAID or CHID.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Identifier was empty.
    #[error("{kind} is empty")]
    Empty {
        /// Which identifier ("uaid" or "chid").
        kind: &'static str,
    },
    /// Identifier exceeded [`MAX_ID_LEN`].
    #[error("{kind} is too long ({len} chars, max {MAX_ID_LEN})")]
    TooLong {
        /// Which identifier.
        kind: &'static str,
        /// Actual length.
        len: usize,
    },
    /// Identifier contained a character outside `[A-Za-z0-9_-]`.
    #[error("{kind} contains invalid character {ch:?}")]
    InvalidChar {
        /// Which identifier.
        kind: &'static str,
        /// Offending character.
        ch: char,
    },
}

fn validate_id(kind: &'static str, id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty { kind });
    }
    let len = id.chars().count();
    if len > MAX_ID_LEN {
        return Err(IdError::TooLong { kind, len });
    }
    if let Some(ch) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::InvalidChar { kind, ch });
    }
    Ok(())
}

/// Validate a client identifier.
pub fn validate_uaid(uaid: &str) -> Result<(), IdError> {
    validate_id("uaid", uaid)
}

/// Validate a channel identifier.
pub fn validate_chid(chid: &str) -> Result<(), IdError> {
    validate_id("chid", chid)
}

/// Assign a fresh UAID for a client that did not present a usable one.
pub fn new_uaid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Where an update entered this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Posted to this node's REST intake.
    Local,
    /// Forwarded by a peer node that does not own the client.
    Peer,
}

/// A version bump for one channel of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    /// Client identifier.
    pub uaid: String,
    /// Channel identifier.
    pub chid: String,
    /// New channel version.
    pub version: Version,
    /// When the update arrived at the first node that saw it.
    pub received_at: DateTime<Utc>,
    /// Where the update entered this node.
    pub origin: Origin,
}

impl UpdateMessage {
    /// Create a locally-originated update stamped with the current time.
    pub fn new(uaid: impl Into<String>, chid: impl Into<String>, version: Version) -> Self {
        Self {
            uaid: uaid.into(),
            chid: chid.into(),
            version,
            received_at: Utc::now(),
            origin: Origin::Local,
        }
    }

    /// Validate both identifiers.
    pub fn validate(&self) -> Result<(), IdError> {
        validate_uaid(&self.uaid)?;
        validate_chid(&self.chid)
    }
}

impl std::fmt::Display for UpdateMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.uaid, self.chid, self.version)
    }
}

/// Wire body of a forwarded update (`POST /route/{uaid}` on the shard listener).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardBody {
    /// Channel identifier.
    pub chid: String,
    /// New channel version.
    pub version: Version,
    /// Arrival time at the originating node.
    pub time: DateTime<Utc>,
}

impl ForwardBody {
    /// Build the wire body for an update.
    pub fn from_update(update: &UpdateMessage) -> Self {
        Self {
            chid: update.chid.clone(),
            version: update.version,
            time: update.received_at,
        }
    }

    /// Rebuild the update on the receiving node.
    pub fn into_update(self, uaid: String) -> UpdateMessage {
        UpdateMessage {
            uaid,
            chid: self.chid,
            version: self.version,
            received_at: self.time,
            origin: Origin::Peer,
        }
    }
}
