//! Upload sequences: one chunked video upload from a mobile client.

use chrono::{DateTime, Utc};
use std::{collections::BTreeSet, fmt};
use uuid::Uuid;

/// Unique identifier of an upload sequence, returned to the client on `new`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(Uuid);

impl SequenceId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the textual form sent back by the client.
    ///
    /// Returns `None` for anything that is not a UUID; callers treat that the
    /// same as an unknown sequence.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SequenceId({})", self.0)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a sequence. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceState {
    Open,
    Closed,
}

impl SequenceState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// An in-progress (or closed) chunked upload.
#[derive(Clone, Debug)]
pub struct UploadSequence {
    pub id: SequenceId,

    /// Token of the device that opened the sequence.
    pub owner_token: String,

    pub state: SequenceState,

    /// Part numbers stored so far (1-based, any order).
    pub received_parts: BTreeSet<u32>,

    pub created_at: DateTime<Utc>,

    /// Last open/accept/close; drives idle expiry.
    pub last_activity: DateTime<Utc>,
}

impl UploadSequence {
    pub fn new(owner_token: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: SequenceId::new(),
            owner_token: owner_token.into(),
            state: SequenceState::Open,
            received_parts: BTreeSet::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_owned_by(&self, token: &str) -> bool {
        self.owner_token == token
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}

/// Acknowledgement of a stored part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartAck {
    pub sequence_id: SequenceId,
    pub part_number: u32,
    pub size_bytes: u64,
    /// Hex MD5 of the stored payload.
    pub md5: String,
}

/// Acknowledgement of a closed sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseAck {
    pub sequence_id: SequenceId,
    /// Parts handed to the finalizer, ascending.
    pub parts: Vec<u32>,
    /// Size of the finalized video.
    pub size_bytes: u64,
}
