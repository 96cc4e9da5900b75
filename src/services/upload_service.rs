//! UploadSessionManager: lifecycle of chunked video uploads.
//!
//! A client opens a sequence, uploads numbered parts, then closes it:
//!
//! ```text
//! open(token) -> id
//! accept_part(id, 1, token, bytes) ... accept_part(id, n, token, bytes)
//! close(id, token)                  -> finalizer(id, [1..n])
//! ```
//!
//! Each sequence sits behind its own async mutex which is held for the whole
//! of a part write or close, so a close can never interleave with a write on
//! the same sequence. The map of sequences is only locked long enough to
//! clone the entry out.

use crate::{
    models::sequence::{CloseAck, PartAck, SequenceId, SequenceState, UploadSequence},
    services::{
        finalizer::{FinalizeError, Finalizer},
        part_store::{ByteStream, PartStore, StoreError, with_read_timeout},
        user_service::{UserDirectory, UserError},
    },
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Missing {0} parameter")]
    MissingHeader(&'static str),
    #[error("token is missing, unknown or does not own the sequence")]
    Unauthorized,
    #[error("sequence `{0}` not found")]
    NotFound(String),
    #[error("sequence {0} is closed")]
    InvalidState(SequenceId),
    #[error("invalid part number `{0}`")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("finalizing sequence failed: {0}")]
    Finalize(#[from] FinalizeError),
    #[error(transparent)]
    User(#[from] UserError),
}

pub type UploadResult<T> = Result<T, UploadError>;

type SequenceMap = HashMap<SequenceId, Arc<Mutex<UploadSequence>>>;

/// Longest wait for the next chunk of a part body.
const DEFAULT_PART_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct UploadSessionManager {
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn PartStore>,
    finalizer: Arc<dyn Finalizer>,
    idle_timeout: Duration,
    part_read_timeout: Option<Duration>,
    sequences: RwLock<SequenceMap>,
}

impl UploadSessionManager {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn PartStore>,
        finalizer: Arc<dyn Finalizer>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            users,
            store,
            finalizer,
            idle_timeout,
            part_read_timeout: Some(DEFAULT_PART_READ_TIMEOUT),
            sequences: RwLock::new(HashMap::new()),
        }
    }

    /// Bound the wait for each chunk of a part body; zero disables the limit.
    ///
    /// A part write holds its sequence lock, so this also bounds how long a
    /// stalled client can hold up `close` and idle expiry.
    pub fn with_part_read_timeout(mut self, limit: Duration) -> Self {
        self.part_read_timeout = (!limit.is_zero()).then_some(limit);
        self
    }

    /// Start a new sequence owned by `token`.
    ///
    /// The token must resolve to a user; otherwise Unauthorized.
    pub async fn open(&self, token: &str) -> UploadResult<SequenceId> {
        let user = self
            .users
            .resolve_user(token)
            .await?
            .ok_or(UploadError::Unauthorized)?;

        let now = Utc::now();
        let id = {
            let mut map = self
                .sequences
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            loop {
                let sequence = UploadSequence::new(token, now);
                if let Entry::Vacant(slot) = map.entry(sequence.id) {
                    let id = sequence.id;
                    slot.insert(Arc::new(Mutex::new(sequence)));
                    break id;
                }
            }
        };

        info!(sequence = %id, user = %user.email, "opened upload sequence");
        Ok(id)
    }

    /// Store one part of an open sequence.
    ///
    /// Checks run in this order: NotFound, InvalidState (closed), Unauthorized
    /// (token is not the owner), InvalidArgument (part number below 1). A
    /// part that was already received is overwritten. If the store fails the
    /// part is not recorded.
    pub async fn accept_part(
        &self,
        id: SequenceId,
        part_number: i64,
        token: &str,
        data: ByteStream,
    ) -> UploadResult<PartAck> {
        self.accept(id, Ok(part_number), token, data).await
    }

    /// [`accept_part`](Self::accept_part) with the part number still in its
    /// `Moteve-Part` header form. A missing or non-numeric value is reported
    /// only after the sequence checks, so a closed sequence still answers
    /// InvalidState.
    pub async fn accept_raw_part(
        &self,
        id: SequenceId,
        raw_part: Option<&str>,
        token: &str,
        data: ByteStream,
    ) -> UploadResult<PartAck> {
        let part_number = match raw_part {
            None => Err(UploadError::MissingHeader("Moteve-Part")),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| UploadError::InvalidArgument(raw.to_string())),
        };
        self.accept(id, part_number, token, data).await
    }

    async fn accept(
        &self,
        id: SequenceId,
        part_number: UploadResult<i64>,
        token: &str,
        data: ByteStream,
    ) -> UploadResult<PartAck> {
        let entry = self.lookup(id)?;
        let mut sequence = entry.lock().await;

        if !sequence.state.is_open() {
            return Err(UploadError::InvalidState(id));
        }
        if !sequence.is_owned_by(token) {
            return Err(UploadError::Unauthorized);
        }
        let part_number = part_number?;
        let part = u32::try_from(part_number)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| UploadError::InvalidArgument(part_number.to_string()))?;

        let data = match self.part_read_timeout {
            Some(limit) => with_read_timeout(data, limit),
            None => data,
        };
        let receipt = self.store.put(id, part, data).await?;

        let replaced = !sequence.received_parts.insert(part);
        sequence.touch(Utc::now());
        debug!(
            sequence = %id,
            part,
            size = receipt.size_bytes,
            replaced,
            "accepted part"
        );

        Ok(PartAck {
            sequence_id: id,
            part_number: part,
            size_bytes: receipt.size_bytes,
            md5: receipt.md5,
        })
    }

    /// Close a sequence and hand its parts to the finalizer.
    ///
    /// Closing is terminal: the sequence stays Closed even if finalization
    /// fails, and a second close reports InvalidState.
    pub async fn close(&self, id: SequenceId, token: &str) -> UploadResult<CloseAck> {
        let entry = self.lookup(id)?;
        let parts: Vec<u32> = {
            let mut sequence = entry.lock().await;
            if !sequence.state.is_open() {
                return Err(UploadError::InvalidState(id));
            }
            if !sequence.is_owned_by(token) {
                return Err(UploadError::Unauthorized);
            }
            sequence.state = SequenceState::Closed;
            sequence.touch(Utc::now());
            sequence.received_parts.iter().copied().collect()
        };

        let size_bytes = if parts.is_empty() {
            info!(sequence = %id, "closed empty sequence");
            0
        } else {
            self.finalizer.finalize(id, &parts).await.map_err(|err| {
                warn!(sequence = %id, "finalization failed: {}", err);
                UploadError::Finalize(err)
            })?
        };

        info!(sequence = %id, parts = parts.len(), size_bytes, "closed upload sequence");
        Ok(CloseAck {
            sequence_id: id,
            parts,
            size_bytes,
        })
    }

    /// Forget sequences idle for longer than the idle timeout and delete
    /// their stored parts. Sequences busy with a write or close are skipped.
    /// Returns the number of sequences evicted.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let mut evicted: Vec<(SequenceId, Vec<u32>)> = Vec::new();
        {
            let mut map = self
                .sequences
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.retain(|id, entry| {
                let Ok(mut sequence) = entry.try_lock() else {
                    return true;
                };
                if !self.is_idle(&sequence, now) {
                    return true;
                }
                // A request still holding this entry will see it as closed.
                sequence.state = SequenceState::Closed;
                evicted.push((*id, sequence.received_parts.iter().copied().collect()));
                false
            });
        }

        for (id, parts) in &evicted {
            for &part in parts {
                if let Err(err) = self.store.delete(*id, part).await {
                    warn!(sequence = %id, part, "failed to delete expired part: {}", err);
                }
            }
            debug!(sequence = %id, parts = parts.len(), "expired idle sequence");
        }
        evicted.len()
    }

    /// Number of tracked sequences, open or closed.
    pub fn len(&self) -> usize {
        self.sequences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_idle(&self, sequence: &UploadSequence, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(sequence.last_activity)
            .to_std()
            .map(|age| age >= self.idle_timeout)
            .unwrap_or(false)
    }

    fn lookup(&self, id: SequenceId) -> UploadResult<Arc<Mutex<UploadSequence>>> {
        self.sequences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }
}

/// Spawn a background task that periodically evicts idle sequences.
pub fn spawn_expiry_task(
    manager: Arc<UploadSessionManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    // tokio::time::interval panics on a zero period
    let interval = if interval.is_zero() {
        warn!("sequence sweep interval is 0, using default of 60 seconds");
        Duration::from_secs(60)
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = manager.expire_idle(Utc::now()).await;
            if evicted > 0 {
                info!(
                    evicted,
                    remaining = manager.len(),
                    "sequence sweep evicted idle uploads"
                );
            }
        }
    })
}

#[cfg(test)]
impl UploadSessionManager {
    /// Snapshot of a sequence, if it is still tracked.
    pub async fn sequence(&self, id: SequenceId) -> Option<UploadSequence> {
        let entry = self.lookup(id).ok()?;
        let sequence = entry.lock().await;
        Some(sequence.clone())
    }
}
