//! Finalization of closed sequences.

use crate::{
    models::sequence::SequenceId,
    services::part_store::{PartStore, StoreError, TempFileGuard},
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("sequence {0} has no parts")]
    Empty(SequenceId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Called once when a sequence is closed, with its part numbers ascending.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Returns the size in bytes of the finished video.
    async fn finalize(&self, sequence: SequenceId, parts: &[u32]) -> Result<u64, FinalizeError>;
}

/// Joins the parts of a sequence into `base_path/videos/{sequence}.3gp` and
/// removes the part payloads afterwards.
pub struct ConcatFinalizer {
    store: Arc<dyn PartStore>,
    base_path: PathBuf,
}

impl ConcatFinalizer {
    pub fn new(store: Arc<dyn PartStore>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_path: base_path.into(),
        }
    }

    pub fn video_path(&self, sequence: SequenceId) -> PathBuf {
        self.base_path
            .join("videos")
            .join(format!("{}.3gp", sequence))
    }

    async fn concat(
        &self,
        sequence: SequenceId,
        parts: &[u32],
        tmp: &Path,
    ) -> Result<u64, FinalizeError> {
        let mut file = File::create(tmp).await?;
        let mut total: u64 = 0;
        for &part in parts {
            let mut data = self.store.get(sequence, part).await?;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                total += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(total)
    }
}

#[async_trait]
impl Finalizer for ConcatFinalizer {
    async fn finalize(&self, sequence: SequenceId, parts: &[u32]) -> Result<u64, FinalizeError> {
        if parts.is_empty() {
            return Err(FinalizeError::Empty(sequence));
        }

        let video_path = self.video_path(sequence);
        let dir = self.base_path.join("videos");
        fs::create_dir_all(&dir).await?;
        let mut tmp = TempFileGuard::new(dir.join(format!(".tmp-{}", Uuid::new_v4())));

        let size = self.concat(sequence, parts, tmp.path()).await?;
        fs::rename(tmp.path(), &video_path).await?;
        tmp.disarm();

        for &part in parts {
            if let Err(err) = self.store.delete(sequence, part).await {
                warn!(%sequence, part, "failed to remove finalized part: {}", err);
            }
        }

        info!(
            %sequence,
            parts = parts.len(),
            size,
            path = %video_path.display(),
            "sequence finalized"
        );
        Ok(size)
    }
}
