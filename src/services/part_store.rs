//! Content stores for uploaded video parts.
//!
//! A [`PartStore`] keeps raw part payloads keyed by `(sequence, part)`. The
//! upload session manager only records a part as received after `put`
//! returns, so every implementation must either store the whole payload or
//! leave any previous payload for that key untouched.

use crate::models::sequence::SequenceId;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use md5::Context;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Mutex,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// A boxed stream of payload bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("part {part} of sequence {sequence} not found")]
    NotFound { sequence: SequenceId, part: u32 },
    #[error("failed reading request body: {0}")]
    InvalidBody(io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What a successful `put` wrote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartReceipt {
    pub size_bytes: u64,
    /// Lowercase hex MD5 of the payload.
    pub md5: String,
}

#[async_trait]
pub trait PartStore: Send + Sync {
    /// Store the payload of one part, replacing whatever was stored before.
    async fn put(&self, sequence: SequenceId, part: u32, data: ByteStream)
    -> StoreResult<PartReceipt>;

    /// Read a stored part back.
    async fn get(&self, sequence: SequenceId, part: u32) -> StoreResult<ByteStream>;

    /// Remove a part. Removing a part that was never stored is not an error.
    async fn delete(&self, sequence: SequenceId, part: u32) -> StoreResult<()>;
}

/// Wrap an in-memory payload as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Fail the stream with `TimedOut` when no chunk arrives within `limit`.
///
/// The stream ends after the timeout error, so a stalled client cannot keep
/// a write (and the sequence lock around it) open.
pub fn with_read_timeout(data: ByteStream, limit: Duration) -> ByteStream {
    Box::pin(stream::unfold(Some(data), move |state| async move {
        let Some(mut data) = state else {
            return None;
        };
        match tokio::time::timeout(limit, data.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(data))),
            Ok(None) => None,
            Err(_) => {
                let err = io::Error::new(
                    ErrorKind::TimedOut,
                    format!("no data received for {:?}", limit),
                );
                Some((Err(err), None))
            }
        }
    }))
}

/// Parts on local disk under `base_path/parts/{sequence}/{part}.3gp`.
#[derive(Clone, Debug)]
pub struct FsPartStore {
    base_path: PathBuf,
}

impl FsPartStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn sequence_dir(&self, sequence: SequenceId) -> PathBuf {
        let mut path = self.base_path.join("parts");
        path.push(sequence.to_string());
        path
    }

    fn part_path(&self, sequence: SequenceId, part: u32) -> PathBuf {
        self.sequence_dir(sequence).join(format!("{}.3gp", part))
    }
}

#[async_trait]
impl PartStore for FsPartStore {
    /// Streams into a temp file next to the final location, fsyncs, then
    /// renames over the previous payload. The temp file is removed on error
    /// and when the future is dropped mid-write.
    async fn put(
        &self,
        sequence: SequenceId,
        part: u32,
        data: ByteStream,
    ) -> StoreResult<PartReceipt> {
        let dir = self.sequence_dir(sequence);
        fs::create_dir_all(&dir).await?;
        let file_path = self.part_path(sequence, part);
        let mut tmp = TempFileGuard::new(dir.join(format!(".tmp-{}", Uuid::new_v4())));

        let receipt = write_stream(tmp.path(), data).await?;
        fs::rename(tmp.path(), &file_path).await?;
        tmp.disarm();

        debug!(
            %sequence,
            part,
            size = receipt.size_bytes,
            path = %file_path.display(),
            "stored part"
        );
        Ok(receipt)
    }

    async fn get(&self, sequence: SequenceId, part: u32) -> StoreResult<ByteStream> {
        let file = File::open(self.part_path(sequence, part))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound { sequence, part }
                } else {
                    StoreError::Io(err)
                }
            })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn delete(&self, sequence: SequenceId, part: u32) -> StoreResult<()> {
        let file_path = self.part_path(sequence, part);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed part file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::Io(err)),
        }

        // Drop the sequence directory once its last part is gone.
        match fs::remove_dir(self.sequence_dir(sequence)).await {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(err) => debug!("failed to prune sequence directory: {}", err),
        }
        Ok(())
    }
}

/// Removes a temp file when dropped, unless it was renamed into place.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(_) => debug!("removed abandoned temp file {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temp file {}: {}", self.path.display(), err),
        }
    }
}

/// Copy `data` into a new file at `path`, hashing as it goes.
async fn write_stream(path: &Path, mut data: ByteStream) -> StoreResult<PartReceipt> {
    let mut file = File::create(path).await?;
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();

    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(StoreError::InvalidBody)?;
        size_bytes += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(PartReceipt {
        size_bytes,
        md5: format!("{:x}", digest.compute()),
    })
}

/// Parts held in process memory. Used in tests and for throwaway setups.
#[derive(Debug, Default)]
pub struct MemoryPartStore {
    parts: Mutex<HashMap<(SequenceId, u32), Bytes>>,
}

impl MemoryPartStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<(SequenceId, u32), Bytes>>> {
        self.parts
            .lock()
            .map_err(|_| StoreError::Io(io::Error::other("part store lock poisoned")))
    }
}

#[async_trait]
impl PartStore for MemoryPartStore {
    async fn put(
        &self,
        sequence: SequenceId,
        part: u32,
        mut data: ByteStream,
    ) -> StoreResult<PartReceipt> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk.map_err(StoreError::InvalidBody)?);
        }
        let receipt = PartReceipt {
            size_bytes: buf.len() as u64,
            md5: format!("{:x}", md5::compute(&buf)),
        };
        self.lock()?.insert((sequence, part), buf.freeze());
        Ok(receipt)
    }

    async fn get(&self, sequence: SequenceId, part: u32) -> StoreResult<ByteStream> {
        let data = self
            .lock()?
            .get(&(sequence, part))
            .cloned()
            .ok_or(StoreError::NotFound { sequence, part })?;
        Ok(bytes_stream(data))
    }

    async fn delete(&self, sequence: SequenceId, part: u32) -> StoreResult<()> {
        self.lock()?.remove(&(sequence, part));
        Ok(())
    }
}

/// Drain a stream into memory.
#[cfg(test)]
pub async fn collect(mut data: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = data.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
impl MemoryPartStore {
    /// Number of parts currently stored.
    pub fn len(&self) -> usize {
        self.parts.lock().map(|parts| parts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn failing_stream(first: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(first)),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]))
    }

    #[tokio::test]
    async fn fs_store_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = FsPartStore::new(dir.path());
        let seq = SequenceId::new();

        let receipt = store.put(seq, 1, bytes_stream("hello")).await.unwrap();
        assert_eq!(receipt.size_bytes, 5);
        assert_eq!(receipt.md5, format!("{:x}", md5::compute(b"hello")));

        let data = collect(store.get(seq, 1).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"hello");

        store.delete(seq, 1).await.unwrap();
        assert!(matches!(
            store.get(seq, 1).await,
            Err(StoreError::NotFound { part: 1, .. })
        ));
        assert!(!dir.path().join("parts").join(seq.to_string()).exists());

        // Deleting again is fine.
        store.delete(seq, 1).await.unwrap();
    }

    #[tokio::test]
    async fn fs_store_overwrites_part() {
        let dir = tempdir().unwrap();
        let store = FsPartStore::new(dir.path());
        let seq = SequenceId::new();

        store.put(seq, 3, bytes_stream("first")).await.unwrap();
        store.put(seq, 3, bytes_stream("second")).await.unwrap();

        let data = collect(store.get(seq, 3).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"second");
    }

    #[tokio::test]
    async fn fs_store_failed_put_keeps_previous_payload() {
        let dir = tempdir().unwrap();
        let store = FsPartStore::new(dir.path());
        let seq = SequenceId::new();

        store.put(seq, 1, bytes_stream("good")).await.unwrap();
        let err = store.put(seq, 1, failing_stream(b"partial")).await;
        assert!(matches!(err, Err(StoreError::InvalidBody(_))));

        let data = collect(store.get(seq, 1).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"good");

        // No temp files left behind.
        let mut entries = fs::read_dir(dir.path().join("parts").join(seq.to_string()))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["1.3gp".to_string()]);
    }

    /// Sends `first`, then never finishes.
    fn stalled_stream(first: &'static [u8]) -> ByteStream {
        Box::pin(stream::once(async move { Ok(Bytes::from_static(first)) }).chain(stream::pending()))
    }

    fn dir_entries(path: &Path) -> Vec<String> {
        match std::fs::read_dir(path) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn fs_store_aborted_put_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FsPartStore::new(dir.path()));
        let seq = SequenceId::new();
        let seq_dir = dir.path().join("parts").join(seq.to_string());

        let handle = {
            let store = store.clone();
            tokio::spawn(async move { store.put(seq, 1, stalled_stream(b"head")).await })
        };

        // Wait until the write has started.
        for _ in 0..200 {
            if !dir_entries(&seq_dir).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dir_entries(&seq_dir).len(), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(dir_entries(&seq_dir).is_empty());

        // With nothing left, delete prunes the sequence directory.
        store.delete(seq, 1).await.unwrap();
        assert!(!seq_dir.exists());
    }

    #[tokio::test]
    async fn read_timeout_ends_a_stalled_stream() {
        let dir = tempdir().unwrap();
        let store = FsPartStore::new(dir.path());
        let seq = SequenceId::new();

        let data = with_read_timeout(stalled_stream(b"head"), Duration::from_millis(50));
        match store.put(seq, 1, data).await {
            Err(StoreError::InvalidBody(err)) => assert_eq!(err.kind(), ErrorKind::TimedOut),
            other => panic!("expected a timed out body, got {:?}", other.map(|r| r.size_bytes)),
        }
        assert!(dir_entries(&dir.path().join("parts").join(seq.to_string())).is_empty());

        // A stream that keeps delivering is passed through unchanged.
        let data = with_read_timeout(bytes_stream("quick"), Duration::from_millis(50));
        assert_eq!(store.put(seq, 1, data).await.unwrap().size_bytes, 5);
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_failure() {
        let store = MemoryPartStore::new();
        let seq = SequenceId::new();

        store.put(seq, 2, bytes_stream("abc")).await.unwrap();
        assert!(store.put(seq, 2, failing_stream(b"x")).await.is_err());
        let data = collect(store.get(seq, 2).await.unwrap()).await.unwrap();
        assert_eq!(&data[..], b"abc");

        store.delete(seq, 2).await.unwrap();
        assert_eq!(store.len(), 0);
    }
}
