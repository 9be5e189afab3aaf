//! Reassembly of uploaded files, whole or in fixed-size chunks, with integrity checks
//! before a file is handed to the task manager.

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TranscriptionConfig;
use crate::error::{ErrorKind, TaskError};
use crate::utils::hash::{sha256_file, sha256_hex};

pub mod validate;


#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no upload session for task {0}")]
    SessionNotFound(String),
    #[error("upload session for task {0} already exists")]
    SessionExists(String),
    #[error("chunk {index} is out of range, expected 0..{total}")]
    ChunkOutOfRange { index: u64, total: u64 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLength { index: u64, expected: u64, actual: u64 },
    #[error("chunk {index} does not match its declared hash")]
    ChunkHash { index: u64 },
    #[error("upload incomplete, {missing} chunks missing")]
    Incomplete { missing: u64 },
    #[error("file hash mismatch: declared {expected}, received {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("file size mismatch: declared {expected}, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::SessionExists(_) | Self::Incomplete { .. } => ErrorKind::InvalidMessage,
            Self::ChunkOutOfRange { .. } | Self::ChunkLength { .. } | Self::ChunkHash { .. } => ErrorKind::ChunkRejected,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Failures that end the upload for good; the task behind it should be rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::SizeMismatch { .. } | Self::Io(_))
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError::new(self.kind(), self.to_string())
    }
}

/// What the client declared about the file it is about to send.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub task_id: String,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Received,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub task_id: String,
    pub chunk_index: u64,
    pub status: ChunkStatus,
    pub received_chunks: u64,
    pub total_chunks: u64,
    pub progress: u8,
    /// Every chunk has arrived and the session is ready to finalize.
    #[serde(skip)]
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub task_id: String,
    pub received_chunks: u64,
    pub missing_chunks: Vec<u64>,
    pub total_chunks: u64,
}

struct UploadSession {
    meta: SessionMeta,
    total_chunks: u64,
    received: BTreeSet<u64>,
    /// Deleted from disk when the session is dropped without being persisted.
    backing: Option<NamedTempFile>,
    writer: tokio::fs::File,
    last_activity: Instant,
}

impl UploadSession {
    fn expected_len(&self, index: u64) -> u64 {
        if index + 1 == self.total_chunks {
            self.meta.file_size - index * self.meta.chunk_size
        } else {
            self.meta.chunk_size
        }
    }

    fn ack(&self, index: u64, status: ChunkStatus) -> ChunkAck {
        let received = self.received.len() as u64;
        ChunkAck {
            task_id: self.meta.task_id.clone(),
            chunk_index: index,
            status,
            received_chunks: received,
            total_chunks: self.total_chunks,
            progress: (received * 100 / self.total_chunks.max(1)) as u8,
            complete: received == self.total_chunks,
        }
    }

    fn missing(&self) -> Vec<u64> {
        (0..self.total_chunks).filter(|i| !self.received.contains(i)).collect()
    }
}

pub struct UploadSessionManager {
    sessions: Mutex<HashMap<String, Arc<Mutex<UploadSession>>>>,
    temp_dir: PathBuf,
    upload_dir: PathBuf,
    idle_timeout: Duration,
}

impl UploadSessionManager {
    pub fn new(temp_dir: PathBuf, upload_dir: PathBuf, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            temp_dir,
            upload_dir,
            idle_timeout,
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> Self {
        Self::new(
            config.temp_dir.clone(),
            config.upload_dir.clone(),
            Duration::from_secs(config.chunk_timeout_secs),
        )
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Starts a chunked upload with a temp file sized to the declared total.
    pub async fn open(&self, meta: SessionMeta) -> Result<SessionInfo, UploadError> {
        let chunk_size = meta.chunk_size.max(1);
        let total_chunks = meta.file_size.div_ceil(chunk_size);

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&meta.task_id) {
            return Err(UploadError::SessionExists(meta.task_id.clone()));
        }

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let backing = tempfile::Builder::new()
            .prefix("upload_")
            .suffix(".part")
            .tempfile_in(&self.temp_dir)?;
        let writer = tokio::fs::File::from_std(backing.reopen()?);
        writer.set_len(meta.file_size).await?;

        let info = SessionInfo {
            task_id: meta.task_id.clone(),
            chunk_size,
            total_chunks,
        };
        info!(
            "Opened upload session {} ({} bytes in {} chunks of {})",
            meta.task_id, meta.file_size, total_chunks, chunk_size
        );
        sessions.insert(
            meta.task_id.clone(),
            Arc::new(Mutex::new(UploadSession {
                meta: SessionMeta { chunk_size, ..meta },
                total_chunks,
                received: BTreeSet::new(),
                backing: Some(backing),
                writer,
                last_activity: Instant::now(),
            })),
        );
        Ok(info)
    }

    async fn session(&self, task_id: &str) -> Result<Arc<Mutex<UploadSession>>, UploadError> {
        self.sessions
            .lock()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(task_id.to_string()))
    }

    /// Writes one chunk. Re-sending a received index is acknowledged as a duplicate and
    /// leaves the file untouched. A rejected chunk leaves the session open.
    pub async fn put_chunk(
        &self,
        task_id: &str,
        index: u64,
        bytes: &[u8],
        chunk_hash: Option<&str>,
    ) -> Result<ChunkAck, UploadError> {
        let session = self.session(task_id).await?;
        let mut session = session.lock().await;
        session.last_activity = Instant::now();

        if session.received.contains(&index) {
            debug!("Duplicate chunk {} for {}", index, task_id);
            return Ok(session.ack(index, ChunkStatus::Duplicate));
        }
        if index >= session.total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index,
                total: session.total_chunks,
            });
        }
        let expected = session.expected_len(index);
        if bytes.len() as u64 != expected {
            return Err(UploadError::ChunkLength {
                index,
                expected,
                actual: bytes.len() as u64,
            });
        }
        if let Some(declared) = chunk_hash {
            if !sha256_hex(bytes).eq_ignore_ascii_case(declared) {
                return Err(UploadError::ChunkHash { index });
            }
        }

        let offset = index * session.meta.chunk_size;
        session.writer.seek(SeekFrom::Start(offset)).await?;
        session.writer.write_all(bytes).await?;
        session.received.insert(index);
        Ok(session.ack(index, ChunkStatus::Received))
    }

    /// Verifies the reassembled file against the declared hash and moves it into the upload
    /// directory. The session is gone afterwards whether verification passed or not.
    pub async fn finalize(&self, task_id: &str) -> Result<PathBuf, UploadError> {
        let session = self.session(task_id).await?;
        let mut session = session.lock().await;
        let missing = session.total_chunks - session.received.len() as u64;
        if missing > 0 {
            return Err(UploadError::Incomplete { missing });
        }
        self.sessions.lock().await.remove(task_id);

        session.writer.flush().await?;
        session.writer.sync_all().await?;
        let Some(backing) = session.backing.take() else {
            return Err(UploadError::SessionNotFound(task_id.to_string()));
        };

        let actual = sha256_file(backing.path()).await?;
        if !actual.eq_ignore_ascii_case(&session.meta.file_hash) {
            warn!("Upload {} failed verification: {} != {}", task_id, actual, session.meta.file_hash);
            return Err(UploadError::HashMismatch {
                expected: session.meta.file_hash.clone(),
                actual,
            });
        }

        let path = self.persist(backing, &session.meta.file_hash, &session.meta.file_name).await?;
        info!("Upload {} complete: {}", task_id, path.display());
        Ok(path)
    }

    /// Single-shot upload: the whole file in one message.
    pub async fn save_single(
        &self,
        task_id: &str,
        file_name: &str,
        declared_size: u64,
        declared_hash: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, UploadError> {
        if bytes.len() as u64 != declared_size {
            return Err(UploadError::SizeMismatch {
                expected: declared_size,
                actual: bytes.len() as u64,
            });
        }
        let actual = sha256_hex(bytes);
        if !actual.eq_ignore_ascii_case(declared_hash) {
            return Err(UploadError::HashMismatch {
                expected: declared_hash.to_string(),
                actual,
            });
        }

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let backing = tempfile::Builder::new()
            .prefix("upload_")
            .suffix(".part")
            .tempfile_in(&self.temp_dir)?;
        tokio::fs::write(backing.path(), bytes).await?;
        let path = self.persist(backing, declared_hash, file_name).await?;
        info!("Single-shot upload {} saved to {}", task_id, path.display());
        Ok(path)
    }

    /// Uploads are stored by content hash, so identical files share one path.
    async fn persist(&self, backing: NamedTempFile, file_hash: &str, file_name: &str) -> Result<PathBuf, UploadError> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let dest = self.upload_dir.join(stored_name(file_hash, file_name));
        if tokio::fs::try_exists(&dest).await? {
            debug!("{} already stored, reusing", dest.display());
            return Ok(dest);
        }

        match backing.persist(&dest) {
            Ok(_) => Ok(dest),
            // rename fails across filesystems
            Err(e) => {
                tokio::fs::copy(e.file.path(), &dest).await?;
                Ok(dest)
            }
        }
    }

    pub async fn resume_info(&self, task_id: &str) -> Result<ResumeInfo, UploadError> {
        let session = self.session(task_id).await?;
        let mut session = session.lock().await;
        session.last_activity = Instant::now();
        Ok(ResumeInfo {
            task_id: task_id.to_string(),
            received_chunks: session.received.len() as u64,
            missing_chunks: session.missing(),
            total_chunks: session.total_chunks,
        })
    }

    pub async fn abort(&self, task_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(task_id).is_some();
        if removed {
            info!("Upload session {} aborted", task_id);
        }
        removed
    }

    /// Drops sessions idle for longer than the chunk timeout and returns their task ids.
    pub async fn expire_idle(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let mut expired = Vec::new();
        for (task_id, session) in sessions.iter() {
            // a locked session is mid-write and therefore not idle
            let Ok(session) = session.try_lock() else {
                continue;
            };
            if now.duration_since(session.last_activity) > self.idle_timeout {
                expired.push(task_id.clone());
            }
        }
        for task_id in &expired {
            sessions.remove(task_id);
            warn!("Upload session {} abandoned after {:?} idle", task_id, self.idle_timeout);
        }
        expired
    }
}

fn stored_name(file_hash: &str, file_name: &str) -> String {
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", file_hash.to_ascii_lowercase(), ext.to_ascii_lowercase()),
        None => file_hash.to_ascii_lowercase(),
    }
}
