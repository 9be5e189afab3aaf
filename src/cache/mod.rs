use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::asr::RawTranscript;
use crate::transcript::{self, OutputFormat, Transcript, TranscriptMeta, TranscriptOutput};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

/// One stored result, keyed by `(file_hash, output_format)`. The raw engine output is kept
/// so other formats can be derived without another inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_hash: String,
    pub output_format: OutputFormat,
    pub file_name: String,
    pub result: TranscriptOutput,
    pub raw: RawTranscript,
    pub duration: f64,
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub distinct_files: u64,
    pub total_audio_seconds: f64,
}

#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, file_hash: &str, format: OutputFormat) -> Result<Option<CacheEntry>>;
    /// Any entry for the hash, whatever its format.
    async fn find_any(&self, file_hash: &str) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: &CacheEntry) -> Result<()>;
    async fn touch(&self, file_hash: &str, format: OutputFormat, at: DateTime<Utc>) -> Result<()>;
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn stats(&self) -> Result<CacheStats>;
}

/// Content-hash result cache consulted at submission and again after upload.
pub struct CacheGateway {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    merge_gap: f64,
}

impl CacheGateway {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool, merge_gap: f64) -> Self {
        Self {
            store,
            enabled,
            merge_gap,
        }
    }

    pub fn in_memory(merge_gap: f64) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), true, merge_gap)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn lookup(&self, file_hash: &str, format: OutputFormat) -> Result<Option<TranscriptOutput>> {
        if !self.enabled {
            return Ok(None);
        }

        if let Some(entry) = self.store.get(file_hash, format).await? {
            self.store.touch(file_hash, format, Utc::now()).await?;
            debug!("Cache hit for {} ({})", file_hash, format);
            return Ok(Some(entry.result));
        }

        let Some(source) = self.store.find_any(file_hash).await? else {
            return Ok(None);
        };

        info!("Deriving {} result for {} from cached {} entry", format, file_hash, source.output_format);
        let meta = TranscriptMeta {
            task_id: String::new(),
            file_name: source.file_name.clone(),
            file_hash: file_hash.to_string(),
            duration: source.duration,
            processing_time: source.processing_time,
        };
        let result = transcript::render(format, &source.raw, meta, self.merge_gap);
        let now = Utc::now();
        self.store
            .put(&CacheEntry {
                output_format: format,
                result: result.clone(),
                created_at: now,
                accessed_at: now,
                ..source
            })
            .await?;
        Ok(Some(result))
    }

    /// Stores the JSON transcript and, when different, the rendering the task asked for.
    pub async fn store(
        &self,
        transcript: &Transcript,
        raw: &RawTranscript,
        requested: &TranscriptOutput,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = Utc::now();
        let base = CacheEntry {
            file_hash: transcript.file_hash.clone(),
            output_format: OutputFormat::Json,
            file_name: transcript.file_name.clone(),
            result: TranscriptOutput::Json(transcript.clone()),
            raw: raw.clone(),
            duration: transcript.duration,
            processing_time: transcript.processing_time,
            created_at: now,
            accessed_at: now,
        };
        self.store.put(&base).await?;

        if requested.format() != OutputFormat::Json {
            self.store
                .put(&CacheEntry {
                    output_format: requested.format(),
                    result: requested.clone(),
                    ..base
                })
                .await?;
        }
        Ok(())
    }

    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let removed = self.store.purge_before(Utc::now() - Duration::days(days)).await?;
        if removed > 0 {
            info!("Purged {} cache entries older than {} days", removed, days);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.store.stats().await
    }
}
