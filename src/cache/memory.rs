use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheStats, CacheStore};
use crate::transcript::OutputFormat;

type Key = (String, OutputFormat);

pub struct MemoryCacheStore {
    entries: RwLock<HashMap<Key, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("cache lock poisoned")
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, file_hash: &str, format: OutputFormat) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&(file_hash.to_string(), format)).cloned())
    }

    async fn find_any(&self, file_hash: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let json = entries.get(&(file_hash.to_string(), OutputFormat::Json));
        Ok(json
            .or_else(|| entries.values().find(|e| e.file_hash == file_hash))
            .cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert((entry.file_hash.clone(), entry.output_format), entry.clone());
        Ok(())
    }

    async fn touch(&self, file_hash: &str, format: OutputFormat, at: DateTime<Utc>) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if let Some(entry) = entries.get_mut(&(file_hash.to_string(), format)) {
            entry.accessed_at = at;
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut seen = HashSet::new();
        let mut total_audio_seconds = 0.0;
        for entry in entries.values() {
            if seen.insert(entry.file_hash.as_str()) {
                total_audio_seconds += entry.duration;
            }
        }
        Ok(CacheStats {
            entries: entries.len() as u64,
            distinct_files: seen.len() as u64,
            total_audio_seconds,
        })
    }
}
