use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;

use super::{CacheEntry, CacheStats, CacheStore};
use crate::transcript::OutputFormat;

pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite result cache at {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to an in-memory database is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcription_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_hash TEXT NOT NULL,
                output_format TEXT NOT NULL,
                file_name TEXT NOT NULL,
                result TEXT NOT NULL,
                raw_result TEXT NOT NULL,
                duration REAL NOT NULL,
                processing_time REAL NOT NULL,
                created_at TEXT NOT NULL,
                accessed_at TEXT NOT NULL,
                UNIQUE (file_hash, output_format)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_created_at ON transcription_cache (created_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    fn row_to_entry(&self, row: SqliteRow) -> Result<CacheEntry> {
        let format: String = row.get("output_format");
        let result: String = row.get("result");
        let raw: String = row.get("raw_result");

        Ok(CacheEntry {
            file_hash: row.get("file_hash"),
            output_format: OutputFormat::from_str(&format).map_err(|e| anyhow::anyhow!(e))?,
            file_name: row.get("file_name"),
            result: serde_json::from_str(&result)?,
            raw: serde_json::from_str(&raw)?,
            duration: row.get("duration"),
            processing_time: row.get("processing_time"),
            created_at: DateTime::parse_from_rfc3339(row.get("created_at"))?.with_timezone(&Utc),
            accessed_at: DateTime::parse_from_rfc3339(row.get("accessed_at"))?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, file_hash: &str, format: OutputFormat) -> Result<Option<CacheEntry>> {
        let row = sqlx::query("SELECT * FROM transcription_cache WHERE file_hash = ? AND output_format = ?")
            .bind(file_hash)
            .bind(format.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_to_entry(r)).transpose()
    }

    async fn find_any(&self, file_hash: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM transcription_cache
            WHERE file_hash = ?
            ORDER BY CASE output_format WHEN 'json' THEN 0 ELSE 1 END, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(file_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.row_to_entry(r)).transpose()
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcription_cache
            (file_hash, output_format, file_name, result, raw_result, duration, processing_time, created_at, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (file_hash, output_format) DO UPDATE SET
                file_name = excluded.file_name,
                result = excluded.result,
                raw_result = excluded.raw_result,
                duration = excluded.duration,
                processing_time = excluded.processing_time,
                created_at = excluded.created_at,
                accessed_at = excluded.accessed_at
            "#,
        )
        .bind(&entry.file_hash)
        .bind(entry.output_format.as_str())
        .bind(&entry.file_name)
        .bind(serde_json::to_string(&entry.result)?)
        .bind(serde_json::to_string(&entry.raw)?)
        .bind(entry.duration)
        .bind(entry.processing_time)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.accessed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, file_hash: &str, format: OutputFormat, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE transcription_cache SET accessed_at = ? WHERE file_hash = ? AND output_format = ?")
            .bind(at.to_rfc3339())
            .bind(file_hash)
            .bind(format.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transcription_cache WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM transcription_cache) AS entries,
                COUNT(*) AS distinct_files,
                COALESCE(SUM(duration), 0.0) AS total_audio_seconds
            FROM (SELECT file_hash, MAX(duration) AS duration FROM transcription_cache GROUP BY file_hash)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            entries: row.get::<i64, _>("entries") as u64,
            distinct_files: row.get::<i64, _>("distinct_files") as u64,
            total_audio_seconds: row.get("total_audio_seconds"),
        })
    }
}
