use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::asr::device::DevicePreference;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub transcription: TranscriptionConfig,
    pub database: DatabaseConfig,
    pub notification: NotificationConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes, one in-flight task each.
    pub size: usize,
    pub task_dir: PathBuf,
    /// Worker executable. Defaults to the running binary.
    pub worker_program: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub base_timeout_secs: u64,
    /// Seconds of wall time allowed per second of audio.
    pub duration_factor: f64,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Results larger than this are written gzip-compressed.
    pub json_result_limit_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            task_dir: PathBuf::from("./asr_data/tasks"),
            worker_program: None,
            poll_interval_ms: 100,
            ready_timeout_secs: 300,
            health_check_interval_secs: 30,
            base_timeout_secs: 120,
            duration_factor: 1.0,
            min_timeout_secs: 60,
            max_timeout_secs: 3600,
            shutdown_grace_secs: 5,
            json_result_limit_bytes: 8 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub upload_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub max_queue_size: usize,
    pub retry_times: u32,
    pub retry_backoff_ms: u64,
    pub delete_after_transcription: bool,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub chunk_timeout_secs: u64,
    /// Audio seconds transcribed per minute of wall time.
    pub speed_ratio: f64,
    pub batch_size_s: u32,
    pub hotword: Option<String>,
    pub merge_gap_seconds: f64,
    pub task_ttl_secs: u64,
    pub upload_ttl_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 5000,
            allowed_extensions: [".wav", ".mp3", ".mp4", ".m4a", ".flac", ".aac", ".ogg", ".opus"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            upload_dir: PathBuf::from("./asr_data/uploads"),
            temp_dir: PathBuf::from("./asr_data/tmp"),
            max_queue_size: 100,
            retry_times: 2,
            retry_backoff_ms: 2000,
            delete_after_transcription: true,
            default_chunk_size: 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            chunk_timeout_secs: 600,
            speed_ratio: 300.0,
            batch_size_s: 300,
            hotword: None,
            merge_gap_seconds: 3.0,
            task_ttl_secs: 24 * 3600,
            upload_ttl_secs: 3600,
        }
    }
}

impl TranscriptionConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub cache_enabled: bool,
    pub url: String,
    pub max_cache_days: i64,
    pub maintenance_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            url: "sqlite://./asr_data/database/cache.db?mode=rwc".to_string(),
            max_cache_days: 30,
            maintenance_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub retry_times: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            retry_times: 3,
            timeout_secs: 10,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Mock,
    Command,
    Whisper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub device: DevicePreference,
    pub gpu_count: usize,
    pub threads: usize,
    /// External program for the `command` engine.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub model_path: Option<PathBuf>,
    pub language: Option<String>,
    pub mock: MockEngineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Command,
            device: DevicePreference::Auto,
            gpu_count: 1,
            threads: 4,
            program: Some(PathBuf::from("asr-engine")),
            args: Vec::new(),
            model_path: None,
            language: None,
            mock: MockEngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockEngineConfig {
    pub segment_ms: u64,
    pub delay_ms: u64,
    /// When this file exists the worker removes it and exits mid-task.
    pub crash_marker: Option<PathBuf>,
    /// Exit mid-task on every call.
    pub crash_always: bool,
    /// Every transcribe call appends one line to this file.
    pub invocation_log: Option<PathBuf>,
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            segment_ms: 5000,
            delay_ms: 0,
            crash_marker: None,
            crash_always: false,
            invocation_log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads `path` if it exists, otherwise falls back to defaults. The result is validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            warn!("Config file {} not found, using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pool.size == 0 {
            return invalid("pool.size must be at least 1".into());
        }
        if self.pool.poll_interval_ms == 0 {
            return invalid("pool.poll_interval_ms must be positive".into());
        }
        if self.pool.min_timeout_secs > self.pool.max_timeout_secs {
            return invalid(format!(
                "pool.min_timeout_secs ({}) exceeds pool.max_timeout_secs ({})",
                self.pool.min_timeout_secs, self.pool.max_timeout_secs
            ));
        }
        if !(self.pool.duration_factor >= 0.0) {
            return invalid("pool.duration_factor must be non-negative".into());
        }

        let t = &self.transcription;
        if t.allowed_extensions.is_empty() {
            return invalid("transcription.allowed_extensions is empty".into());
        }
        if let Some(ext) = t.allowed_extensions.iter().find(|e| !e.starts_with('.')) {
            return invalid(format!("extension {} must start with '.'", ext));
        }
        if t.default_chunk_size == 0 || t.default_chunk_size > t.max_chunk_size {
            return invalid("transcription.default_chunk_size must be in 1..=max_chunk_size".into());
        }
        if !(t.speed_ratio > 0.0) {
            return invalid("transcription.speed_ratio must be positive".into());
        }
        if t.max_queue_size == 0 {
            return invalid("transcription.max_queue_size must be at least 1".into());
        }

        match self.engine.kind {
            EngineKind::Command if self.engine.program.is_none() => {
                return invalid("engine.program is required for the command engine".into());
            }
            EngineKind::Whisper => {
                if !cfg!(feature = "whisper") {
                    return invalid("whisper engine requires the `whisper` feature".into());
                }
                if self.engine.model_path.is_none() {
                    return invalid("engine.model_path is required for the whisper engine".into());
                }
            }
            _ => {}
        }
        if self.engine.gpu_count == 0 {
            return invalid("engine.gpu_count must be at least 1".into());
        }

        Ok(())
    }
}
