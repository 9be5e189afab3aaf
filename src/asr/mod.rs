use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EngineConfig, EngineKind};
use crate::error::ErrorKind;

pub mod command;
pub mod device;
pub mod mock;
#[cfg(feature = "whisper")]
pub mod whisper;

use device::DeviceHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeParams {
    pub batch_size_seconds: u32,
    pub hotword: Option<String>,
}

impl Default for TranscribeParams {
    fn default() -> Self {
        Self {
            batch_size_seconds: 300,
            hotword: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Zero-based speaker index assigned by diarization.
    pub speaker: usize,
}

/// Engine output before any merging or formatting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTranscript {
    pub segments: Vec<RawSegment>,
    pub full_text: String,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineFault, message)
    }
}

/// Speech recognizer loaded once per worker process.
///
/// Implementations are not reentrant; the pool never calls `transcribe`
/// concurrently within one process.
pub trait InferenceEngine: Send {
    fn name(&self) -> &str;
    fn transcribe(&self, audio: &Path, params: &TranscribeParams) -> Result<RawTranscript, EngineError>;
}

pub fn build_engine(config: &EngineConfig, device: &DeviceHandle) -> Result<Box<dyn InferenceEngine>> {
    match config.kind {
        EngineKind::Mock => Ok(Box::new(mock::MockEngine::new(config.mock.clone()))),
        EngineKind::Command => {
            let program = config
                .program
                .clone()
                .ok_or_else(|| anyhow::anyhow!("engine.program is not set"))?;
            Ok(Box::new(command::CommandEngine::new(program, config.args.clone(), *device)))
        }
        #[cfg(feature = "whisper")]
        EngineKind::Whisper => {
            let model = config
                .model_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("engine.model_path is not set"))?;
            Ok(Box::new(whisper::WhisperEngine::new(&model, device, config.language.clone())?))
        }
        #[cfg(not(feature = "whisper"))]
        EngineKind::Whisper => Err(anyhow::anyhow!("built without the `whisper` feature")),
    }
}
