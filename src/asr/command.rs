use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::info;

use super::device::DeviceHandle;
use super::{EngineError, InferenceEngine, RawTranscript, TranscribeParams};
use crate::error::ErrorKind;

/// Exit code an external engine uses to report undecodable input.
const EXIT_INVALID_AUDIO: i32 = 3;
/// Exit code an external engine uses to report input shorter than it can handle.
const EXIT_AUDIO_TOO_SHORT: i32 = 4;

/// Runs an external recognizer once per file.
///
/// The program receives `args... <audio_path>` plus the parameters in `ASR_*` environment
/// variables and prints a `RawTranscript` as JSON on stdout.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    device: DeviceHandle,
}

impl CommandEngine {
    pub fn new(program: PathBuf, args: Vec<String>, device: DeviceHandle) -> Self {
        Self { program, args, device }
    }
}

impl InferenceEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn transcribe(&self, audio: &Path, params: &TranscribeParams) -> Result<RawTranscript, EngineError> {
        if !audio.exists() {
            return Err(EngineError::new(
                ErrorKind::FileNotFound,
                format!("{} does not exist", audio.display()),
            ));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(audio)
            .env("ASR_BATCH_SIZE_S", params.batch_size_seconds.to_string())
            .env("ASR_DEVICE", format!("{:?}", self.device.kind).to_lowercase())
            .env("ASR_DEVICE_ORDINAL", self.device.ordinal.to_string())
            .stdin(Stdio::null());
        if let Some(hotword) = &params.hotword {
            command.env("ASR_HOTWORD", hotword);
        }

        info!("Running {} on {}", self.program.display(), audio.display());
        let output = command
            .output()
            .map_err(|e| EngineError::fault(format!("failed to run {}: {}", self.program.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            let kind = match output.status.code() {
                Some(EXIT_INVALID_AUDIO) => ErrorKind::InvalidAudio,
                Some(EXIT_AUDIO_TOO_SHORT) => ErrorKind::AudioTooShort,
                _ => ErrorKind::EngineFault,
            };
            return Err(EngineError::new(kind, format!("engine exited with {}: {}", output.status, tail)));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::fault(format!("engine printed malformed output: {}", e)))
    }
}
