use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::{EngineError, InferenceEngine, RawSegment, RawTranscript, TranscribeParams};
use crate::audio;
use crate::config::MockEngineConfig;
use crate::error::ErrorKind;

/// Exit code used when a configured crash fires.
pub const CRASH_EXIT_CODE: i32 = 101;

/// Deterministic engine used by tests and local runs.
///
/// Emits one segment every `segment_ms` of audio, alternating between two speakers.
/// File stems containing `invalid` fail as invalid audio, stems containing `engine_fault`
/// fail as an engine fault. A `.wav` without a readable header is invalid audio.
pub struct MockEngine {
    config: MockEngineConfig,
}

impl MockEngine {
    pub fn new(config: MockEngineConfig) -> Self {
        Self { config }
    }

    fn record_invocation(&self, audio: &Path) {
        let Some(log) = &self.config.invocation_log else {
            return;
        };
        let line = format!("{} {}\n", std::process::id(), audio.display());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!("Failed to append invocation log {}: {}", log.display(), e);
        }
    }

    fn crash_if_armed(&self) {
        if self.config.crash_always {
            warn!("Configured to crash, exiting");
            std::process::exit(CRASH_EXIT_CODE);
        }
        if let Some(marker) = &self.config.crash_marker {
            if marker.exists() && std::fs::remove_file(marker).is_ok() {
                warn!("Crash marker {} found, exiting", marker.display());
                std::process::exit(CRASH_EXIT_CODE);
            }
        }
    }
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn transcribe(&self, audio_path: &Path, params: &TranscribeParams) -> Result<RawTranscript, EngineError> {
        self.record_invocation(audio_path);

        if !audio_path.exists() {
            return Err(EngineError::new(
                ErrorKind::FileNotFound,
                format!("{} does not exist", audio_path.display()),
            ));
        }
        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if stem.contains("invalid") {
            return Err(EngineError::new(ErrorKind::InvalidAudio, "audio stream could not be decoded"));
        }
        if stem.contains("engine_fault") {
            return Err(EngineError::fault("simulated engine fault"));
        }
        let is_wav = audio_path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);
        if is_wav && hound::WavReader::open(audio_path).is_err() {
            return Err(EngineError::new(ErrorKind::InvalidAudio, "not a readable WAV stream"));
        }

        if self.config.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.delay_ms));
        }
        self.crash_if_armed();

        let duration = audio::probe_duration(audio_path).map_err(|e| EngineError::new(e.error_type, e.message))?;
        let total_ms = (duration * 1000.0).round() as u64;
        if total_ms == 0 {
            return Err(EngineError::new(ErrorKind::AudioTooShort, "audio has no samples"));
        }

        let step = self.config.segment_ms.max(1);
        let mut segments = Vec::new();
        let mut start = 0;
        while start < total_ms {
            let end = (start + step).min(total_ms);
            let index = segments.len();
            let text = match (&params.hotword, index) {
                (Some(hotword), 0) => format!("{} segment {}", hotword, index + 1),
                _ => format!("segment {}", index + 1),
            };
            segments.push(RawSegment {
                start_ms: start,
                end_ms: end,
                text,
                speaker: index % 2,
            });
            start = end;
        }

        let full_text = segments.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join(" ");
        info!("Mock engine produced {} segments for {}", segments.len(), audio_path.display());
        Ok(RawTranscript { segments, full_text })
    }
}
