use std::path::Path;

use anyhow::Result;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::device::DeviceHandle;
use super::{EngineError, InferenceEngine, RawSegment, RawTranscript, TranscribeParams};
use crate::audio::pcm::load_pcm;
use crate::error::ErrorKind;

pub struct WhisperEngine {
    ctx: WhisperContext,
    threads: i32,
    language: String,
}

impl WhisperEngine {
    pub fn new(model_path: &Path, device: &DeviceHandle, language: Option<String>) -> Result<Self> {
        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = device.is_gpu();

        let model = model_path.to_string_lossy();
        let ctx = WhisperContext::new_with_params(&model, ctx_params)
            .map_err(|e| anyhow::anyhow!("failed to open whisper model {}: {}", model, e))?;

        Ok(Self {
            ctx,
            threads: device.threads as i32,
            language: language.unwrap_or_else(|| "zh".to_string()),
        })
    }

    fn build_params<'a>(&self, language: &'a str, prompt: Option<&'a str>) -> FullParams<'a, 'a> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        // 说话人切换检测
        params.set_tdrz_enable(true);
        params.set_language(Some(language));
        params.set_n_threads(self.threads);
        params.set_temperature(0.3);
        params.set_translate(false);
        params.set_no_context(false);
        params.set_single_segment(false);
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        if let Some(prompt) = prompt {
            params.set_initial_prompt(prompt);
        }
        params
    }
}

impl InferenceEngine for WhisperEngine {
    fn name(&self) -> &str {
        "whisper"
    }

    fn transcribe(&self, audio: &Path, params: &TranscribeParams) -> Result<RawTranscript, EngineError> {
        if !audio.exists() {
            return Err(EngineError::new(ErrorKind::FileNotFound, audio.display().to_string()));
        }
        let samples = load_pcm(audio).map_err(|e| EngineError::new(ErrorKind::InvalidAudio, e.to_string()))?;
        if samples.is_empty() {
            return Err(EngineError::new(ErrorKind::AudioTooShort, "audio has no samples"));
        }

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| EngineError::fault(e.to_string()))?;
        let full_params = self.build_params(&self.language, params.hotword.as_deref());
        state
            .full(full_params, &samples)
            .map_err(|e| EngineError::fault(e.to_string()))?;

        let count = state.full_n_segments().map_err(|e| EngineError::fault(e.to_string()))?;
        let mut segments = Vec::with_capacity(count.max(0) as usize);
        let mut full_text = String::new();
        let mut speaker = 0;

        for i in 0..count {
            let text = state.full_get_segment_text(i).map_err(|e| EngineError::fault(e.to_string()))?;
            let t0 = state.full_get_segment_t0(i).map_err(|e| EngineError::fault(e.to_string()))?;
            let t1 = state.full_get_segment_t1(i).map_err(|e| EngineError::fault(e.to_string()))?;
            if i > 0 && state.full_get_segment_speaker_turn_next(i - 1) {
                speaker = (speaker + 1) % 2;
            }

            // whisper timestamps are in centiseconds
            segments.push(RawSegment {
                start_ms: t0.max(0) as u64 * 10,
                end_ms: t1.max(0) as u64 * 10,
                text: text.trim().to_string(),
                speaker,
            });
            full_text.push_str(&text);
        }

        Ok(RawTranscript {
            segments,
            full_text: full_text.trim().to_string(),
        })
    }
}
