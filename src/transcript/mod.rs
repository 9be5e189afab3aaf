use std::fmt::{Display, Write};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asr::RawTranscript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Srt,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Srt => "srt",
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "srt" => Ok(Self::Srt),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub speaker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub task_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub duration: f64,
    pub segments: Vec<Segment>,
    pub speakers: Vec<String>,
    pub full_text: String,
    pub created_at: DateTime<Utc>,
    pub processing_time: f64,
}

/// A finished result in the format the client asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "content", rename_all = "lowercase")]
pub enum TranscriptOutput {
    Json(Transcript),
    Srt(String),
}

impl TranscriptOutput {
    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Json(_) => OutputFormat::Json,
            Self::Srt(_) => OutputFormat::Srt,
        }
    }

    /// Rebinds a result produced for another task (cache hit or shared run) to `task_id`.
    pub fn for_task(mut self, task_id: &str, file_name: &str) -> Self {
        if let Self::Json(transcript) = &mut self {
            transcript.task_id = task_id.to_string();
            transcript.file_name = file_name.to_string();
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptMeta {
    pub task_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub duration: f64,
    pub processing_time: f64,
}

pub fn speaker_label(index: usize) -> String {
    format!("Speaker{}", index + 1)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Shapes raw engine output: seconds-based timestamps, speaker labels, and merging of
/// consecutive same-speaker segments separated by less than `merge_gap` seconds.
pub fn build_transcript(raw: &RawTranscript, meta: TranscriptMeta, merge_gap: f64) -> Transcript {
    let segments: Vec<Segment> = raw
        .segments
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| Segment {
            start_time: round2(s.start_ms as f64 / 1000.0),
            end_time: round2(s.end_ms as f64 / 1000.0),
            text: s.text.trim().to_string(),
            speaker: speaker_label(s.speaker),
        })
        .collect();
    let segments = merge_segments(segments, merge_gap);

    let mut speakers: Vec<String> = Vec::new();
    for segment in &segments {
        if !speakers.contains(&segment.speaker) {
            speakers.push(segment.speaker.clone());
        }
    }

    Transcript {
        task_id: meta.task_id,
        file_name: meta.file_name,
        file_hash: meta.file_hash,
        duration: round2(meta.duration),
        segments,
        speakers,
        full_text: raw.full_text.clone(),
        created_at: Utc::now(),
        processing_time: round2(meta.processing_time),
    }
}

pub fn merge_segments(segments: Vec<Segment>, merge_gap: f64) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match merged.last_mut() {
            Some(prev) if prev.speaker == segment.speaker && segment.start_time - prev.end_time < merge_gap => {
                prev.end_time = prev.end_time.max(segment.end_time);
                prev.text.push(' ');
                prev.text.push_str(&segment.text);
            }
            _ => merged.push(segment),
        }
    }
    merged
}

fn srt_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = ms % 3_600_000 / 60_000;
    let seconds = ms % 60_000 / 1000;
    let millis = ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

/// SubRip rendering of the unmerged engine segments.
pub fn render_srt(raw: &RawTranscript) -> String {
    let mut out = String::new();
    for (i, segment) in raw.segments.iter().filter(|s| !s.text.trim().is_empty()).enumerate() {
        let _ = writeln!(out, "{}", i + 1);
        let _ = writeln!(out, "{} --> {}", srt_timestamp(segment.start_ms), srt_timestamp(segment.end_ms));
        let _ = writeln!(out, "{}:{}", speaker_label(segment.speaker), segment.text.trim());
        out.push('\n');
    }
    out
}

pub fn render(format: OutputFormat, raw: &RawTranscript, meta: TranscriptMeta, merge_gap: f64) -> TranscriptOutput {
    match format {
        OutputFormat::Json => TranscriptOutput::Json(build_transcript(raw, meta, merge_gap)),
        OutputFormat::Srt => TranscriptOutput::Srt(render_srt(raw)),
    }
}
