use std::path::Path;
use std::process::Command;

use hound::WavReader;
use tracing::{debug, warn};

use crate::error::{ErrorKind, TaskError};

#[cfg(feature = "whisper")]
pub mod pcm;

/// Bytes per second assumed when no decoder can read the container (128 kbit/s).
const FALLBACK_BYTES_PER_SECOND: f64 = 16_000.0;

/// 探测音频时长（秒）
///
/// 依次尝试 WAV 头、ffprobe，最后按文件大小估算。
///
/// # 参数
/// * `path` - 音频文件路径
///
/// # 返回值
/// * `f64` - 音频时长；文件不存在时返回 `FileNotFound`
pub fn probe_duration(path: &Path) -> Result<f64, TaskError> {
    let metadata = std::fs::metadata(path).map_err(TaskError::from)?;
    if !metadata.is_file() {
        return Err(TaskError::new(
            ErrorKind::FileNotFound,
            format!("{} is not a file", path.display()),
        ));
    }

    if has_extension(path, "wav") {
        match wav_duration(path) {
            Some(seconds) => return Ok(seconds),
            None => debug!("{} has no readable WAV header", path.display()),
        }
    }

    if let Some(seconds) = ffprobe_duration(path) {
        return Ok(seconds);
    }

    let estimate = metadata.len() as f64 / FALLBACK_BYTES_PER_SECOND;
    warn!("Estimating duration of {} from its size: {:.1}s", path.display(), estimate);
    Ok(estimate)
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn wav_duration(path: &Path) -> Option<f64> {
    let reader = WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    // duration() counts frames, independent of channel count
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

fn ffprobe_duration(path: &Path) -> Option<f64> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}
