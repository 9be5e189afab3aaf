use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use hound::{SampleFormat, WavReader};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use tracing::{error, info};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// 解码音频为 16kHz 单声道 f32 样本
///
/// 非 WAV 文件先经 ffmpeg 转码，转码产生的临时文件在返回前删除。
pub fn load_pcm(path: &Path) -> Result<Vec<f32>> {
    let wav_path = ensure_wav_format(path)?;
    let decoded = read_wav_file(&wav_path);

    if wav_path != path {
        if let Err(e) = fs::remove_file(&wav_path) {
            error!("Failed to remove temporary WAV file {}: {}", wav_path.display(), e);
        }
    }

    let (samples, channels, sample_rate) = decoded?;
    let mono = convert_to_mono(&samples, channels);
    let normalized = normalize_audio(&mono);

    if sample_rate == TARGET_SAMPLE_RATE {
        Ok(normalized)
    } else {
        resample_audio(&normalized, sample_rate)
    }
}

fn ensure_wav_format(path: &Path) -> Result<PathBuf> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        return Ok(path.to_path_buf());
    }

    let output_path = path.with_extension("decoded.wav");
    info!("Converting {} to WAV", path.display());
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-acodec", "pcm_s16le", "-ac", "1", "-ar", "16000"])
        .arg(&output_path)
        .status()
        .map_err(|e| anyhow::anyhow!("Failed to execute ffmpeg: {}", e))?;

    if !status.success() {
        return Err(anyhow::anyhow!("FFmpeg conversion failed with status: {}", status));
    }
    Ok(output_path)
}

fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path).map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(anyhow::anyhow!(
            "Unsupported sample format {:?}/{} bits, expected 16-bit integer",
            spec.sample_format,
            spec.bits_per_sample
        ));
    }

    let samples = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?;

    Ok((samples, spec.channels.max(1) as usize, spec.sample_rate))
}

fn convert_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let peak = samples.par_iter().map(|s| s.abs()).reduce(|| 0.0, f32::max);
    if peak <= f32::EPSILON {
        return samples.to_vec();
    }
    samples.par_iter().map(|s| s / peak).collect()
}

fn resample_audio(samples: &[f32], original_rate: u32) -> Result<Vec<f32>> {
    info!("Resampling from {} Hz to {} Hz", original_rate, TARGET_SAMPLE_RATE);
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        TARGET_SAMPLE_RATE as f64 / original_rate as f64,
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| anyhow::anyhow!("Failed to create resampler: {}", e))?;

    let mut resampled = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| anyhow::anyhow!("Resampling failed: {}", e))?;
    Ok(resampled.swap_remove(0))
}
