use std::path::Path;

use crate::config::TranscriptionConfig;
use crate::error::{ErrorKind, TaskError};
use crate::schedule::types::SubmitRequest;
use crate::utils::hash::is_sha256_hex;

pub fn validate_extension(file_name: &str, allowed: &[String]) -> Result<(), TaskError> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()));
    match ext {
        Some(ext) if allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) => Ok(()),
        _ => Err(TaskError::new(
            ErrorKind::UnsupportedFormat,
            format!("{} is not one of {}", file_name, allowed.join(", ")),
        )),
    }
}

pub fn validate_size(file_size: u64, max_bytes: u64) -> Result<(), TaskError> {
    if file_size == 0 {
        return Err(TaskError::new(ErrorKind::InvalidAudio, "file is empty"));
    }
    if file_size > max_bytes {
        return Err(TaskError::new(
            ErrorKind::FileTooLarge,
            format!("{} bytes exceeds the {} byte limit", file_size, max_bytes),
        ));
    }
    Ok(())
}

pub fn validate_hash(hash: &str) -> Result<(), TaskError> {
    if is_sha256_hex(hash) {
        Ok(())
    } else {
        Err(TaskError::new(
            ErrorKind::InvalidMessage,
            "file_hash must be a hex-encoded SHA-256 digest",
        ))
    }
}

/// Checks an upload request before any task is created.
pub fn validate_submit(request: &SubmitRequest, config: &TranscriptionConfig) -> Result<(), TaskError> {
    if request.file_name.trim().is_empty() {
        return Err(TaskError::new(ErrorKind::InvalidMessage, "file_name is empty"));
    }
    validate_extension(&request.file_name, &config.allowed_extensions)?;
    validate_size(request.file_size, config.max_file_size_bytes())?;
    validate_hash(&request.content_hash)
}

/// Chunk size for a new session: the client's request if it fits, the configured default otherwise.
pub fn negotiate_chunk_size(requested: Option<u64>, config: &TranscriptionConfig) -> u64 {
    match requested {
        Some(size) if size > 0 && size <= config.max_chunk_size => size,
        _ => config.default_chunk_size,
    }
}
