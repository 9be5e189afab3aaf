//! Filesystem envelopes exchanged between the pool and its worker processes.
//!
//! Layout inside the task directory:
//! - `worker_{slot}_{id}.task`   request, written by the pool
//! - `worker_{slot}_{id}.result` JSON result, written by the worker
//! - `worker_{slot}_{id}.pkl`    gzip-compressed JSON result for large payloads
//! - `worker_{slot}.ready`       sentinel holding the worker pid
//! - `worker_{slot}.stop`        sentinel asking the worker to exit
//!
//! Every file is written to `<name>.tmp` first and renamed into place.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::asr::RawTranscript;
use crate::error::ErrorKind;

pub const REQUEST_EXT: &str = "task";
pub const RESULT_EXT: &str = "result";
pub const BINARY_RESULT_EXT: &str = "pkl";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub audio_path: PathBuf,
    pub batch_size_s: u32,
    pub hotword: Option<String>,
    pub use_binary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RawTranscript>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    pub worker_pid: u32,
}

fn slot_file(dir: &Path, slot: usize, id: &str, ext: &str) -> PathBuf {
    dir.join(format!("worker_{}_{}.{}", slot, id, ext))
}

pub fn request_file(dir: &Path, slot: usize, id: &str) -> PathBuf {
    slot_file(dir, slot, id, REQUEST_EXT)
}

pub fn result_file(dir: &Path, slot: usize, id: &str) -> PathBuf {
    slot_file(dir, slot, id, RESULT_EXT)
}

pub fn binary_result_file(dir: &Path, slot: usize, id: &str) -> PathBuf {
    slot_file(dir, slot, id, BINARY_RESULT_EXT)
}

pub fn ready_file(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("worker_{}.ready", slot))
}

pub fn stop_file(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("worker_{}.stop", slot))
}

/// Staged copy of the audio for one request.
pub fn staged_audio_file(dir: &Path, slot: usize, id: &str, ext: Option<&str>) -> PathBuf {
    match ext {
        Some(ext) => dir.join(format!("audio_{}_{}.{}", slot, id, ext)),
        None => dir.join(format!("audio_{}_{}", slot, id)),
    }
}

/// Extracts the request id from `worker_{slot}_{id}.task`, ignoring other slots.
pub fn parse_request_name(name: &str, slot: usize) -> Option<&str> {
    let prefix = format!("worker_{}_", slot);
    let id = name.strip_prefix(&prefix)?.strip_suffix(&format!(".{}", REQUEST_EXT))?;
    (!id.is_empty()).then_some(id)
}

/// True for every file a slot's worker or the pool may leave behind for that slot.
pub fn belongs_to_slot(name: &str, slot: usize) -> bool {
    name.starts_with(&format!("worker_{}_", slot)) || name.starts_with(&format!("worker_{}.", slot))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

pub async fn write_atomic_async(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await
}

pub fn encode_request(request: &TaskRequest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<TaskRequest> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serializes a result, switching to the compressed form when asked to or when the JSON
/// form exceeds `json_limit`. Returns the bytes and whether they are compressed.
pub fn encode_result(result: &TaskResult, force_binary: bool, json_limit: usize) -> Result<(Vec<u8>, bool)> {
    let json = serde_json::to_vec(result)?;
    if !force_binary && json.len() <= json_limit {
        return Ok((json, false));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok((encoder.finish()?, true))
}

pub fn decode_result(bytes: &[u8], binary: bool) -> Result<TaskResult> {
    if !binary {
        return Ok(serde_json::from_slice(bytes)?);
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Writes the result next to the request and returns its path.
pub fn write_result(
    dir: &Path,
    slot: usize,
    id: &str,
    result: &TaskResult,
    force_binary: bool,
    json_limit: usize,
) -> Result<PathBuf> {
    let (bytes, binary) = encode_result(result, force_binary, json_limit)?;
    let path = if binary {
        binary_result_file(dir, slot, id)
    } else {
        result_file(dir, slot, id)
    };
    write_atomic(&path, &bytes)?;
    Ok(path)
}

/// Finds a finished result for the request, preferring the JSON form.
pub fn find_result(dir: &Path, slot: usize, id: &str) -> Option<(PathBuf, bool)> {
    let json = result_file(dir, slot, id);
    if json.exists() {
        return Some((json, false));
    }
    let binary = binary_result_file(dir, slot, id);
    binary.exists().then_some((binary, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::RawSegment;

    fn result_with_segments(n: usize) -> TaskResult {
        TaskResult {
            task_id: "task-1_0".into(),
            success: true,
            result: Some(RawTranscript {
                segments: (0..n)
                    .map(|i| RawSegment {
                        start_ms: i as u64 * 1000,
                        end_ms: i as u64 * 1000 + 900,
                        text: format!("words {}", i),
                        speaker: i % 3,
                    })
                    .collect(),
                full_text: String::new(),
            }),
            error: None,
            error_type: None,
            traceback: None,
            worker_pid: 42,
        }
    }

    #[test]
    fn test_names_follow_slot_layout() {
        let dir = Path::new("/tmp/tasks");
        assert_eq!(request_file(dir, 2, "task-a_0"), dir.join("worker_2_task-a_0.task"));
        assert_eq!(ready_file(dir, 2), dir.join("worker_2.ready"));
        assert_eq!(parse_request_name("worker_2_task-a_0.task", 2), Some("task-a_0"));
        assert_eq!(parse_request_name("worker_12_task-a_0.task", 2), None);
        assert_eq!(parse_request_name("worker_2_task-a_0.task.tmp", 2), None);
        assert!(belongs_to_slot("worker_2.stop", 2));
        assert!(!belongs_to_slot("worker_21.stop", 2));
    }

    #[test]
    fn test_large_results_are_compressed() {
        let small = result_with_segments(2);
        let (bytes, binary) = encode_result(&small, false, 1 << 20).unwrap();
        assert!(!binary);
        assert_eq!(decode_result(&bytes, false).unwrap(), small);

        let large = result_with_segments(500);
        let (bytes, binary) = encode_result(&large, false, 1024).unwrap();
        assert!(binary);
        assert_eq!(decode_result(&bytes, true).unwrap(), large);
    }

    #[test]
    fn test_write_result_leaves_no_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_result(dir.path(), 0, "t_0", &result_with_segments(1), true, 1 << 20).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some(BINARY_RESULT_EXT));
        assert_eq!(find_result(dir.path(), 0, "t_0"), Some((path, true)));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_async_write_replaces_stale_tmp_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_file(dir.path(), 1, "t_0");
        std::fs::write(tmp_path(&path), vec![b'x'; 4096]).unwrap();
        std::fs::write(&path, b"old request").unwrap();

        write_atomic_async(&path, b"{}".to_vec()).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        assert!(!tmp_path(&path).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
