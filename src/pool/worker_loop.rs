//! Body of a worker process: load the engine once, then serve requests for one slot
//! until asked to stop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::ipc::{self, TaskRequest, TaskResult};
use crate::asr::device::{DeviceStrategy, PreferenceStrategy};
use crate::asr::{build_engine, InferenceEngine, TranscribeParams};
use crate::config::Config;
use crate::error::ErrorKind;

pub fn run_worker(slot: usize, task_dir: &Path, config: &Config) -> Result<()> {
    let strategy = PreferenceStrategy::new(
        config.engine.device,
        slot,
        config.engine.gpu_count,
        config.engine.threads,
    );
    let device = strategy.select();
    strategy.prepare(&device)?;
    let engine = build_engine(&config.engine, &device).context("loading inference engine")?;

    let pid = std::process::id();
    ipc::write_atomic(&ipc::ready_file(task_dir, slot), pid.to_string().as_bytes())
        .context("writing ready sentinel")?;
    info!("Worker {} (pid {}) ready with {} engine", slot, pid, engine.name());

    let stop = ipc::stop_file(task_dir, slot);
    let poll = config.pool.poll_interval();
    loop {
        if stop.exists() {
            let _ = std::fs::remove_file(&stop);
            info!("Worker {} stopping", slot);
            return Ok(());
        }

        for (request_path, id) in pending_requests(task_dir, slot)? {
            serve(engine.as_ref(), task_dir, slot, &request_path, &id, config.pool.json_result_limit_bytes);
        }
        thread::sleep(poll);
    }
}

fn pending_requests(task_dir: &Path, slot: usize) -> Result<Vec<(PathBuf, String)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(task_dir).with_context(|| format!("listing {}", task_dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = ipc::parse_request_name(&name, slot) {
            found.push((entry.path(), id.to_string()));
        }
    }
    found.sort();
    Ok(found)
}

fn serve(engine: &dyn InferenceEngine, task_dir: &Path, slot: usize, request_path: &Path, id: &str, json_limit: usize) {
    let pid = std::process::id();
    let request = std::fs::read(request_path)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| ipc::decode_request(&bytes));

    let (result, force_binary) = match request {
        Ok(request) => {
            let binary = request.use_binary;
            (transcribe(engine, &request, pid), binary)
        }
        Err(e) => {
            warn!("Worker {} cannot read request {}: {}", slot, request_path.display(), e);
            (failure(id, pid, ErrorKind::InvalidMessage, e.to_string(), None), false)
        }
    };

    match ipc::write_result(task_dir, slot, id, &result, force_binary, json_limit) {
        Ok(path) => info!("Worker {} wrote {}", slot, path.display()),
        Err(e) => error!("Worker {} failed to write result for {}: {}", slot, id, e),
    }
    if let Err(e) = std::fs::remove_file(request_path) {
        warn!("Worker {} failed to remove {}: {}", slot, request_path.display(), e);
    }
}

fn transcribe(engine: &dyn InferenceEngine, request: &TaskRequest, pid: u32) -> TaskResult {
    let params = TranscribeParams {
        batch_size_seconds: request.batch_size_s,
        hotword: request.hotword.clone(),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| engine.transcribe(&request.audio_path, &params)));
    match outcome {
        Ok(Ok(raw)) => TaskResult {
            task_id: request.task_id.clone(),
            success: true,
            result: Some(raw),
            error: None,
            error_type: None,
            traceback: None,
            worker_pid: pid,
        },
        Ok(Err(e)) => failure(&request.task_id, pid, e.kind, e.message, None),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "engine panicked".to_string());
            let trace = std::backtrace::Backtrace::force_capture().to_string();
            failure(&request.task_id, pid, ErrorKind::EngineFault, message, Some(trace))
        }
    }
}

fn failure(id: &str, pid: u32, kind: ErrorKind, message: String, traceback: Option<String>) -> TaskResult {
    TaskResult {
        task_id: id.to_string(),
        success: false,
        result: None,
        error: Some(message),
        error_type: Some(kind),
        traceback,
        worker_pid: pid,
    }
}
