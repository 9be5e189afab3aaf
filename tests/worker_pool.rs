//! Drives the real worker binary, running the mock engine, through the file pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use asr_orchestrator::asr::TranscribeParams;
use asr_orchestrator::config::{Config, EngineKind};
use asr_orchestrator::error::ErrorKind;
use asr_orchestrator::pool::{FileBasedPool, PoolError, WorkerCommand};
use asr_orchestrator::schedule::{Job, TaskProcessor};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Fixture {
    dir: TempDir,
    pool: Arc<FileBasedPool>,
}

impl Fixture {
    async fn start(tune: impl FnOnce(&mut Config, &Path)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.pool.size = 1;
        config.pool.task_dir = dir.path().join("tasks");
        config.pool.poll_interval_ms = 20;
        config.pool.ready_timeout_secs = 30;
        config.pool.shutdown_grace_secs = 2;
        config.engine.kind = EngineKind::Mock;
        config.engine.mock.segment_ms = 1000;
        config.engine.mock.invocation_log = Some(dir.path().join("invocations.log"));
        config.logging.level = "warn".into();
        tune(&mut config, dir.path());

        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let command = WorkerCommand::new(
            PathBuf::from(env!("CARGO_BIN_EXE_asr-orchestrator")),
            Some(config_path),
        );
        let pool = Arc::new(FileBasedPool::new(config.pool.clone(), command));
        pool.initialize().await.unwrap();
        Self { dir, pool }
    }

    fn wav(&self, name: &str, seconds: u32) -> PathBuf {
        let path = self.dir.path().join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..(16000 * seconds) {
            writer.write_sample(((i * 7) % 2000) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn job(task_id: &str, audio: &Path, seconds: f64) -> Job {
    Job {
        task_id: task_id.to_string(),
        attempt: 0,
        audio_path: audio.to_path_buf(),
        duration_seconds: seconds,
        expected_seconds: seconds,
        params: TranscribeParams::default(),
    }
}

#[tokio::test]
async fn test_worker_transcribes_and_is_recycled() {
    let fixture = Fixture::start(|_, _| {}).await;
    let audio = fixture.wav("meeting.wav", 3);
    let before = fixture.pool.worker_pids().await;
    assert!(before[0].is_some());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let output = fixture.pool.process(&job("task-a", &audio, 3.0), tx).await.unwrap();

    assert_eq!(output.slot, 0);
    assert_eq!(output.raw.segments.len(), 3);
    assert_eq!(output.worker_pid, before[0]);
    assert_eq!(rx.recv().await, Some(10));

    let after = fixture.pool.worker_pids().await;
    assert!(after[0].is_some());
    assert_ne!(after[0], before[0], "a fresh process replaces the one that served the task");
    assert!(audio.exists(), "the caller's file is never consumed by the pool");

    fixture.pool.shutdown().await;
    let leftovers: Vec<_> = std::fs::read_dir(fixture.pool.task_dir()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_crashed_worker_gets_one_resubmission() {
    let fixture = Fixture::start(|config, dir| {
        let marker = dir.join("crash.marker");
        std::fs::write(&marker, b"").unwrap();
        config.engine.mock.crash_marker = Some(marker);
    })
    .await;
    let audio = fixture.wav("call.wav", 2);

    let (tx, _rx) = mpsc::unbounded_channel();
    let output = fixture.pool.process(&job("task-crash", &audio, 2.0), tx).await.unwrap();
    assert_eq!(output.raw.segments.len(), 2);

    let calls = fixture.invocations();
    assert_eq!(calls.len(), 2);
    let pids: Vec<&str> = calls.iter().map(|l| l.split_whitespace().next().unwrap()).collect();
    assert_ne!(pids[0], pids[1]);

    fixture.pool.shutdown().await;
}

#[tokio::test]
async fn test_worker_crashing_every_attempt_fails_after_one_resubmission() {
    let fixture = Fixture::start(|config, _| {
        config.engine.mock.crash_always = true;
    })
    .await;
    let audio = fixture.wav("doomed.wav", 2);

    let (tx, _rx) = mpsc::unbounded_channel();
    let failure = fixture.pool.process(&job("task-doomed", &audio, 2.0), tx).await.unwrap_err();
    assert_eq!(failure.slot, Some(0));
    assert!(matches!(failure.error, PoolError::WorkerCrashed { slot: 0, .. }));
    assert_eq!(failure.error.kind(), ErrorKind::WorkerCrashed);

    let calls = fixture.invocations();
    assert_eq!(calls.len(), 2);
    let crashed: Vec<String> = calls
        .iter()
        .map(|l| l.split_whitespace().next().unwrap().to_string())
        .collect();
    assert_ne!(crashed[0], crashed[1]);

    let replacement = fixture.pool.worker_pids().await[0].expect("slot left without a worker");
    assert!(!crashed.contains(&replacement.to_string()));

    fixture.pool.shutdown().await;
}

#[tokio::test]
async fn test_health_check_respawns_killed_idle_worker() {
    let fixture = Fixture::start(|config, _| {
        config.pool.health_check_interval_secs = 1;
    })
    .await;
    let victim = fixture.pool.worker_pids().await[0].unwrap();

    let killed = std::process::Command::new("kill")
        .args(["-9", &victim.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let mut respawned = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        match fixture.pool.worker_pids().await[0] {
            Some(pid) if pid != victim => {
                respawned = Some(pid);
                break;
            }
            _ => {}
        }
    }
    assert!(respawned.is_some(), "worker {} was never replaced", victim);

    // the replacement takes work without any task having noticed the loss
    let audio = fixture.wav("after.wav", 1);
    let (tx, _rx) = mpsc::unbounded_channel();
    let output = fixture.pool.process(&job("task-after", &audio, 1.0), tx).await.unwrap();
    assert_eq!(output.worker_pid, respawned);

    fixture.pool.shutdown().await;
}

#[tokio::test]
async fn test_slow_worker_times_out() {
    let fixture = Fixture::start(|config, _| {
        config.pool.base_timeout_secs = 1;
        config.pool.duration_factor = 0.0;
        config.pool.min_timeout_secs = 1;
        config.pool.max_timeout_secs = 1;
        config.engine.mock.delay_ms = 5000;
    })
    .await;
    let audio = fixture.wav("slow.wav", 1);

    let (tx, _rx) = mpsc::unbounded_channel();
    let failure = fixture.pool.process(&job("task-slow", &audio, 1.0), tx).await.unwrap_err();
    assert_eq!(failure.slot, Some(0));
    assert!(matches!(failure.error, PoolError::Timeout { seconds: 1, .. }));
    assert_eq!(failure.error.kind(), ErrorKind::Timeout);

    // replaced before the slot was released; a later recycle has nothing to do
    let stuck: Vec<String> = fixture.invocations();
    let stuck_pid = stuck[0].split_whitespace().next().unwrap().to_string();
    let replacement = fixture.pool.worker_pids().await[0].expect("slot left without a worker");
    assert_ne!(replacement.to_string(), stuck_pid);
    fixture.pool.recycle(0).await;
    assert_eq!(fixture.pool.worker_pids().await[0], Some(replacement));

    fixture.pool.shutdown().await;
}

#[tokio::test]
async fn test_engine_errors_keep_their_kind() {
    let fixture = Fixture::start(|_, _| {}).await;
    let garbage = fixture.dir.path().join("noise.wav");
    std::fs::write(&garbage, b"definitely not RIFF").unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let failure = fixture.pool.process(&job("task-bad", &garbage, 1.0), tx).await.unwrap_err();
    assert_eq!(failure.error.kind(), ErrorKind::InvalidAudio);
    assert_eq!(fixture.invocations().len(), 1);

    fixture.pool.shutdown().await;
}
