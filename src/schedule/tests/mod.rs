use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::sleep;

use super::*;
use crate::asr::{RawSegment, RawTranscript};
use crate::cache::{CacheEntry, CacheGateway, CacheStats, CacheStore, MemoryCacheStore};
use crate::config::{NotificationConfig, TranscriptionConfig};
use crate::error::{ErrorKind, TaskError};
use crate::pool::PoolError;
use crate::transcript::{OutputFormat, TranscriptOutput};
use crate::utils::hash::sha256_hex;

struct FakeProcessor {
    calls: AtomicUsize,
    script: StdMutex<VecDeque<Option<PoolError>>>,
    progress: Vec<u8>,
    gate: Option<Arc<Semaphore>>,
    recycled: StdMutex<Vec<usize>>,
}

impl FakeProcessor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: StdMutex::new(VecDeque::new()),
            progress: vec![10, 50],
            gate: None,
            recycled: StdMutex::new(Vec::new()),
        }
    }

    /// Failures returned by the first calls, in order; later calls succeed.
    fn failing_with(errors: Vec<PoolError>) -> Self {
        let processor = Self::new();
        *processor.script.lock().unwrap() = errors.into_iter().map(Some).collect();
        processor
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn raw() -> RawTranscript {
    RawTranscript {
        segments: vec![
            RawSegment {
                start_ms: 0,
                end_ms: 900,
                text: "hello".into(),
                speaker: 0,
            },
            RawSegment {
                start_ms: 1000,
                end_ms: 1900,
                text: "there".into(),
                speaker: 1,
            },
        ],
        full_text: "hello there".into(),
    }
}

#[async_trait]
impl TaskProcessor for FakeProcessor {
    async fn process(&self, job: &Job, progress: ProgressSender) -> Result<JobOutput, JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for p in &self.progress {
            let _ = progress.send(*p);
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        assert!(job.audio_path.exists(), "job file {} missing", job.audio_path.display());

        match self.script.lock().unwrap().pop_front().flatten() {
            Some(error) => Err(JobFailure::new(Some(0), error)),
            None => Ok(JobOutput {
                raw: raw(),
                slot: 0,
                worker_pid: Some(4242),
            }),
        }
    }

    async fn recycle(&self, slot: usize) {
        self.recycled.lock().unwrap().push(slot);
    }

    fn concurrency(&self) -> usize {
        1
    }

    async fn shutdown(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Progress(String, u8, TaskState),
    Complete(String, OutputFormat),
    Error(String, ErrorKind),
}

#[derive(Default)]
struct RecordingSink {
    events: StdMutex<Vec<Recorded>>,
}

impl RecordingSink {
    fn for_task(&self, task_id: &str) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| match e {
                Recorded::Progress(id, ..) | Recorded::Complete(id, _) | Recorded::Error(id, _) => id == task_id,
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn on_progress(&self, task_id: &str, percent: u8, status: TaskState, _: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Progress(task_id.into(), percent, status));
        Ok(())
    }

    async fn on_complete(&self, task_id: &str, result: &TranscriptOutput) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Complete(task_id.into(), result.format()));
        Ok(())
    }

    async fn on_error(&self, task_id: &str, error: &TaskError) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Error(task_id.into(), error.error_type));
        Ok(())
    }
}

struct Harness {
    manager: Arc<TaskManager>,
    processor: Arc<FakeProcessor>,
    sink: Arc<RecordingSink>,
    dir: tempfile::TempDir,
}

fn config(dir: &Path) -> TranscriptionConfig {
    TranscriptionConfig {
        upload_dir: dir.join("uploads"),
        temp_dir: dir.join("tmp"),
        retry_times: 2,
        retry_backoff_ms: 10,
        ..TranscriptionConfig::default()
    }
}

fn harness_with(processor: FakeProcessor, tweak: impl FnOnce(&mut TranscriptionConfig)) -> Harness {
    build(processor, tweak, CacheGateway::in_memory(3.0), None)
}

fn build(
    processor: FakeProcessor,
    tweak: impl FnOnce(&mut TranscriptionConfig),
    cache: CacheGateway,
    extra_sink: Option<Arc<dyn NotificationSink>>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);
    let processor = Arc::new(processor);
    let sink = Arc::new(RecordingSink::default());
    let notifications: Arc<dyn NotificationSink> = match extra_sink {
        Some(extra) => Arc::new(FanoutSink::new(vec![sink.clone(), extra])),
        None => sink.clone(),
    };
    let manager = Arc::new(TaskManager::new(config, Arc::new(cache), processor.clone(), notifications));
    Harness {
        manager,
        processor,
        sink,
        dir,
    }
}

fn harness(processor: FakeProcessor) -> Harness {
    harness_with(processor, |_| {})
}

impl Harness {
    /// Writes a short WAV whose content depends on `seed` and returns its path and hash.
    fn audio(&self, name: &str, seed: u16) -> (PathBuf, String) {
        let path = self.dir.path().join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..32000u32 {
            writer.write_sample(((i as u16).wrapping_mul(seed) % 2000) as i16).unwrap();
        }
        writer.finalize().unwrap();
        let hash = sha256_hex(&std::fs::read(&path).unwrap());
        (path, hash)
    }

    async fn submit(&self, name: &str, hash: &str, format: OutputFormat, force_refresh: bool) -> SubmitOutcome {
        self.manager
            .submit(SubmitRequest {
                file_name: name.into(),
                file_size: 64_044,
                content_hash: hash.into(),
                output_format: format,
                force_refresh,
            })
            .await
            .unwrap()
    }

    async fn accepted(&self, name: &str, hash: &str, format: OutputFormat, force_refresh: bool) -> String {
        match self.submit(name, hash, format, force_refresh).await {
            SubmitOutcome::Accepted(task) => task.id,
            SubmitOutcome::Cached(task) => panic!("{} unexpectedly cached", task.id),
        }
    }

    fn start_dispatcher(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            while let Some(job) = manager.next_job().await {
                manager.process_job(job).await;
            }
        });
    }

    async fn wait_for(&self, task_id: &str, state: TaskState) -> Task {
        for _ in 0..500 {
            if let Some(task) = self.manager.get_task(task_id).await {
                if task.state == state {
                    return task;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}: {:?}", task_id, state, self.manager.get_task(task_id).await);
    }
}

#[tokio::test]
async fn test_completed_result_is_served_from_cache_on_submit() {
    let h = harness(FakeProcessor::new());
    let (path, hash) = h.audio("a.wav", 3);
    let first = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&first, path).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&first, TaskState::Completed).await;

    match h.submit("again.wav", &hash, OutputFormat::Srt, false).await {
        SubmitOutcome::Cached(task) => {
            assert_eq!(task.state, TaskState::Completed);
            assert_eq!(task.progress, 100);
            assert!(matches!(task.result, Some(TranscriptOutput::Srt(ref srt)) if srt.contains("Speaker1:hello")));
        }
        SubmitOutcome::Accepted(task) => panic!("{} should have been a cache hit", task.id),
    }
    match h.submit("forced.wav", &hash, OutputFormat::Json, true).await {
        SubmitOutcome::Accepted(task) => assert_eq!(task.state, TaskState::Pending),
        SubmitOutcome::Cached(_) => panic!("force_refresh must bypass the cache"),
    }
    assert_eq!(h.processor.calls(), 1);
}

#[tokio::test]
async fn test_cache_is_checked_again_after_upload() {
    let h = harness(FakeProcessor::new());
    let (path, hash) = h.audio("a.wav", 5);
    let late = h.accepted("late.wav", &hash, OutputFormat::Json, false).await;
    let early = h.accepted("early.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&early, path.clone()).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&early, TaskState::Completed).await;
    assert!(path.exists(), "file deleted while {} was still pending", late);

    match h.manager.finalize_upload(&late, path.clone()).await.unwrap() {
        FinalizeOutcome::Cached(task) => match task.result {
            Some(TranscriptOutput::Json(t)) => {
                assert_eq!(t.task_id, late);
                assert_eq!(t.file_name, "late.wav");
            }
            other => panic!("unexpected result {:?}", other),
        },
        other => panic!("expected cache hit, got {:?}", other),
    }
    assert_eq!(h.processor.calls(), 1);
    assert!(!path.exists());
}

/// Memory store whose next lookup is answered from the moment it was asked but replies late.
struct LaggingStore {
    inner: MemoryCacheStore,
    lag_next: AtomicBool,
    stale_fallback: StdMutex<Option<Option<CacheEntry>>>,
    lag: Duration,
}

impl LaggingStore {
    fn new(lag: Duration) -> Self {
        Self {
            inner: MemoryCacheStore::new(),
            lag_next: AtomicBool::new(false),
            stale_fallback: StdMutex::new(None),
            lag,
        }
    }
}

#[async_trait]
impl CacheStore for LaggingStore {
    async fn get(&self, file_hash: &str, format: OutputFormat) -> Result<Option<CacheEntry>> {
        let answer = self.inner.get(file_hash, format).await;
        if self.lag_next.swap(false, Ordering::SeqCst) {
            let fallback = self.inner.find_any(file_hash).await?;
            *self.stale_fallback.lock().unwrap() = Some(fallback);
            sleep(self.lag).await;
        }
        answer
    }

    async fn find_any(&self, file_hash: &str) -> Result<Option<CacheEntry>> {
        if let Some(stale) = self.stale_fallback.lock().unwrap().take() {
            return Ok(stale);
        }
        self.inner.find_any(file_hash).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<()> {
        self.inner.put(entry).await
    }

    async fn touch(&self, file_hash: &str, format: OutputFormat, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch(file_hash, format, at).await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_before(cutoff).await
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn test_upload_racing_a_finishing_leader_uses_its_result() {
    let store = Arc::new(LaggingStore::new(Duration::from_millis(300)));
    let gate = Arc::new(Semaphore::new(0));
    let h = build(
        FakeProcessor::gated(gate.clone()),
        |_| {},
        CacheGateway::new(store.clone(), true, 3.0),
        None,
    );
    let (path, hash) = h.audio("a.wav", 13);
    let leader = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    let sibling = h.accepted("b.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&leader, path.clone()).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&leader, TaskState::Processing).await;

    // the sibling's lookup misses now and reports back only after the leader is done
    store.lag_next.store(true, Ordering::SeqCst);
    let manager = h.manager.clone();
    let late = {
        let sibling = sibling.clone();
        let path = path.clone();
        tokio::spawn(async move { manager.finalize_upload(&sibling, path).await })
    };
    sleep(Duration::from_millis(50)).await;
    gate.add_permits(1);
    h.wait_for(&leader, TaskState::Completed).await;

    match late.await.unwrap().unwrap() {
        FinalizeOutcome::Cached(task) => assert_eq!(task.id, sibling),
        other => panic!("expected the leader's result, got {:?}", other),
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.processor.calls(), 1);
    assert_eq!(h.manager.stats().await.queue_depth, 0);
}

#[tokio::test]
async fn test_unresponsive_webhook_does_not_delay_dispatch() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    let url = format!("http://{}/hook", addr);
    let notification = NotificationConfig {
        webhook_url: Some(url.clone()),
        retry_times: 3,
        timeout_secs: 30,
        backoff_base_ms: 1000,
    };
    let h = build(
        FakeProcessor::new(),
        |_| {},
        CacheGateway::in_memory(3.0),
        Some(Arc::new(WebhookSink::new(url, &notification))),
    );

    let (first_path, first_hash) = h.audio("a.wav", 17);
    let (second_path, second_hash) = h.audio("b.wav", 19);
    let first = h.accepted("a.wav", &first_hash, OutputFormat::Json, false).await;
    let second = h.accepted("b.wav", &second_hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&first, first_path).await.unwrap();
    h.manager.finalize_upload(&second, second_path).await.unwrap();
    h.start_dispatcher();

    tokio::time::timeout(Duration::from_secs(3), async {
        h.wait_for(&first, TaskState::Completed).await;
        h.wait_for(&second, TaskState::Completed).await;
    })
    .await
    .expect("dispatch waited on webhook delivery");
    assert_eq!(h.processor.calls(), 2);
}

#[tokio::test]
async fn test_identical_concurrent_submissions_run_inference_once() {
    let h = harness(FakeProcessor::new());
    let (path, hash) = h.audio("a.wav", 7);

    let (a, b) = tokio::join!(
        h.accepted("a.wav", &hash, OutputFormat::Json, false),
        h.accepted("b.wav", &hash, OutputFormat::Srt, false)
    );
    let (fa, fb) = tokio::join!(
        h.manager.finalize_upload(&a, path.clone()),
        h.manager.finalize_upload(&b, path.clone())
    );
    let outcomes = [fa.unwrap(), fb.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, FinalizeOutcome::Queued { .. })).count(),
        1
    );
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, FinalizeOutcome::Joined { .. })).count(),
        1
    );

    h.start_dispatcher();
    let a = h.wait_for(&a, TaskState::Completed).await;
    let b = h.wait_for(&b, TaskState::Completed).await;

    assert_eq!(h.processor.calls(), 1);
    assert!(matches!(a.result, Some(TranscriptOutput::Json(ref t)) if t.task_id == a.id));
    assert!(matches!(b.result, Some(TranscriptOutput::Srt(_))));
    assert!(h.sink.for_task(&b.id).contains(&Recorded::Complete(b.id.clone(), OutputFormat::Srt)));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_engine_fault_is_retried_after_recycling_the_slot() {
    let fault = PoolError::Engine(TaskError::new(ErrorKind::EngineFault, "index out of range"));
    let h = harness(FakeProcessor::failing_with(vec![fault]));
    let (path, hash) = h.audio("a.wav", 11);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path).await.unwrap();
    h.start_dispatcher();

    let task = h.wait_for(&id, TaskState::Completed).await;
    assert_eq!(task.retry_count, 1);
    assert_eq!(h.processor.calls(), 2);
    assert_eq!(*h.processor.recycled.lock().unwrap(), vec![0]);
    assert!(h
        .sink
        .for_task(&id)
        .iter()
        .any(|e| matches!(e, Recorded::Progress(_, _, TaskState::Pending))));
}

#[tokio::test]
async fn test_input_errors_fail_immediately() {
    let invalid = PoolError::Engine(TaskError::new(ErrorKind::InvalidAudio, "no audio stream"));
    let h = harness(FakeProcessor::failing_with(vec![invalid]));
    let (path, hash) = h.audio("a.wav", 13);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path.clone()).await.unwrap();
    h.start_dispatcher();

    let task = h.wait_for(&id, TaskState::Failed).await;
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.error.map(|e| e.error_type), Some(ErrorKind::InvalidAudio));
    assert_eq!(h.processor.calls(), 1);
    assert!(h.processor.recycled.lock().unwrap().is_empty());
    assert!(h.sink.for_task(&id).contains(&Recorded::Error(id.clone(), ErrorKind::InvalidAudio)));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_retries_stop_at_the_configured_limit() {
    let timeout = || PoolError::Timeout {
        task_id: "t".into(),
        seconds: 60,
    };
    let h = harness(FakeProcessor::failing_with(vec![timeout(), timeout(), timeout(), timeout()]));
    let (path, hash) = h.audio("a.wav", 17);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path).await.unwrap();
    h.start_dispatcher();

    let task = h.wait_for(&id, TaskState::Failed).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(task.retry_count, 2);
    assert_eq!(h.processor.calls(), 3);
    assert_eq!(task.error.map(|e| e.error_type), Some(ErrorKind::Timeout));
    assert_eq!(h.processor.recycled.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_queued_task_is_never_dispatched() {
    let h = harness(FakeProcessor::new());
    let (path, hash) = h.audio("a.wav", 19);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path.clone()).await.unwrap();

    assert!(h.manager.cancel(&id).await);
    assert!(!h.manager.cancel(&id).await);
    assert!(!h.manager.cancel("task-unknown").await);
    h.start_dispatcher();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(h.processor.calls(), 0);
    assert_eq!(h.manager.get_task(&id).await.unwrap().state, TaskState::Cancelled);
    assert_eq!(h.manager.stats().await.queue_depth, 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_cancelled_running_task_discards_its_result() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FakeProcessor::gated(gate.clone()));
    let (path, hash) = h.audio("a.wav", 23);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&id, TaskState::Processing).await;

    assert!(h.manager.cancel(&id).await);
    gate.add_permits(1);
    sleep(Duration::from_millis(100)).await;

    let task = h.manager.get_task(&id).await.unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.result.is_none());
    assert_eq!(h.processor.calls(), 1);
    assert!(!h
        .sink
        .for_task(&id)
        .iter()
        .any(|e| matches!(e, Recorded::Complete(..))));
}

#[tokio::test]
async fn test_shared_file_survives_until_last_sibling_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FakeProcessor::gated(gate.clone()));
    let (path, hash) = h.audio("a.wav", 29);
    let a = h.accepted("a.wav", &hash, OutputFormat::Json, true).await;
    let b = h.accepted("b.wav", &hash, OutputFormat::Json, true).await;
    let c = h.accepted("c.wav", &hash, OutputFormat::Json, true).await;
    for id in [&a, &b, &c] {
        h.manager.finalize_upload(id, path.clone()).await.unwrap();
    }
    h.start_dispatcher();
    h.wait_for(&a, TaskState::Processing).await;

    assert!(h.manager.cancel(&b).await);
    assert!(path.exists(), "cancel deleted a file still used by {} and {}", a, c);
    gate.add_permits(1);
    h.wait_for(&a, TaskState::Completed).await;
    assert!(path.exists(), "completion deleted a file still used by {}", c);

    gate.add_permits(1);
    h.wait_for(&c, TaskState::Completed).await;
    assert!(!path.exists());
    assert_eq!(h.processor.calls(), 2);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let mut processor = FakeProcessor::new();
    processor.progress = vec![10, 60, 30, 60, 85];
    let h = harness(processor);
    let (path, hash) = h.audio("a.wav", 31);
    let id = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&id, path).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&id, TaskState::Completed).await;
    sleep(Duration::from_millis(20)).await;

    let progress: Vec<u8> = h
        .sink
        .for_task(&id)
        .into_iter()
        .filter_map(|e| match e {
            Recorded::Progress(_, p, _) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 10, 60, 85, 100]);
}

#[tokio::test]
async fn test_full_queue_rejects_new_uploads() {
    let h = harness_with(FakeProcessor::new(), |c| c.max_queue_size = 1);
    let (first_path, first_hash) = h.audio("a.wav", 37);
    let (second_path, second_hash) = h.audio("b.wav", 41);
    let a = h.accepted("a.wav", &first_hash, OutputFormat::Json, false).await;
    let b = h.accepted("b.wav", &second_hash, OutputFormat::Json, false).await;

    match h.manager.finalize_upload(&a, first_path).await.unwrap() {
        FinalizeOutcome::Queued { queue, .. } => {
            assert_eq!(queue.position, 1);
            assert!(queue.estimated_wait_minutes > 0.0);
        }
        other => panic!("unexpected {:?}", other),
    }
    let err = h.manager.finalize_upload(&b, second_path.clone()).await.unwrap_err();
    assert_eq!(err.error_type, ErrorKind::QueueFull);
    assert!(h.manager.get_task(&b).await.is_none());
    assert!(!second_path.exists());
}

#[tokio::test]
async fn test_unreadable_upload_rejects_the_task() {
    let h = harness(FakeProcessor::new());
    let id = h.accepted("gone.wav", &"ab".repeat(32), OutputFormat::Json, false).await;

    let err = h
        .manager
        .finalize_upload(&id, h.dir.path().join("missing.wav"))
        .await
        .unwrap_err();
    assert_eq!(err.error_type, ErrorKind::FileNotFound);
    assert!(h.manager.get_task(&id).await.is_none());
    assert!(h.sink.for_task(&id).is_empty());

    let abandoned = h.accepted("slow.wav", &"ef".repeat(32), OutputFormat::Json, false).await;
    assert!(h
        .manager
        .reject_upload(&abandoned, TaskError::new(ErrorKind::UploadAbandoned, "idle"))
        .await);
    assert!(h
        .sink
        .for_task(&abandoned)
        .contains(&Recorded::Error(abandoned.clone(), ErrorKind::UploadAbandoned)));
    assert!(!h.manager.reject_upload(&abandoned, TaskError::new(ErrorKind::UploadAbandoned, "idle")).await);
}

#[tokio::test]
async fn test_failed_leader_hands_over_to_follower() {
    let timeout = PoolError::Timeout {
        task_id: "t".into(),
        seconds: 60,
    };
    let h = harness_with(FakeProcessor::failing_with(vec![timeout]), |c| c.retry_times = 0);
    let (path, hash) = h.audio("a.wav", 43);
    let leader = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    let follower = h.accepted("b.wav", &hash, OutputFormat::Json, false).await;
    h.manager.finalize_upload(&leader, path.clone()).await.unwrap();
    assert!(matches!(
        h.manager.finalize_upload(&follower, path).await.unwrap(),
        FinalizeOutcome::Joined { ref leader_id, .. } if *leader_id == leader
    ));
    h.start_dispatcher();

    h.wait_for(&leader, TaskState::Failed).await;
    h.wait_for(&follower, TaskState::Completed).await;
    assert_eq!(h.processor.calls(), 2);
}

#[tokio::test]
async fn test_expired_tasks_are_evicted() {
    let h = harness_with(FakeProcessor::new(), |c| {
        c.task_ttl_secs = 0;
        c.upload_ttl_secs = 0;
    });
    let (path, hash) = h.audio("a.wav", 47);
    let done = h.accepted("a.wav", &hash, OutputFormat::Json, false).await;
    let never_uploaded = h.accepted("b.wav", &"cd".repeat(32), OutputFormat::Json, false).await;
    h.manager.finalize_upload(&done, path).await.unwrap();
    h.start_dispatcher();
    h.wait_for(&done, TaskState::Completed).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(h.manager.evict_expired().await, 2);
    assert!(h.manager.get_task(&done).await.is_none());
    assert!(h.manager.get_task(&never_uploaded).await.is_none());
    assert!(h
        .sink
        .for_task(&never_uploaded)
        .contains(&Recorded::Error(never_uploaded.clone(), ErrorKind::UploadAbandoned)));
    assert_eq!(h.manager.stats().await, TaskStats::default());
}

#[test]
fn test_retry_classification() {
    for kind in [
        ErrorKind::InvalidAudio,
        ErrorKind::AudioTooShort,
        ErrorKind::FileNotFound,
        ErrorKind::UnsupportedFormat,
        ErrorKind::FileTooLarge,
        ErrorKind::AuthFailed,
        ErrorKind::HashMismatch,
    ] {
        assert!(!should_retry(kind), "{} must be terminal", kind);
    }
    for kind in [
        ErrorKind::EngineFault,
        ErrorKind::Timeout,
        ErrorKind::WorkerCrashed,
        ErrorKind::Io,
    ] {
        assert!(should_retry(kind), "{} must be retryable", kind);
    }
}
