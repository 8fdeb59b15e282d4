// Integration tests for the durable upload queue
//
// A scripted blob store stands in for the network so each test can dictate
// timeouts, transient errors, and permanent rejections.

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use voicetwin::events::{self, EventSender};
use voicetwin::{
    BlobError, BlobStore, CoreError, CoreEvent, DirectoryBlobStore, QueueConfig, Recording,
    RecordingId, RecordingStore, RetryPolicy, UploadQueue, UploadStatus,
};

// ============================================================================
// Scripted blob store
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Deliver,
    Transient,
    Reject,
    /// Never answer (the queue's attempt timeout fires)
    Hang,
}

#[derive(Default)]
struct ScriptedBlobStore {
    script: Mutex<VecDeque<Step>>,
    latency: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    names: Mutex<Vec<String>>,
}

impl ScriptedBlobStore {
    fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl BlobStore for ScriptedBlobStore {
    async fn put(&self, object_name: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Deliver);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            Step::Deliver => {
                self.names.lock().unwrap().push(object_name.to_string());
                Ok(format!("mem://{}?{}", object_name, bytes.len()))
            }
            Step::Transient => Err(BlobError::Retryable("503 service unavailable".to_string())),
            Step::Reject => Err(BlobError::Permanent("403 quota exceeded".to_string())),
            Step::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Directory store whose first acknowledgement never arrives: the object is
/// written, then the call stalls past the queue's attempt timeout.
struct LostAckStore {
    inner: DirectoryBlobStore,
    calls: AtomicUsize,
}

impl LostAckStore {
    fn new(root: &std::path::Path) -> Self {
        Self {
            inner: DirectoryBlobStore::new(root),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for LostAckStore {
    async fn put(&self, object_name: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let remote_id = self.inner.put(object_name, bytes).await?;
        if call == 0 {
            std::future::pending::<()>().await;
        }
        Ok(remote_id)
    }

    fn name(&self) -> &str {
        "lost-ack"
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_config(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        max_concurrent: 2,
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            jitter: 0.2,
        },
        attempt_timeout: Duration::from_millis(100),
        object_prefix: "recordings".to_string(),
    }
}

/// Store a fake finalized recording with `size` bytes of audio
async fn seed_recording(store: &RecordingStore, size: usize) -> Result<Recording> {
    let key = store.allocate();
    std::fs::write(&key.path, vec![0u8; size])?;

    let recording = Recording {
        id: key.id,
        sequence: key.sequence,
        captured_at: key.captured_at,
        path: key.path,
        duration_secs: 1.0,
        byte_size: size as u64,
        sample_rate: 16000,
        channels: 1,
        encoding: "pcm_s16le/wav".to_string(),
    };
    store.append(recording.clone()).await?;
    Ok(recording)
}

async fn open_queue(
    store: &RecordingStore,
    config: QueueConfig,
    blob: Arc<dyn BlobStore>,
) -> Result<(UploadQueue, EventSender)> {
    let events = events::channel();
    let queue = UploadQueue::open(config, store.clone(), blob, events.clone()).await?;
    Ok((queue, events))
}

/// Wait for the terminal event of a recording's upload
async fn wait_terminal(
    rx: &mut broadcast::Receiver<CoreEvent>,
    recording_id: &RecordingId,
) -> Result<CoreEvent> {
    let wait = async {
        loop {
            let event = rx.recv().await?;
            let id = match &event {
                CoreEvent::UploadSucceeded { recording_id, .. }
                | CoreEvent::UploadFailed { recording_id, .. } => recording_id,
                _ => continue,
            };
            if id == recording_id {
                return Ok::<_, anyhow::Error>(event);
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await?
}

async fn wait_for_status(
    queue: &UploadQueue,
    recording_id: &RecordingId,
    status: UploadStatus,
) -> Result<()> {
    for _ in 0..500 {
        if let Some(task) = queue.task_for(recording_id).await {
            if task.status == status {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("task for {} never reached {:?}", recording_id, status)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_enqueue_is_idempotent_per_recording() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 1024).await?;
    let blob = Arc::new(ScriptedBlobStore::default());
    let (queue, _events) = open_queue(&store, fast_config(3), blob).await?;

    let first = queue.enqueue(&recording.id).await?;
    let second = queue.enqueue(&recording.id).await?;

    assert_eq!(first.task_id, second.task_id);
    assert_eq!(queue.tasks().await.len(), 1);
    assert_eq!(first.status, UploadStatus::Pending);
    assert_eq!(first.attempts, 0);
    assert_eq!(
        first.object_name,
        format!("recordings/{}.wav", recording.id)
    );

    Ok(())
}

#[tokio::test]
async fn test_enqueue_unknown_recording_is_not_found() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let (queue, _events) =
        open_queue(&store, fast_config(3), Arc::new(ScriptedBlobStore::default())).await?;

    let result = queue.enqueue(&"rec-000404-missing".into()).await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));
    assert!(queue.tasks().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_two_timeouts_then_success_takes_three_attempts() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 2048).await?;
    let blob = Arc::new(ScriptedBlobStore::new([Step::Hang, Step::Hang, Step::Deliver]));
    let (queue, events) = open_queue(&store, fast_config(5), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;

    match wait_terminal(&mut rx, &recording.id).await? {
        CoreEvent::UploadSucceeded {
            attempts,
            remote_id,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert!(remote_id.starts_with("mem://recordings/"));
        }
        other => bail!("unexpected outcome: {:?}", other),
    }

    let task = queue
        .task_for(&recording.id)
        .await
        .expect("task should exist");
    assert_eq!(task.status, UploadStatus::Succeeded);
    assert_eq!(task.attempts, 3);
    assert!(task.remote_id.is_some());
    assert_eq!(blob.calls(), 3);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_back_off_then_fail_permanently() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 512).await?;
    let blob = Arc::new(ScriptedBlobStore::new(vec![Step::Transient; 10]));
    let (queue, events) = open_queue(&store, fast_config(4), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;

    let mut scheduled = Vec::new();
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await? {
                CoreEvent::UploadRetryScheduled {
                    attempt,
                    next_attempt_at,
                    ..
                } => scheduled.push((attempt, next_attempt_at)),
                event @ CoreEvent::UploadFailed { .. } => return Ok::<_, anyhow::Error>(event),
                CoreEvent::UploadSucceeded { .. } => bail!("upload should not succeed"),
                _ => {}
            }
        }
    })
    .await??;

    assert_eq!(
        scheduled.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(
        scheduled.windows(2).all(|w| w[1].1 > w[0].1),
        "Retry times must strictly increase: {:?}",
        scheduled
    );
    assert!(matches!(outcome, CoreEvent::UploadFailed { attempts: 4, .. }));

    let task = queue.task_for(&recording.id).await.expect("task");
    assert_eq!(task.status, UploadStatus::FailedPermanent);
    assert_eq!(task.attempts, 4);
    assert!(task.last_error.is_some());
    assert_eq!(blob.calls(), 4);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_permanent_rejection_is_not_retried() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 512).await?;
    let blob = Arc::new(ScriptedBlobStore::new([Step::Reject]));
    let (queue, events) = open_queue(&store, fast_config(5), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;

    let outcome = wait_terminal(&mut rx, &recording.id).await?;
    assert!(matches!(outcome, CoreEvent::UploadFailed { attempts: 1, .. }));

    // Give the dispatcher a chance to misbehave
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(blob.calls(), 1);

    let task = queue.task_for(&recording.id).await.expect("task");
    assert_eq!(task.status, UploadStatus::FailedPermanent);
    assert_eq!(task.last_error.as_deref(), Some("403 quota exceeded"));

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reenqueue_after_outcome() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let delivered = seed_recording(&store, 256).await?;
    let rejected = seed_recording(&store, 256).await?;
    let blob = Arc::new(ScriptedBlobStore::new([Step::Deliver, Step::Reject]));
    let (queue, events) = open_queue(&store, fast_config(3), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    let first = queue.enqueue(&delivered.id).await?;
    wait_terminal(&mut rx, &delivered.id).await?;
    queue.enqueue(&rejected.id).await?;
    wait_terminal(&mut rx, &rejected.id).await?;

    // Succeeded: a fresh task uploads again
    let again = queue.enqueue(&delivered.id).await?;
    assert_ne!(again.task_id, first.task_id);
    assert_eq!(again.attempts, 0);
    assert!(matches!(
        wait_terminal(&mut rx, &delivered.id).await?,
        CoreEvent::UploadSucceeded { attempts: 1, .. }
    ));

    // Failed-Permanent: a fresh task
    let retry = queue.enqueue(&rejected.id).await?;
    assert_eq!(retry.attempts, 0);
    wait_terminal(&mut rx, &rejected.id).await?;
    assert_eq!(queue.tasks().await.len(), 4);
    assert_eq!(
        queue.task_for(&rejected.id).await.expect("task").status,
        UploadStatus::Succeeded
    );
    assert_eq!(blob.calls(), 4);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_interrupted_upload_resumes_as_pending_after_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let recording_id = {
        let store = RecordingStore::open(dir.path()).await?;
        let recording = seed_recording(&store, 4096).await?;
        let mut config = fast_config(3);
        config.attempt_timeout = Duration::from_secs(60);
        let blob = Arc::new(ScriptedBlobStore::new([Step::Hang]));
        let (queue, _events) = open_queue(&store, config, blob).await?;

        queue.start();
        queue.enqueue(&recording.id).await?;
        wait_for_status(&queue, &recording.id, UploadStatus::InFlight).await?;

        // Simulated crash: the handle goes away with the attempt still in flight
        drop(queue);
        recording.id
    };

    let store = RecordingStore::open(dir.path()).await?;
    let blob = Arc::new(ScriptedBlobStore::default());
    let (queue, events) = open_queue(&store, fast_config(3), blob.clone()).await?;

    let task = queue.task_for(&recording_id).await.expect("task survives restart");
    assert_eq!(task.status, UploadStatus::Pending);
    assert_eq!(task.attempts, 0);

    let mut rx = events.subscribe();
    queue.start();
    let outcome = wait_terminal(&mut rx, &recording_id).await?;
    assert!(matches!(outcome, CoreEvent::UploadSucceeded { attempts: 1, .. }));
    assert_eq!(blob.calls(), 1);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_returns_in_flight_task_to_pending() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 128).await?;
    let mut config = fast_config(3);
    config.attempt_timeout = Duration::from_secs(60);
    let (queue, _events) =
        open_queue(&store, config, Arc::new(ScriptedBlobStore::new([Step::Hang]))).await?;

    queue.start();
    queue.enqueue(&recording.id).await?;
    wait_for_status(&queue, &recording.id, UploadStatus::InFlight).await?;

    tokio::time::timeout(Duration::from_secs(5), queue.shutdown()).await?;

    let task = queue.task_for(&recording.id).await.expect("task");
    assert_eq!(task.status, UploadStatus::Pending);
    assert_eq!(task.attempts, 0, "Interrupted attempts are not counted");

    let ledger = std::fs::read_to_string(dir.path().join("uploads.json"))?;
    assert!(ledger.contains("\"pending\""), "Ledger should persist Pending: {}", ledger);

    Ok(())
}

#[tokio::test]
async fn test_cancel_in_flight_retries_without_counting() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 128).await?;
    let mut config = fast_config(3);
    config.attempt_timeout = Duration::from_secs(60);
    let blob = Arc::new(ScriptedBlobStore::new([Step::Hang, Step::Deliver]));
    let (queue, events) = open_queue(&store, config, blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    let task = queue.enqueue(&recording.id).await?;
    wait_for_status(&queue, &recording.id, UploadStatus::InFlight).await?;

    assert!(queue.cancel_in_flight(task.task_id));
    assert!(!queue.cancel_in_flight(task.task_id + 100));

    let outcome = wait_terminal(&mut rx, &recording.id).await?;
    assert!(matches!(outcome, CoreEvent::UploadSucceeded { attempts: 1, .. }));
    assert_eq!(blob.calls(), 2);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_stay_within_limit() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let blob = Arc::new(ScriptedBlobStore::default().with_latency(Duration::from_millis(50)));
    let (queue, _events) = open_queue(&store, fast_config(3), blob.clone()).await?;

    let mut recordings = Vec::new();
    for _ in 0..6 {
        recordings.push(seed_recording(&store, 64).await?);
    }

    queue.start();
    for recording in &recordings {
        queue.enqueue(&recording.id).await?;
    }
    for recording in &recordings {
        wait_for_status(&queue, &recording.id, UploadStatus::Succeeded).await?;
    }

    assert!(blob.max_active.load(Ordering::SeqCst) <= 2);
    assert_eq!(blob.calls(), 6);

    let mut names = blob.names();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 6, "Object names must be unique per recording");

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_audio_file_fails_permanently() -> Result<()> {
    let dir = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 128).await?;
    std::fs::remove_file(&recording.path)?;

    let blob = Arc::new(ScriptedBlobStore::default());
    let (queue, events) = open_queue(&store, fast_config(5), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;

    let outcome = wait_terminal(&mut rx, &recording.id).await?;
    assert!(matches!(outcome, CoreEvent::UploadFailed { attempts: 1, .. }));
    assert_eq!(blob.calls(), 0);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_directory_store_delivers_write_once_objects() -> Result<()> {
    let dir = TempDir::new()?;
    let remote = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 300).await?;
    let (queue, events) = open_queue(
        &store,
        fast_config(3),
        Arc::new(DirectoryBlobStore::new(remote.path())),
    )
    .await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;
    assert!(matches!(
        wait_terminal(&mut rx, &recording.id).await?,
        CoreEvent::UploadSucceeded { .. }
    ));

    let uploaded = remote
        .path()
        .join("recordings")
        .join(format!("{}.wav", recording.id));
    assert_eq!(std::fs::metadata(&uploaded)?.len(), 300);

    let task = queue.task_for(&recording.id).await.expect("task");
    assert!(task.next_attempt_at <= Utc::now());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_after_lost_acknowledgement_succeeds() -> Result<()> {
    let dir = TempDir::new()?;
    let remote = TempDir::new()?;
    let store = RecordingStore::open(dir.path()).await?;
    let recording = seed_recording(&store, 512).await?;
    let blob = Arc::new(LostAckStore::new(remote.path()));
    let (queue, events) = open_queue(&store, fast_config(3), blob.clone()).await?;
    let mut rx = events.subscribe();

    queue.start();
    queue.enqueue(&recording.id).await?;

    let outcome = wait_terminal(&mut rx, &recording.id).await?;
    assert!(
        matches!(outcome, CoreEvent::UploadSucceeded { attempts: 2, .. }),
        "Timed-out attempt that already wrote the object should not poison the retry: {:?}",
        outcome
    );
    assert_eq!(blob.calls.load(Ordering::SeqCst), 2);

    let uploaded = remote
        .path()
        .join("recordings")
        .join(format!("{}.wav", recording.id));
    assert_eq!(std::fs::metadata(&uploaded)?.len(), 512);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_restart_after_object_written_completes_upload() -> Result<()> {
    let dir = TempDir::new()?;
    let remote = TempDir::new()?;
    let uploaded = |id: &RecordingId| {
        remote
            .path()
            .join("recordings")
            .join(format!("{}.wav", id))
    };

    let recording_id = {
        let store = RecordingStore::open(dir.path()).await?;
        let recording = seed_recording(&store, 2048).await?;
        let mut config = fast_config(3);
        config.attempt_timeout = Duration::from_secs(60);
        let (queue, _events) =
            open_queue(&store, config, Arc::new(LostAckStore::new(remote.path()))).await?;

        queue.start();
        queue.enqueue(&recording.id).await?;
        wait_for_status(&queue, &recording.id, UploadStatus::InFlight).await?;
        for _ in 0..500 {
            if uploaded(&recording.id).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(uploaded(&recording.id).exists());

        // Crash before the acknowledgement is recorded
        drop(queue);
        recording.id
    };

    let store = RecordingStore::open(dir.path()).await?;
    let (queue, events) = open_queue(
        &store,
        fast_config(3),
        Arc::new(DirectoryBlobStore::new(remote.path())),
    )
    .await?;
    let mut rx = events.subscribe();
    queue.start();

    let outcome = wait_terminal(&mut rx, &recording_id).await?;
    assert!(
        matches!(outcome, CoreEvent::UploadSucceeded { attempts: 1, .. }),
        "Object left by the previous run should count as delivered: {:?}",
        outcome
    );
    assert_eq!(std::fs::metadata(uploaded(&recording_id))?.len(), 2048);

    queue.shutdown().await;
    Ok(())
}
