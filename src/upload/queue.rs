use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use super::blob::{BlobError, BlobStore};
use super::task::{UploadStatus, UploadTask};
use crate::error::{CoreError, CoreResult};
use crate::events::{emit, CoreEvent, EventSender};
use crate::store::persist::{read_json_or_default, write_json_atomic};
use crate::store::{Recording, RecordingId, RecordingStore};

const LEDGER_FILE: &str = "uploads.json";
const IDLE_RECHECK: Duration = Duration::from_secs(3600);

/// Configuration for the upload queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum uploads in flight at once
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    /// Upper bound for a single attempt; elapsing counts as transient
    pub attempt_timeout: Duration,
    /// Prefix prepended to every remote object name
    pub object_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            object_prefix: "recordings".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    next_task_id: u64,
    tasks: Vec<UploadTask>,
}

enum Claim {
    Task(UploadTask),
    /// Nothing dispatchable; earliest scheduled retry, if any
    Wait(Option<DateTime<Utc>>),
}

enum Outcome {
    Delivered(String),
    Failed(BlobError),
    Cancelled,
}

/// Durable upload queue with bounded concurrency and retry/backoff
///
/// Runs independently of the session machine; the only shared state is
/// read access to the recording store.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    ledger_path: PathBuf,
    ledger: Mutex<Ledger>,
    store: RecordingStore,
    blob: Arc<dyn BlobStore>,
    slots: Arc<Semaphore>,
    wake: Notify,
    events: EventSender,
    shutdown: CancellationToken,
    in_flight: std::sync::Mutex<HashMap<u64, CancellationToken>>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Load the queue ledger from the store's data directory
    ///
    /// Tasks left InFlight by a previous process are demoted to Pending.
    pub async fn open(
        config: QueueConfig,
        store: RecordingStore,
        blob: Arc<dyn BlobStore>,
        events: EventSender,
    ) -> CoreResult<Self> {
        let ledger_path = store.data_dir().join(LEDGER_FILE);
        let mut ledger: Ledger = read_json_or_default(&ledger_path).await?;

        let mut demoted = 0;
        for task in ledger.tasks.iter_mut() {
            if task.status == UploadStatus::InFlight {
                task.status = UploadStatus::Pending;
                task.next_attempt_at = Utc::now();
                demoted += 1;
            }
        }
        if ledger.next_task_id == 0 {
            ledger.next_task_id = ledger.tasks.iter().map(|t| t.task_id).max().unwrap_or(0) + 1;
        }
        if demoted > 0 {
            warn!("Demoted {} interrupted upload(s) back to pending", demoted);
            write_json_atomic(&ledger_path, &ledger).await?;
        }

        info!(
            "Upload queue opened: {} task(s), {} slot(s), store {}",
            ledger.tasks.len(),
            config.max_concurrent,
            blob.name()
        );

        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                ledger_path,
                ledger: Mutex::new(ledger),
                store,
                blob,
                slots,
                wake: Notify::new(),
                events,
                shutdown: CancellationToken::new(),
                in_flight: std::sync::Mutex::new(HashMap::new()),
                dispatcher: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Spawn the dispatch loop (idempotent)
    pub fn start(&self) {
        let mut dispatcher = match self.inner.dispatcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if dispatcher.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *dispatcher = Some(tokio::spawn(inner.dispatch_loop()));
    }

    /// Queue a stored recording for upload
    ///
    /// Returns the existing task instead of creating a duplicate while one
    /// is still live (pending, in flight or waiting for a retry). Once the
    /// last task has reached a final outcome a new task is created.
    pub async fn enqueue(&self, recording_id: &RecordingId) -> CoreResult<UploadTask> {
        let recording = self.inner.store.get(recording_id).await?;

        let mut ledger = self.inner.ledger.lock().await;

        if let Some(existing) = ledger
            .tasks
            .iter()
            .rev()
            .find(|t| &t.recording_id == recording_id && !t.status.is_terminal())
        {
            debug!(
                "Upload of {} already tracked by task {} ({:?})",
                recording_id, existing.task_id, existing.status
            );
            return Ok(existing.clone());
        }

        let task_id = ledger.next_task_id;
        let task = UploadTask::new(
            task_id,
            recording.id.clone(),
            object_name(&self.inner.config.object_prefix, &recording),
        );
        ledger.next_task_id += 1;
        ledger.tasks.push(task.clone());

        if let Err(e) = write_json_atomic(&self.inner.ledger_path, &*ledger).await {
            ledger.tasks.pop();
            ledger.next_task_id -= 1;
            return Err(e);
        }
        drop(ledger);

        info!(
            "Queued upload task {} for {} as {}",
            task.task_id, task.recording_id, task.object_name
        );
        emit(
            &self.inner.events,
            CoreEvent::UploadQueued {
                recording_id: task.recording_id.clone(),
                task_id: task.task_id,
            },
        );
        self.inner.wake.notify_one();

        Ok(task)
    }

    /// Snapshot of every task, in enqueue order
    pub async fn tasks(&self) -> Vec<UploadTask> {
        self.inner.ledger.lock().await.tasks.clone()
    }

    /// Most recent task for a recording
    pub async fn task_for(&self, recording_id: &RecordingId) -> Option<UploadTask> {
        self.inner
            .ledger
            .lock()
            .await
            .tasks
            .iter()
            .rev()
            .find(|t| &t.recording_id == recording_id)
            .cloned()
    }

    /// Abort the running attempt for a recording; the task goes back to Pending
    pub fn cancel_in_flight(&self, task_id: u64) -> bool {
        let in_flight = match self.inner.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match in_flight.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop dispatching and wait for running attempts to settle
    ///
    /// Interrupted attempts return their tasks to Pending.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let dispatcher = match self.inner.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Upload dispatcher panicked: {}", e);
            }
        }

        let all_slots = self.inner.config.max_concurrent.max(1) as u32;
        match self.inner.slots.acquire_many(all_slots).await {
            Ok(permits) => drop(permits),
            Err(e) => warn!("Upload slots closed during shutdown: {}", e),
        }

        info!("Upload queue stopped");
    }
}

impl QueueInner {
    async fn dispatch_loop(self: Arc<Self>) {
        info!("Upload dispatcher started");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Claim::Task(task)) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.run_attempt(task, permit).await });
                }
                Ok(Claim::Wait(next_due)) => {
                    drop(permit);
                    let wait = next_due
                        .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(IDLE_RECHECK);

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim upload task: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("Upload dispatcher stopped");
    }

    /// Mark the oldest dispatchable task InFlight
    async fn claim_next(&self) -> CoreResult<Claim> {
        let mut ledger = self.ledger.lock().await;
        let now = Utc::now();

        let next = ledger
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_dispatchable(now))
            .min_by_key(|(_, t)| (t.enqueued_at, t.task_id))
            .map(|(index, _)| index);

        let task = match next {
            Some(index) => {
                let task = &mut ledger.tasks[index];
                task.status = UploadStatus::InFlight;
                task.clone()
            }
            None => {
                let next_due = ledger
                    .tasks
                    .iter()
                    .filter(|t| t.is_waiting())
                    .map(|t| t.next_attempt_at)
                    .min();
                return Ok(Claim::Wait(next_due));
            }
        };

        if let Err(e) = write_json_atomic(&self.ledger_path, &*ledger).await {
            if let Some(t) = ledger.tasks.iter_mut().find(|t| t.task_id == task.task_id) {
                t.status = UploadStatus::Pending;
            }
            return Err(e);
        }

        Ok(Claim::Task(task))
    }

    async fn run_attempt(self: Arc<Self>, task: UploadTask, permit: OwnedSemaphorePermit) {
        let cancel = self.shutdown.child_token();
        self.track(task.task_id, Some(cancel.clone()));

        info!(
            "Uploading {} as {} (attempt {}/{})",
            task.recording_id,
            task.object_name,
            task.attempts + 1,
            self.config.retry.max_attempts
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = self.attempt(&task) => match result {
                Ok(remote_id) => Outcome::Delivered(remote_id),
                Err(e) => Outcome::Failed(e),
            },
        };

        self.track(task.task_id, None);
        self.settle(task.task_id, outcome).await;

        drop(permit);
        self.wake.notify_one();
    }

    async fn attempt(&self, task: &UploadTask) -> Result<String, BlobError> {
        let recording = self.store.get(&task.recording_id).await.map_err(|e| match e {
            CoreError::NotFound(msg) => BlobError::Permanent(msg),
            other => BlobError::Retryable(other.to_string()),
        })?;

        let bytes = tokio::fs::read(&recording.path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BlobError::Permanent(format!(
                "recording file missing: {}",
                recording.path.display()
            )),
            _ => BlobError::Retryable(format!("read {}: {}", recording.path.display(), e)),
        })?;

        match tokio::time::timeout(
            self.config.attempt_timeout,
            self.blob.put(&task.object_name, bytes),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BlobError::Retryable(format!(
                "timed out after {:?}",
                self.config.attempt_timeout
            ))),
        }
    }

    /// Record the outcome of an attempt and emit the matching event
    async fn settle(&self, task_id: u64, outcome: Outcome) {
        let mut ledger = self.ledger.lock().await;

        let Some(task) = ledger.tasks.iter_mut().find(|t| t.task_id == task_id) else {
            error!("Upload task {} vanished from the ledger", task_id);
            return;
        };
        if task.status != UploadStatus::InFlight {
            warn!(
                "Upload task {} settled while {:?}; ignoring",
                task_id, task.status
            );
            return;
        }

        let now = Utc::now();
        let event = match outcome {
            Outcome::Cancelled => {
                task.status = UploadStatus::Pending;
                task.next_attempt_at = now;
                info!("Upload task {} cancelled; back to pending", task_id);
                None
            }
            Outcome::Delivered(remote_id) => {
                task.attempts += 1;
                task.status = UploadStatus::Succeeded;
                task.remote_id = Some(remote_id.clone());
                task.last_error = None;
                info!(
                    "Uploaded {} after {} attempt(s): {}",
                    task.recording_id, task.attempts, remote_id
                );
                Some(CoreEvent::UploadSucceeded {
                    recording_id: task.recording_id.clone(),
                    task_id,
                    remote_id,
                    attempts: task.attempts,
                })
            }
            Outcome::Failed(BlobError::Retryable(msg))
                if !self.config.retry.exhausted(task.attempts + 1) =>
            {
                task.attempts += 1;
                task.status = UploadStatus::FailedRetryable;
                let delay = self.config.retry.backoff(task.attempts);
                task.next_attempt_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                task.last_error = Some(msg.clone());
                warn!(
                    "Upload of {} failed (attempt {}): {}; retrying in {:?}",
                    task.recording_id, task.attempts, msg, delay
                );
                Some(CoreEvent::UploadRetryScheduled {
                    recording_id: task.recording_id.clone(),
                    task_id,
                    attempt: task.attempts,
                    next_attempt_at: task.next_attempt_at,
                    error: msg,
                })
            }
            Outcome::Failed(err) => {
                task.attempts += 1;
                task.status = UploadStatus::FailedPermanent;
                let msg = match err {
                    BlobError::Retryable(msg) => {
                        format!("giving up after {} attempts: {}", task.attempts, msg)
                    }
                    BlobError::Permanent(msg) => msg,
                };
                task.last_error = Some(msg.clone());
                error!("Upload of {} failed permanently: {}", task.recording_id, msg);
                Some(CoreEvent::UploadFailed {
                    recording_id: task.recording_id.clone(),
                    task_id,
                    attempts: task.attempts,
                    error: msg,
                })
            }
        };

        if let Err(e) = write_json_atomic(&self.ledger_path, &*ledger).await {
            error!("Failed to persist upload ledger: {}", e);
        }
        drop(ledger);

        if let Some(event) = event {
            emit(&self.events, event);
        }
    }

    fn track(&self, task_id: u64, token: Option<CancellationToken>) {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match token {
            Some(token) => {
                in_flight.insert(task_id, token);
            }
            None => {
                in_flight.remove(&task_id);
            }
        }
    }
}

/// Remote object name: `<prefix>/<recording id>.wav`
///
/// Recording ids never repeat, so object names never collide.
pub fn object_name(prefix: &str, recording: &Recording) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        recording.file_name()
    } else {
        format!("{}/{}", prefix, recording.file_name())
    }
}
