use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::state::{ActiveCapture, ActivePlayback, SessionPhase, SessionState};
use crate::audio::{
    AudioDevice, AudioFile, ExclusiveDevice, LeasePurpose, RecordingWriter, WrittenAudio,
    RECORDING_ENCODING,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{emit, CoreEvent, EventSender};
use crate::permission::PermissionGate;
use crate::store::{Recording, RecordingId, RecordingStore};

/// Capture/playback coordinator
///
/// Owns at most one capture backend or one playback backend at a time.
/// Acquisition (`begin_capture`, `begin_playback`) never queues: if another
/// session operation holds the state, the caller gets `ResourceBusy`.
/// Release (`end_capture`, `end_playback`) runs on a detached task, so the
/// device is released and the state settles even if the caller's future is
/// dropped.
#[derive(Clone)]
pub struct SessionMachine {
    inner: Arc<MachineInner>,
}

struct MachineInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    phase_tx: watch::Sender<SessionPhase>,
    device: Arc<dyn AudioDevice>,
    exclusive: ExclusiveDevice,
    permission: Arc<dyn PermissionGate>,
    store: RecordingStore,
    events: EventSender,
    playback_generation: AtomicU64,
}

impl SessionMachine {
    pub fn new(
        config: SessionConfig,
        device: Arc<dyn AudioDevice>,
        permission: Arc<dyn PermissionGate>,
        store: RecordingStore,
        events: EventSender,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);

        Self {
            inner: Arc::new(MachineInner {
                config,
                state: Mutex::new(SessionState::Idle),
                phase_tx,
                device,
                exclusive: ExclusiveDevice::new(),
                permission,
                store,
                events,
                playback_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.inner.phase_tx.borrow().clone()
    }

    /// Watch phase changes
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Whether the audio hardware is currently leased
    pub fn device_in_use(&self) -> bool {
        self.inner.exclusive.is_leased()
    }

    /// Start recording into a new, uniquely named file
    pub async fn begin_capture(&self) -> CoreResult<RecordingId> {
        let inner = &self.inner;

        if !inner.permission.is_microphone_authorized() {
            warn!("Capture rejected: microphone not authorized");
            return Err(CoreError::PermissionDenied);
        }

        let mut state = inner.try_lock_state()?;
        match &*state {
            SessionState::Recording(_) => {
                return Err(CoreError::ResourceBusy("capture already in progress".to_string()))
            }
            SessionState::Playing(_) => {
                return Err(CoreError::ResourceBusy("playback in progress".to_string()))
            }
            SessionState::Idle | SessionState::Stopped { .. } => {}
        }

        let lease = inner.exclusive.try_acquire(LeasePurpose::Capture)?;

        let mut backend = inner
            .device
            .open_input(&inner.config.audio)
            .await
            .map_err(|e| {
                error!("Failed to open {} input: {:#}", inner.device.name(), e);
                CoreError::DeviceUnavailable(format!("{:#}", e))
            })?;

        let audio_rx = backend.start().await.map_err(|e| {
            error!("Failed to start capture on {}: {:#}", backend.name(), e);
            CoreError::DeviceUnavailable(format!("{:#}", e))
        })?;

        let key = inner.store.allocate();
        let writer = match RecordingWriter::create(&key.path, &inner.config.audio) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to open storage target {}: {:#}", key.path.display(), e);
                if let Err(stop_err) = backend.stop().await {
                    warn!("Failed to stop {} after storage error: {:#}", backend.name(), stop_err);
                }
                return Err(CoreError::DeviceUnavailable(format!("{:#}", e)));
            }
        };

        let stop = CancellationToken::new();
        let writer_task = tokio::spawn(writer.record(audio_rx, stop.clone()));

        info!(
            "Capture started: {} via {} -> {}",
            key.id,
            backend.name(),
            key.path.display()
        );

        let recording_id = key.id.clone();
        inner.transition(
            &mut state,
            SessionState::Recording(ActiveCapture {
                key,
                started: Instant::now(),
                backend,
                writer: writer_task,
                stop,
                lease,
            }),
        );

        Ok(recording_id)
    }

    /// Stop recording and finalize the recording
    ///
    /// Returns `InvalidStateTransition` when nothing is being recorded.
    pub async fn end_capture(&self) -> CoreResult<Recording> {
        self.detached(|inner| async move { inner.finish_capture().await })
            .await
    }

    /// Start playing a stored recording
    pub async fn begin_playback(&self, recording_id: &RecordingId) -> CoreResult<()> {
        let inner = &self.inner;

        let mut state = inner.try_lock_state()?;
        match &*state {
            SessionState::Recording(_) => {
                return Err(CoreError::ResourceBusy("capture in progress".to_string()))
            }
            SessionState::Playing(_) => {
                return Err(CoreError::ResourceBusy("playback already in progress".to_string()))
            }
            SessionState::Idle | SessionState::Stopped { .. } => {}
        }

        let recording = inner.store.get(recording_id).await?;
        let lease = inner.exclusive.try_acquire(LeasePurpose::Playback)?;

        let audio = AudioFile::open(&recording.path).map_err(|e| {
            error!("Failed to read {}: {:#}", recording.path.display(), e);
            CoreError::DeviceUnavailable(format!("{:#}", e))
        })?;

        let mut backend = inner.device.open_output().await.map_err(|e| {
            error!("Failed to open {} output: {:#}", inner.device.name(), e);
            CoreError::DeviceUnavailable(format!("{:#}", e))
        })?;

        let completion = backend.play(audio).await.map_err(|e| {
            error!("Failed to start playback on {}: {:#}", backend.name(), e);
            CoreError::DeviceUnavailable(format!("{:#}", e))
        })?;

        let generation = inner.playback_generation.fetch_add(1, Ordering::SeqCst) + 1;

        // End-of-stream from the device stops playback without a manual call.
        let weak: Weak<MachineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if completion.await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                match inner.finish_playback(Some(generation)).await {
                    Ok(true) => info!("Playback completed"),
                    Ok(false) => debug!("Playback {} already ended", generation),
                    Err(e) => warn!("Failed to finish playback {}: {}", generation, e),
                }
            }
        });

        info!("Playback started: {} via {}", recording.id, backend.name());

        let resume = state.last_recording();
        inner.transition(
            &mut state,
            SessionState::Playing(ActivePlayback {
                recording_id: recording.id,
                generation,
                backend,
                resume,
                lease,
            }),
        );

        Ok(())
    }

    /// Stop playback; a no-op when nothing is playing
    pub async fn end_playback(&self) -> CoreResult<()> {
        let stopped = self
            .detached(|inner| async move { inner.finish_playback(None).await })
            .await?;
        if !stopped {
            debug!("end_playback called while not playing");
        }
        Ok(())
    }

    /// Release whatever device handle is held (used on shutdown)
    pub async fn release_all(&self) -> CoreResult<()> {
        match self.phase() {
            SessionPhase::Recording { .. } => self.end_capture().await.map(|_| ()),
            SessionPhase::Playing { .. } => self.end_playback().await,
            _ => Ok(()),
        }
    }

    async fn detached<T, F, Fut>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(Arc<MachineInner>) -> Fut,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(f(Arc::clone(&self.inner)))
            .await
            .map_err(|e| {
                CoreError::Storage(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("session task failed: {}", e),
                ))
            })?
    }
}

impl MachineInner {
    fn try_lock_state(&self) -> CoreResult<MutexGuard<'_, SessionState>> {
        self.state.try_lock().map_err(|_| {
            CoreError::ResourceBusy("another session operation is in progress".to_string())
        })
    }

    fn transition(&self, state: &mut SessionState, next: SessionState) {
        let from = state.phase();
        *state = next;
        let to = state.phase();

        info!("Session {} -> {}", from.label(), to.label());
        self.phase_tx.send_replace(to.clone());
        emit(&self.events, CoreEvent::StateChanged { from, to });
    }

    async fn finish_capture(&self) -> CoreResult<Recording> {
        let mut state = self.state.lock().await;

        let from = state.phase();
        let active = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Recording(active) => active,
            other => {
                let label = other.label();
                *state = other;
                return Err(CoreError::InvalidStateTransition {
                    operation: "end capture",
                    state: label,
                });
            }
        };

        let ActiveCapture {
            key,
            started,
            mut backend,
            mut writer,
            stop,
            lease,
        } = active;

        let duration = started.elapsed();

        // Release failures are logged only; written audio is kept.
        if let Err(e) = backend.stop().await {
            warn!("Failed to stop {} cleanly: {:#}", backend.name(), e);
        }
        drop(backend);
        stop.cancel();

        let written: Option<WrittenAudio> =
            match tokio::time::timeout(self.config.drain_timeout, &mut writer).await {
                Ok(Ok(Ok(written))) => Some(written),
                Ok(Ok(Err(e))) => {
                    error!("Recording writer for {} failed: {:#}", key.id, e);
                    None
                }
                Ok(Err(e)) => {
                    error!("Recording writer for {} panicked: {}", key.id, e);
                    None
                }
                Err(_) => {
                    error!("Recording writer for {} did not drain in time", key.id);
                    writer.abort();
                    let _ = writer.await;
                    None
                }
            };
        drop(lease);

        let byte_size = match &written {
            Some(written) => written.byte_size,
            None => tokio::fs::metadata(&key.path)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
        };

        let recording = Recording {
            id: key.id.clone(),
            sequence: key.sequence,
            captured_at: key.captured_at,
            path: key.path.clone(),
            duration_secs: duration.as_secs_f64(),
            byte_size,
            sample_rate: self.config.audio.sample_rate,
            channels: self.config.audio.channels,
            encoding: RECORDING_ENCODING.to_string(),
        };

        let stored = self.store.append(recording.clone()).await;

        *state = SessionState::Stopped {
            last: recording.id.clone(),
        };
        let to = state.phase();
        info!(
            "Session {} -> {} ({} captured, {:.1}s)",
            from.label(),
            to.label(),
            recording.id,
            recording.duration_secs
        );
        self.phase_tx.send_replace(to.clone());
        emit(&self.events, CoreEvent::StateChanged { from, to });

        // The store keeps the entry readable even when its ledger write
        // fails, so Stopped always names a recording `get` can return.
        emit(
            &self.events,
            CoreEvent::RecordingFinalized {
                recording: recording.clone(),
            },
        );

        if let Err(e) = stored {
            error!("Recording {} is not yet durable: {}", recording.id, e);
            return Err(e);
        }

        Ok(recording)
    }

    /// Returns `Ok(false)` when there was nothing to stop
    ///
    /// With `generation` set, only that playback is ended; a stale
    /// completion signal never stops a newer playback.
    async fn finish_playback(&self, generation: Option<u64>) -> CoreResult<bool> {
        let mut state = self.state.lock().await;

        let from = state.phase();
        let active = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Playing(active)
                if generation.map_or(true, |g| g == active.generation) =>
            {
                active
            }
            other => {
                *state = other;
                return Ok(false);
            }
        };

        let ActivePlayback {
            recording_id,
            mut backend,
            resume,
            lease,
            ..
        } = active;

        if let Err(e) = backend.stop().await {
            warn!("Failed to stop {} cleanly: {:#}", backend.name(), e);
        }
        drop(backend);
        drop(lease);

        *state = match resume {
            Some(last) => SessionState::Stopped { last },
            None => SessionState::Idle,
        };
        let to = state.phase();
        info!(
            "Session {} -> {} (playback of {} ended)",
            from.label(),
            to.label(),
            recording_id
        );
        self.phase_tx.send_replace(to.clone());
        emit(&self.events, CoreEvent::StateChanged { from, to });

        Ok(true)
    }
}
