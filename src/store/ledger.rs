use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::persist::{read_json_or_default, write_json_atomic};
use super::recording::{Recording, RecordingId, RecordingKey};
use crate::audio::{AudioInfo, RECORDING_ENCODING};
use crate::error::{CoreError, CoreResult};

const LEDGER_FILE: &str = "recordings.json";
const AUDIO_DIR: &str = "audio";

/// Append-only, durable ledger of finalized recordings
///
/// Layout under the data directory:
/// - `recordings.json` - ordered ledger
/// - `audio/<id>.wav` - encoded audio
#[derive(Clone)]
pub struct RecordingStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    data_dir: PathBuf,
    audio_dir: PathBuf,
    ledger_path: PathBuf,
    recordings: RwLock<Vec<Recording>>,
    next_sequence: AtomicU64,
    /// In-memory ledger has entries the file does not
    unsaved: AtomicBool,
}

impl RecordingStore {
    /// Open (or create) the store rooted at `data_dir`
    pub async fn open(data_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let data_dir = data_dir.into();
        let audio_dir = data_dir.join(AUDIO_DIR);
        tokio::fs::create_dir_all(&audio_dir).await?;

        let ledger_path = data_dir.join(LEDGER_FILE);
        let mut recordings: Vec<Recording> = read_json_or_default(&ledger_path).await?;

        let (recovered, highest_on_disk) = recover_unlisted(&audio_dir, &recordings).await?;
        let mut unsaved = false;
        let any_recovered = !recovered.is_empty();
        recordings.extend(recovered);
        recordings.sort_by_key(|r| r.sequence);

        if any_recovered {
            if let Err(e) = write_json_atomic(&ledger_path, &recordings).await {
                warn!("Recovered recordings not yet persisted: {}", e);
                unsaved = true;
            }
        }

        let next_sequence = recordings
            .last()
            .map(|r| r.sequence)
            .unwrap_or(0)
            .max(highest_on_disk)
            + 1;

        for recording in &recordings {
            if !recording.path.exists() {
                warn!(
                    "Recording {} is in the ledger but its file is missing: {}",
                    recording.id,
                    recording.path.display()
                );
            }
        }

        info!(
            "Recording store opened at {} ({} recordings)",
            data_dir.display(),
            recordings.len()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                audio_dir,
                ledger_path,
                recordings: RwLock::new(recordings),
                next_sequence: AtomicU64::new(next_sequence),
                unsaved: AtomicBool::new(unsaved),
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Reserve a unique storage target for a new capture
    ///
    /// Sequence numbers are never handed out twice, even if the capture
    /// is abandoned. Keys whose file already exists on disk are skipped.
    pub fn allocate(&self) -> RecordingKey {
        loop {
            let sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst);
            let key = RecordingKey::new(sequence, Utc::now(), &self.inner.audio_dir);
            if !key.path.exists() {
                return key;
            }
            warn!("Skipping recording key {}: file already exists", key.id);
        }
    }

    /// Append a finalized recording and persist the ledger
    ///
    /// If the ledger cannot be written the recording still becomes visible
    /// to `get` and `list`, the error is returned, and the entry is written
    /// by the next successful append or [`RecordingStore::flush`].
    pub async fn append(&self, recording: Recording) -> CoreResult<()> {
        let mut recordings = self.inner.recordings.write().await;

        if recordings.iter().any(|r| r.id == recording.id) {
            return Err(CoreError::Storage(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("recording {} already stored", recording.id),
            )));
        }

        let position = recordings.partition_point(|r| r.sequence < recording.sequence);
        recordings.insert(position, recording.clone());

        if let Err(e) = write_json_atomic(&self.inner.ledger_path, &*recordings).await {
            self.inner.unsaved.store(true, Ordering::SeqCst);
            error!(
                "Recording {} kept in memory; ledger write failed: {}",
                recording.id, e
            );
            return Err(e);
        }
        self.inner.unsaved.store(false, Ordering::SeqCst);

        info!(
            "Stored recording {} ({:.1}s, {} bytes)",
            recording.id, recording.duration_secs, recording.byte_size
        );

        Ok(())
    }

    /// Write entries left unsaved by a failed append
    pub async fn flush(&self) -> CoreResult<()> {
        let recordings = self.inner.recordings.write().await;
        if !self.inner.unsaved.load(Ordering::SeqCst) {
            return Ok(());
        }

        write_json_atomic(&self.inner.ledger_path, &*recordings).await?;
        self.inner.unsaved.store(false, Ordering::SeqCst);
        info!("Recording ledger flushed ({} recordings)", recordings.len());

        Ok(())
    }

    pub async fn get(&self, id: &RecordingId) -> CoreResult<Recording> {
        self.inner
            .recordings
            .read()
            .await
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("recording {}", id)))
    }

    pub async fn contains(&self, id: &RecordingId) -> bool {
        self.inner.recordings.read().await.iter().any(|r| &r.id == id)
    }

    /// All recordings, oldest first
    pub async fn list(&self) -> Vec<Recording> {
        self.inner.recordings.read().await.clone()
    }

    /// Recordings with a sequence number greater than `cursor`, oldest first
    ///
    /// Pass the last sequence seen to resume a listing.
    pub async fn list_after(&self, cursor: Option<u64>) -> Vec<Recording> {
        let recordings = self.inner.recordings.read().await;
        match cursor {
            None => recordings.clone(),
            Some(after) => recordings
                .iter()
                .filter(|r| r.sequence > after)
                .cloned()
                .collect(),
        }
    }
}

/// Finalized audio files that never made it into the ledger, plus the
/// highest sequence number found among recording-named files
///
/// A file is recovered when its name is a recording key and its WAV header
/// reads back with at least one sample. Anything else is left alone.
async fn recover_unlisted(
    audio_dir: &Path,
    listed: &[Recording],
) -> CoreResult<(Vec<Recording>, u64)> {
    let mut recovered = Vec::new();
    let mut highest = 0;
    let mut entries = tokio::fs::read_dir(audio_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(key) = RecordingKey::parse(&path) else {
            continue;
        };
        highest = highest.max(key.sequence);
        if listed.iter().any(|r| r.id == key.id) {
            continue;
        }

        let info = match AudioInfo::read(&path) {
            Ok(info) if info.frames > 0 => info,
            Ok(_) => {
                debug!("Ignoring empty audio file {}", path.display());
                continue;
            }
            Err(e) => {
                warn!("Ignoring unreadable audio file {}: {:#}", path.display(), e);
                continue;
            }
        };
        let byte_size = entry.metadata().await?.len();

        warn!(
            "Recovered recording {} missing from the ledger ({:.1}s)",
            key.id,
            info.duration_seconds()
        );
        recovered.push(Recording {
            id: key.id,
            sequence: key.sequence,
            captured_at: key.captured_at,
            path: key.path,
            duration_secs: info.duration_seconds(),
            byte_size,
            sample_rate: info.sample_rate,
            channels: info.channels,
            encoding: RECORDING_ENCODING.to_string(),
        });
    }

    Ok((recovered, highest))
}
