use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable identity of a recording: `rec-<sequence>-<capture timestamp>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(String);

impl RecordingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A reserved, not yet written, storage slot for one capture
#[derive(Debug, Clone)]
pub struct RecordingKey {
    pub id: RecordingId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub path: PathBuf,
}

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

impl RecordingKey {
    pub fn new(sequence: u64, captured_at: DateTime<Utc>, audio_dir: &Path) -> Self {
        let id = RecordingId(format!(
            "rec-{:06}-{}",
            sequence,
            captured_at.format(TIMESTAMP_FORMAT)
        ));
        let path = audio_dir.join(format!("{}.wav", id));

        Self {
            id,
            sequence,
            captured_at,
            path,
        }
    }

    /// Recover the key of an audio file named by [`RecordingKey::new`]
    ///
    /// Returns `None` for any other file name.
    pub fn parse(path: &Path) -> Option<Self> {
        if path.extension()? != "wav" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (sequence, timestamp) = stem.strip_prefix("rec-")?.split_once('-')?;
        if sequence.len() < 6 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let sequence = sequence.parse().ok()?;
        let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
        let key = Self::new(sequence, Utc.from_utc_datetime(&naive), path.parent()?);

        // Only names this module would have produced
        (key.path == path).then_some(key)
    }
}

/// One finalized, immutable capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,

    /// Session sequence number, strictly increasing across the store's lifetime
    pub sequence: u64,

    /// When capture began
    pub captured_at: DateTime<Utc>,

    pub path: PathBuf,

    /// Captured duration in seconds, fixed when capture stops
    pub duration_secs: f64,

    /// Size of the encoded file on disk
    pub byte_size: u64,

    pub sample_rate: u32,
    pub channels: u16,

    /// Encoding identifier (e.g. "pcm_s16le/wav")
    pub encoding: String,
}

impl Recording {
    /// File name of the encoded audio, also used as the remote object key
    pub fn file_name(&self) -> String {
        format!("{}.wav", self.id)
    }
}
