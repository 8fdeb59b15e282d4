use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// What a lease is held for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePurpose {
    Capture,
    Playback,
}

/// Singleton exclusive access to the audio hardware
///
/// Acquisition never waits: a second caller gets `ResourceBusy`.
#[derive(Clone)]
pub struct ExclusiveDevice {
    permit: Arc<Semaphore>,
}

impl ExclusiveDevice {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn try_acquire(&self, purpose: LeasePurpose) -> CoreResult<DeviceLease> {
        let permit = Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| CoreError::ResourceBusy("audio device is already leased".to_string()))?;

        debug!("Device lease acquired for {:?}", purpose);

        Ok(DeviceLease {
            purpose,
            _permit: permit,
        })
    }

    /// Whether a lease is currently outstanding
    pub fn is_leased(&self) -> bool {
        self.permit.available_permits() == 0
    }
}

impl Default for ExclusiveDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Ownership token for the audio hardware; dropping it releases the device
#[derive(Debug)]
pub struct DeviceLease {
    purpose: LeasePurpose,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLease {
    pub fn purpose(&self) -> LeasePurpose {
        self.purpose
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        debug!("Device lease released ({:?})", self.purpose);
    }
}
