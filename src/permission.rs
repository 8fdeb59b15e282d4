//! Microphone permission gate
//!
//! The core only reads the current authorization. Prompting the user is left
//! to the caller.

use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait::async_trait]
pub trait PermissionGate: Send + Sync {
    fn is_microphone_authorized(&self) -> bool;

    /// Ask the platform for access; resolves to the new authorization state
    async fn request_authorization(&self) -> bool;
}

/// Permission gate backed by a settable flag
#[derive(Debug, Default)]
pub struct StaticPermission {
    authorized: AtomicBool,
}

impl StaticPermission {
    pub fn new(authorized: bool) -> Self {
        Self {
            authorized: AtomicBool::new(authorized),
        }
    }

    pub fn set(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PermissionGate for StaticPermission {
    fn is_microphone_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    async fn request_authorization(&self) -> bool {
        self.is_microphone_authorized()
    }
}
