use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tether_core::SessionId;

/// Per-session mutual exclusion.
///
/// `save` deletes the previous archive before uploading the new one, so two
/// overlapping calls for the same id could leak a blob or erase a valid
/// record. Operations for different ids never contend.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Released when the guard drops.
    pub async fn acquire(&self, id: &SessionId) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        lock.lock_owned().await
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(&self, id: &SessionId) -> Option<OwnedMutexGuard<()>> {
        let lock = Arc::clone(self.locks.entry(id.clone()).or_default().value());
        lock.try_lock_owned().ok()
    }
}
