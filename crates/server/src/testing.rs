//! Test doubles for the session manager and the HTTP API.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_core::{ClientStatus, SessionId};
use tether_store::SessionStore;
use tether_store_memory::{MemoryArchiveStore, MemorySessionLedger};

use crate::driver::{ClientDriver, DriverError, DriverEvent};
use crate::lifecycle::SessionManager;

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// A [`SessionStore`] on the in-memory backends with a small chunk size.
pub fn memory_store() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(
        Arc::new(MemoryArchiveStore::with_chunk_size(1024)),
        Arc::new(MemorySessionLedger::new()),
    ))
}

/// [`ClientDriver`] whose events are pushed by the test.
///
/// `start` writes a small browser profile into the profile directory so
/// backups have something to pack.
#[derive(Default)]
pub struct ScriptedDriver {
    sender: Mutex<Option<mpsc::Sender<DriverEvent>>>,
    running: AtomicBool,
    fail_start: bool,
    starts: AtomicUsize,
    logouts: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver whose `start` always fails.
    pub fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Deliver `event` as if the client had printed it. Returns `false`
    /// when no client is listening.
    pub async fn emit(&self, event: DriverEvent) -> bool {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientDriver for ScriptedDriver {
    async fn start(
        &self,
        _session_id: &SessionId,
        profile_dir: &Path,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError> {
        if self.fail_start {
            return Err(DriverError::Spawn(std::io::Error::other("scripted start failure")));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DriverError::AlreadyRunning);
        }
        let cookies = profile_dir.join("Default").join("Cookies");
        tokio::fs::create_dir_all(profile_dir.join("Default")).await?;
        if !tokio::fs::try_exists(&cookies).await? {
            tokio::fs::write(&cookies, b"scripted-cookies").await?;
        }

        let (tx, rx) = mpsc::channel(32);
        *self.sender.lock() = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn logout(&self) -> Result<(), DriverError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(DriverError::NotRunning);
        }
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.running.store(false, Ordering::SeqCst);
        self.sender.lock().take();
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Poll until the manager reports `status`.
///
/// # Panics
///
/// Panics if the status is not reached within five seconds.
pub async fn wait_for_status(manager: &SessionManager, status: ClientStatus) {
    let reached = tokio::time::timeout(WAIT_LIMIT, async {
        while manager.status() != status {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "status {status} not reached, still {}",
        manager.status()
    );
}

/// Poll until the manager's client is gone.
///
/// # Panics
///
/// Panics if the client is still running after five seconds.
pub async fn wait_for_client_stopped(manager: &SessionManager) {
    let stopped = tokio::time::timeout(WAIT_LIMIT, async {
        while manager.client_exists().await {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "client still running");
}
