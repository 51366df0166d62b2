//! Lifecycle of the single managed messaging session.
//!
//! [`SessionManager`] owns the client status machine, starts and stops the
//! external client, restores the browser profile from the session store
//! before a start and backs it up while the client is authenticated.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use tether_core::{ClientInfo, ClientSignal, ClientStatus, SessionEvent, SessionId};
use tether_store::SessionStore;

use crate::archive;
use crate::config::SessionConfig;
use crate::driver::{ClientDriver, DriverEvent};
use crate::error::ServerError;

const EVENT_CAPACITY: usize = 64;

/// Why the client ended up in [`ClientStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote side rejected the stored credentials.
    AuthRejected,
    /// The client could not be started or crashed locally.
    Error,
}

/// Result of an initialization request that was not refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Started,
    AlreadyReady,
}

/// Point-in-time view of the session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: ClientStatus,
    pub qr_code: Option<String>,
    pub info: Option<ClientInfo>,
    pub failure: Option<FailureKind>,
}

/// Paths and timings the manager works with.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub session_id: SessionId,
    pub profile_dir: PathBuf,
    pub archive_path: PathBuf,
    pub backup_interval: Duration,
    pub restore_on_start: bool,
}

impl ManagerSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            session_id: config.id.clone(),
            profile_dir: config.profile_dir(),
            archive_path: config.archive_path(),
            backup_interval: config.backup_interval(),
            restore_on_start: config.restore_on_start,
        }
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    status: ClientStatus,
    qr_code: Option<String>,
    info: Option<ClientInfo>,
    failure: Option<FailureKind>,
}

pub struct SessionManager {
    settings: ManagerSettings,
    store: Arc<SessionStore>,
    driver: Arc<dyn ClientDriver>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<SessionEvent>,
    /// Serializes profile restore and client start, pack-and-save, and
    /// logout.
    profile_lock: tokio::sync::Mutex<()>,
    /// Cancels the current client run, from the start request through its
    /// event pump and backup timer.
    run: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SessionManager {
    pub fn new(
        settings: ManagerSettings,
        store: Arc<SessionStore>,
        driver: Arc<dyn ClientDriver>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            settings,
            store,
            driver,
            state: Mutex::new(ManagerState::default()),
            events,
            profile_lock: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.settings.session_id
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ClientStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: self.settings.session_id.clone(),
            status: state.status,
            qr_code: state.qr_code.clone(),
            info: state.info.clone(),
            failure: state.failure,
        }
    }

    /// Whether a client process is alive.
    pub async fn client_exists(&self) -> bool {
        self.driver.is_running().await
    }

    /// Whether the store holds a session to resume from.
    pub async fn has_stored_session(&self) -> bool {
        self.store.exists(&self.settings.session_id).await
    }

    // -- initialize ---------------------------------------------------------

    /// Restore the profile and start the client, waiting for the start.
    pub async fn initialize(self: &Arc<Self>) -> Result<InitOutcome, ServerError> {
        match self.begin_initialize()? {
            Some(token) => {
                self.launch(token).await?;
                Ok(InitOutcome::Started)
            }
            None => Ok(InitOutcome::AlreadyReady),
        }
    }

    /// Like [`initialize`](Self::initialize) but the restore and start run
    /// on a background task. Refusals are still reported synchronously.
    pub fn spawn_initialize(self: &Arc<Self>) -> Result<InitOutcome, ServerError> {
        if self.shutdown.is_cancelled() {
            return Err(ServerError::Internal("server is shutting down".into()));
        }
        let Some(token) = self.begin_initialize()? else {
            return Ok(InitOutcome::AlreadyReady);
        };
        let manager = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = manager.launch(token).await {
                error!(session_id = %manager.settings.session_id, error = %e, "client initialization failed");
            }
        });
        Ok(InitOutcome::Started)
    }

    /// Move to `Initializing` and register the token of the new run.
    /// Returns `None` when the client is already ready.
    fn begin_initialize(&self) -> Result<Option<CancellationToken>, ServerError> {
        let mut state = self.state.lock();
        if state.status.is_connecting() {
            return Err(ServerError::BadRequest("Already connecting".into()));
        }
        if state.status == ClientStatus::Ready {
            return Ok(None);
        }
        let from = state.status;
        let to = from
            .apply(ClientSignal::Initialize)
            .map_err(|e| ServerError::BadRequest(e.to_string()))?;
        state.status = to;
        state.qr_code = None;
        state.info = None;
        state.failure = None;

        let token = self.shutdown.child_token();
        if let Some(previous) = self.run.lock().replace(token.clone()) {
            previous.cancel();
        }
        drop(state);

        self.announce(from, to);
        Ok(Some(token))
    }

    async fn launch(self: &Arc<Self>, token: CancellationToken) -> Result<(), ServerError> {
        let _profile = self.profile_lock.lock().await;
        if !token.is_cancelled() {
            self.restore_profile().await;
        }
        if token.is_cancelled() {
            info!(session_id = %self.settings.session_id, "initialization cancelled before the client started");
            return Ok(());
        }

        let rx = match self
            .driver
            .start(&self.settings.session_id, &self.settings.profile_dir)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.transition(ClientSignal::Errored, |s| {
                    s.failure = Some(FailureKind::Error);
                    s.qr_code = None;
                });
                return Err(e.into());
            }
        };

        self.tasks.spawn(Arc::clone(self).pump(rx, token.clone()));
        self.tasks.spawn(Arc::clone(self).backup_loop(token));
        Ok(())
    }

    /// Materialize the stored profile. Any failure leaves an empty profile
    /// so the client falls back to a fresh pairing.
    async fn restore_profile(&self) {
        let id = &self.settings.session_id;
        if !self.settings.restore_on_start {
            debug!(session_id = %id, "profile restore disabled");
            return;
        }
        if !self.store.exists(id).await {
            info!(session_id = %id, "no stored session, a new pairing is required");
            return;
        }

        let archive_path = &self.settings.archive_path;
        if let Some(parent) = archive_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(path = %parent.display(), error = %e, "cannot create data directory");
        }

        if !self.store.extract(id, archive_path).await {
            warn!(session_id = %id, "stored session could not be extracted, starting fresh");
            remove_dir(&self.settings.profile_dir).await;
            return;
        }

        remove_dir(&self.settings.profile_dir).await;
        match archive::unpack(archive_path, &self.settings.profile_dir).await {
            Ok(entries) => info!(session_id = %id, entries, "session profile restored"),
            Err(e) => {
                warn!(session_id = %id, error = %e, "stored session is unreadable, starting fresh");
                remove_dir(&self.settings.profile_dir).await;
            }
        }
        remove_file(archive_path).await;
    }

    // -- client events ------------------------------------------------------

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<DriverEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!(session_id = %self.settings.session_id, "client event pump stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: DriverEvent) {
        match event {
            DriverEvent::Qr { code } => {
                let issued = code.clone();
                if self.transition(ClientSignal::PairingCodeIssued, |s| s.qr_code = Some(code)) {
                    info!(session_id = %self.settings.session_id, "pairing code received");
                    self.emit(SessionEvent::PairingCodeIssued { code: issued });
                }
            }
            DriverEvent::Authenticated => {
                self.transition(ClientSignal::Authenticated, |s| s.qr_code = None);
            }
            DriverEvent::Ready { info } => {
                let ready = info.clone();
                if self.transition(ClientSignal::Ready, |s| {
                    s.qr_code = None;
                    s.info = Some(info);
                }) {
                    info!(
                        session_id = %self.settings.session_id,
                        user = %ready.user(),
                        "client ready"
                    );
                    self.emit(SessionEvent::Ready { info: ready });
                    let manager = Arc::clone(self);
                    self.tasks.spawn(async move {
                        manager.backup().await;
                    });
                }
            }
            DriverEvent::AuthFailure { message } => {
                warn!(session_id = %self.settings.session_id, reason = %message, "authentication failed");
                if self.transition(ClientSignal::AuthFailed, |s| {
                    s.qr_code = None;
                    s.failure = Some(FailureKind::AuthRejected);
                }) {
                    self.end_run().await;
                }
            }
            DriverEvent::Disconnected { reason } => {
                if self.transition(ClientSignal::Disconnected, |s| {
                    s.qr_code = None;
                    s.info = None;
                }) {
                    warn!(session_id = %self.settings.session_id, reason = %reason, "client disconnected");
                    self.end_run().await;
                }
            }
        }
    }

    /// Apply `signal` and, if accepted, `update` under the same lock.
    fn transition(&self, signal: ClientSignal, update: impl FnOnce(&mut ManagerState)) -> bool {
        let mut state = self.state.lock();
        let from = state.status;
        let to = match from.apply(signal) {
            Ok(to) => to,
            Err(e) => {
                debug!(session_id = %self.settings.session_id, error = %e, "ignoring client signal");
                return false;
            }
        };
        state.status = to;
        update(&mut state);
        drop(state);

        if from != to {
            self.announce(from, to);
        }
        true
    }

    fn announce(&self, from: ClientStatus, to: ClientStatus) {
        info!(session_id = %self.settings.session_id, %from, %to, "client status changed");
        self.emit(SessionEvent::StatusChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Stop the current client run without touching the stored session.
    async fn end_run(&self) {
        if let Some(token) = self.run.lock().take() {
            token.cancel();
        }
        if let Err(e) = self.driver.stop().await {
            warn!(session_id = %self.settings.session_id, error = %e, "failed to stop client");
        }
    }

    // -- backup -------------------------------------------------------------

    async fn backup_loop(self: Arc<Self>, token: CancellationToken) {
        let interval = self.settings.backup_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if self.status().is_authenticated() {
                        self.backup().await;
                    }
                }
            }
        }
    }

    /// Pack the profile and save it to the store. Skipped unless the client
    /// is authenticated.
    pub async fn backup(&self) -> bool {
        let _guard = self.profile_lock.lock().await;
        let id = &self.settings.session_id;
        if !self.status().is_authenticated() {
            debug!(session_id = %id, "skipping backup, client not authenticated");
            return false;
        }

        let success = match self.pack_and_save().await {
            Ok(size) => {
                info!(session_id = %id, size_bytes = size, "session backed up");
                true
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "session backup failed");
                false
            }
        };
        self.emit(SessionEvent::BackupCompleted { success });
        success
    }

    async fn pack_and_save(&self) -> Result<u64, ServerError> {
        let archive_path = &self.settings.archive_path;
        let size = archive::pack_dir(&self.settings.profile_dir, archive_path).await?;
        let saved = self.store.save(&self.settings.session_id, archive_path).await;
        remove_file(archive_path).await;
        if saved {
            Ok(size)
        } else {
            Err(ServerError::Internal("session store rejected the archive".into()))
        }
    }

    // -- logout / shutdown --------------------------------------------------

    /// Unlink the device, forget the stored session and wipe the local
    /// profile. Returns `false` if any step failed.
    ///
    /// A start still restoring the profile is cancelled and waited for, so
    /// it cannot bring the session back afterwards.
    pub async fn logout(&self) -> bool {
        let id = &self.settings.session_id;
        if let Some(token) = self.run.lock().take() {
            token.cancel();
        }
        let _guard = self.profile_lock.lock().await;
        let mut ok = true;

        if self.driver.is_running().await
            && let Err(e) = self.driver.logout().await
        {
            warn!(session_id = %id, error = %e, "client logout failed");
        }
        if let Err(e) = self.driver.stop().await {
            warn!(session_id = %id, error = %e, "failed to stop client");
        }

        self.transition(ClientSignal::Reset, |s| *s = ManagerState::default());

        if let Err(e) = self.store.try_delete(id).await {
            error!(session_id = %id, error = %e, "failed to delete stored session");
            ok = false;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.settings.profile_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            error!(path = %self.settings.profile_dir.display(), error = %e, "failed to remove profile");
            ok = false;
        }
        remove_file(&self.settings.archive_path).await;

        info!(session_id = %id, ok, "logged out");
        ok
    }

    /// Final backup, then stop the client and wait for background tasks.
    pub async fn shutdown(&self) {
        if self.status().is_authenticated() {
            self.backup().await;
        }
        self.shutdown.cancel();
        self.run.lock().take();
        if let Err(e) = self.driver.stop().await {
            warn!(session_id = %self.settings.session_id, error = %e, "failed to stop client");
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!(session_id = %self.settings.session_id, "session manager stopped");
    }
}

async fn remove_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove directory");
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}
