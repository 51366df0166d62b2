//! Control of the external messaging client.
//!
//! The client runs as a child process and speaks JSON lines: one
//! [`DriverEvent`] per stdout line, one command per stdin line.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use tether_core::{ClientInfo, SessionId};

use crate::config::ClientConfig;

const EVENT_BUFFER: usize = 32;

/// Something the client reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    /// A pairing code to render as a QR image.
    Qr { code: String },
    Authenticated,
    Ready { info: ClientInfo },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DriverCommand {
    Logout,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("client is already running")]
    AlreadyRunning,

    #[error("client is not running")]
    NotRunning,

    #[error("failed to spawn client: {0}")]
    Spawn(std::io::Error),

    #[error("client io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Starts and stops the messaging client.
#[async_trait]
pub trait ClientDriver: Send + Sync {
    /// Launch the client for `session_id` using `profile_dir` as its
    /// browser profile. Events arrive on the returned channel until the
    /// client goes away.
    async fn start(
        &self,
        session_id: &SessionId,
        profile_dir: &Path,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError>;

    /// Ask the client to unlink the device.
    async fn logout(&self) -> Result<(), DriverError>;

    /// Stop the client. Stopping a client that is not running is a no-op.
    async fn stop(&self) -> Result<(), DriverError>;

    /// Whether a client is currently running.
    async fn is_running(&self) -> bool;
}

struct Running {
    child: Child,
    stdin: ChildStdin,
}

/// [`ClientDriver`] backed by a child process.
pub struct ProcessDriver {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<String>,
    stop_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl ProcessDriver {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_dir: config.working_dir.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout_seconds),
            running: Mutex::new(None),
        }
    }

    async fn send(&self, command: DriverCommand) -> Result<(), DriverError> {
        let mut guard = self.running.lock().await;
        let running = guard.as_mut().ok_or(DriverError::NotRunning)?;
        let mut line = serde_json::to_vec(&command)?;
        line.push(b'\n');
        running.stdin.write_all(&line).await?;
        running.stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ClientDriver for ProcessDriver {
    async fn start(
        &self,
        session_id: &SessionId,
        profile_dir: &Path,
    ) -> Result<mpsc::Receiver<DriverEvent>, DriverError> {
        let mut guard = self.running.lock().await;
        if let Some(running) = guard.as_mut() {
            if running.child.try_wait()?.is_none() {
                return Err(DriverError::AlreadyRunning);
            }
            *guard = None;
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TETHER_PROFILE_DIR", profile_dir)
            .env("TETHER_SESSION_ID", session_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(DriverError::Spawn)?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(DriverError::Spawn(std::io::Error::other(
                "client stdio was not captured",
            )));
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump_stdout(stdout, tx));
        tokio::spawn(log_stderr(stderr));

        info!(
            session_id = %session_id,
            command = %self.command,
            pid = child.id(),
            "client process started"
        );
        *guard = Some(Running { child, stdin });
        Ok(rx)
    }

    async fn logout(&self) -> Result<(), DriverError> {
        self.send(DriverCommand::Logout).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let mut line = serde_json::to_vec(&DriverCommand::Shutdown)?;
        line.push(b'\n');
        if let Err(e) = running.stdin.write_all(&line).await {
            debug!(error = %e, "client stdin already closed");
        }
        drop(running.stdin);

        match tokio::time::timeout(self.stop_timeout, running.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "client process exited"),
            Ok(Err(e)) => return Err(DriverError::Io(e)),
            Err(_) => {
                warn!(
                    timeout_secs = self.stop_timeout.as_secs(),
                    "client did not exit in time, killing it"
                );
                running.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.running.lock().await;
        match guard.as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

async fn pump_stdout(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<DriverEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut disconnected = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read client output");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<DriverEvent>(line) {
            Ok(event) => {
                disconnected |= matches!(event, DriverEvent::Disconnected { .. });
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!(error = %e, line, "skipping unparseable client output"),
        }
    }

    if !disconnected {
        let _ = tx
            .send(DriverEvent::Disconnected {
                reason: "process exited".into(),
            })
            .await;
    }
}

async fn log_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "tether::client", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse_from_json_lines() {
        let qr: DriverEvent = serde_json::from_str(r#"{"type":"qr","code":"2@abc"}"#).unwrap();
        assert_eq!(qr, DriverEvent::Qr { code: "2@abc".into() });

        let ready: DriverEvent =
            serde_json::from_str(r#"{"type":"ready","info":{"wid":"1555@c.us","pushname":"Ada"}}"#)
                .unwrap();
        let DriverEvent::Ready { info } = ready else {
            panic!("expected ready");
        };
        assert_eq!(info.user(), "1555");

        let gone: DriverEvent = serde_json::from_str(r#"{"type":"disconnected"}"#).unwrap();
        assert_eq!(gone, DriverEvent::Disconnected { reason: String::new() });
    }

    #[test]
    fn commands_serialize_tagged() {
        assert_eq!(
            serde_json::to_string(&DriverCommand::Logout).unwrap(),
            r#"{"type":"logout"}"#
        );
        assert_eq!(
            serde_json::to_string(&DriverCommand::Shutdown).unwrap(),
            r#"{"type":"shutdown"}"#
        );
    }

    #[cfg(unix)]
    fn shell(script: &str) -> ProcessDriver {
        ProcessDriver::new(&ClientConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            stop_timeout_seconds: 5,
            ..ClientConfig::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_events_and_synthetic_disconnect() {
        let driver = shell(
            r#"echo "{\"type\":\"qr\",\"code\":\"$TETHER_SESSION_ID\"}"
               echo "not json"
               echo '{"type":"authenticated"}'"#,
        );
        let id = SessionId::parse("alpha").unwrap();
        let mut rx = driver.start(&id, Path::new("/tmp")).await.unwrap();

        assert_eq!(rx.recv().await, Some(DriverEvent::Qr { code: "alpha".into() }));
        assert_eq!(rx.recv().await, Some(DriverEvent::Authenticated));
        assert_eq!(
            rx.recv().await,
            Some(DriverEvent::Disconnected {
                reason: "process exited".into()
            })
        );
        assert_eq!(rx.recv().await, None);
        driver.stop().await.unwrap();
        assert!(!driver.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_sends_shutdown_command() {
        let driver = shell(
            r#"read cmd
               case "$cmd" in
                 *shutdown*) echo '{"type":"disconnected","reason":"shutdown requested"}' ;;
               esac"#,
        );
        let id = SessionId::default_id();
        let mut rx = driver.start(&id, Path::new("/tmp")).await.unwrap();
        assert!(driver.is_running().await);
        assert!(matches!(
            driver.start(&id, Path::new("/tmp")).await,
            Err(DriverError::AlreadyRunning)
        ));

        driver.stop().await.unwrap();
        let Some(DriverEvent::Disconnected { reason }) = rx.recv().await else {
            panic!("expected disconnected");
        };
        assert!(reason.contains("shutdown"), "got {reason}");
        assert!(!driver.is_running().await);
        assert!(matches!(driver.logout().await, Err(DriverError::NotRunning)));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let driver = ProcessDriver::new(&ClientConfig {
            command: "/nonexistent/tether-client".into(),
            ..ClientConfig::default()
        });
        let err = driver
            .start(&SessionId::default_id(), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Spawn(_)));
    }
}
