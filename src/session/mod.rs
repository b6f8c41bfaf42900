//! Authenticated remote sessions.
//!
//! A [`Connector`] opens a [`RemoteSession`]; the session runs structured
//! commands and receives files. [`ssh`] talks to real hosts, [`simulated`]
//! interprets the same command set against a local directory.

pub mod command;
pub mod simulated;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use command::RemoteCommand;

use crate::config::RetryConfig;
use crate::error::{FerryError, Result};

/// How a session authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Credential {
    Password(String),
    KeyFile(PathBuf),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFile(_) => "key",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub timeout: Duration,
}

impl ConnectParams {
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a nonzero exit into [`FerryError::RemoteCommandFailure`].
    pub fn check(self, command: &RemoteCommand) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(FerryError::RemoteCommandFailure {
                command: command.to_shell(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Upload progress, sent on a best-effort channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStatus {
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_sent: u64,
        percentage: u8,
    },
    Complete,
    Failed(String),
}

pub fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done as f64 / total as f64) * 100.0) as u8
    }
}

/// An open, authenticated channel to one remote host.
///
/// The session holds no cache of remote state; every observation goes
/// through a command.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn endpoint(&self) -> String;

    /// Send the whole of `local` to `remote`, from byte zero.
    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Run a command and wait for it. A command exceeding `timeout` is
    /// reported as [`FerryError::NetworkTimeout`].
    async fn execute(&self, command: &RemoteCommand, timeout: Duration) -> Result<CommandOutput>;

    async fn close(&self) -> Result<()>;

    async fn read_tail(&self, path: &str, lines: usize, timeout: Duration) -> Result<String> {
        let command = RemoteCommand::Tail {
            path: path.to_string(),
            lines,
        };
        let output = self.execute(&command, timeout).await?.check(&command)?;
        Ok(output.stdout)
    }

    async fn read_file(&self, path: &str, timeout: Duration) -> Result<String> {
        let command = RemoteCommand::Cat(path.to_string());
        let output = self.execute(&command, timeout).await?.check(&command)?;
        Ok(output.stdout)
    }
}

/// Opens sessions. One implementation per transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub attempts: u32,
    pub bytes: u64,
}

/// Retry the whole upload up to `policy.attempts` times with a fixed pause in
/// between. Every attempt re-sends the file from the start.
pub async fn upload_file_with_retry(
    session: &dyn RemoteSession,
    local: &Path,
    remote: &str,
    policy: &RetryConfig,
    progress: Option<&mpsc::Sender<TransferStatus>>,
    cancel: &CancellationToken,
) -> Result<UploadReport> {
    let mut last_error = String::from("no upload attempted");

    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }

        match session.upload_file(local, remote, progress, cancel).await {
            Ok(bytes) => {
                info!(attempt, bytes, remote = %remote, "Upload complete");
                if let Some(tx) = progress {
                    let _ = tx.send(TransferStatus::Complete).await;
                }
                return Ok(UploadReport {
                    attempts: attempt,
                    bytes,
                });
            }
            Err(FerryError::Cancelled) => return Err(FerryError::Cancelled),
            Err(e) => {
                last_error = e.to_string();
                if let Some(tx) = progress {
                    let _ = tx.send(TransferStatus::Failed(last_error.clone())).await;
                }

                if attempt < policy.attempts {
                    warn!(
                        attempt,
                        max_attempts = policy.attempts,
                        delay_secs = policy.delay_secs,
                        error = %e,
                        "Upload failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                        _ = tokio::time::sleep(policy.delay()) => {}
                    }
                } else {
                    warn!(attempt, error = %e, "Upload failed, no attempts left");
                }
            }
        }
    }

    Err(FerryError::UploadExhausted {
        attempts: policy.attempts,
        last_error,
    })
}
