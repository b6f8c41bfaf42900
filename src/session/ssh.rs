use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::ssh_key::{self, Algorithm, HashAlg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, ConnectParams, Connector, Credential, RemoteCommand, RemoteSession,
    TransferStatus, percentage,
};
use crate::error::{FerryError, Result};
use crate::logging::LogThrottle;

/// Chunk size for streaming uploads (128KB)
const CHUNK_SIZE: usize = 128 * 1024;

/// How often to send progress updates (bytes between updates)
const PROGRESS_UPDATE_INTERVAL: u64 = 1024 * 1024;

/// Private key types, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ed25519,
    Ecdsa,
}

impl KeyType {
    pub const PRIORITY: [KeyType; 3] = [KeyType::Rsa, KeyType::Ed25519, KeyType::Ecdsa];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ed25519 => "ed25519",
            Self::Ecdsa => "ecdsa",
        }
    }

    fn accepts(&self, algorithm: &Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (KeyType::Rsa, Algorithm::Rsa { .. })
                | (KeyType::Ed25519, Algorithm::Ed25519)
                | (KeyType::Ecdsa, Algorithm::Ecdsa { .. })
        )
    }

    /// First type in priority order that accepts `algorithm`.
    pub fn detect(algorithm: &Algorithm) -> Option<KeyType> {
        Self::PRIORITY.into_iter().find(|kind| kind.accepts(algorithm))
    }
}

/// Resolve a leading `~` against `home`. Other paths are returned as given.
fn expand_home(path: &Path, home: Option<PathBuf>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Load a PEM/OpenSSH private key and resolve its type by priority order.
/// `~/.ssh/id_rsa` style paths are expanded against the user's home.
pub fn load_private_key(path: &Path) -> Result<(KeyType, PrivateKey)> {
    let expanded = expand_home(path, dirs::home_dir());
    let invalid = |reason: String| FerryError::InvalidKey {
        path: expanded.clone(),
        reason,
    };

    let pem = std::fs::read_to_string(&expanded).map_err(|e| invalid(e.to_string()))?;
    let key = russh::keys::decode_secret_key(&pem, None).map_err(|e| {
        let tried: Vec<&str> = KeyType::PRIORITY.iter().map(KeyType::as_str).collect();
        invalid(format!("{} (tried {})", e, tried.join(", ")))
    })?;

    let algorithm = key.algorithm();
    match KeyType::detect(&algorithm) {
        Some(kind) => Ok((kind, key)),
        None => Err(invalid(format!(
            "unsupported key algorithm {}",
            algorithm.as_str()
        ))),
    }
}

struct ClientHandler {
    host: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Host keys are accepted on first sight, as the deployment tools always did.
    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// Opens sessions over SSH.
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshSession::connect(params).await?))
    }
}

pub struct SshSession {
    handle: Handle<ClientHandler>,
    endpoint: String,
    io_timeout: Duration,
}

impl SshSession {
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        let endpoint = params.endpoint();
        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            host: params.host.clone(),
        };

        debug!(endpoint = %endpoint, auth = params.credential.kind(), "Connecting");

        let mut handle = bounded(
            params.timeout,
            format!("connect to {}", endpoint),
            client::connect(config, (params.host.as_str(), params.port), handler),
        )
        .await?
        .map_err(|e| FerryError::Transport(format!("connect to {}: {}", endpoint, e)))?;

        let auth = match &params.credential {
            Credential::Password(password) => {
                bounded(
                    params.timeout,
                    "password authentication".to_string(),
                    handle.authenticate_password(&params.username, password),
                )
                .await??
            }
            Credential::KeyFile(path) => {
                let (kind, key) = load_private_key(path)?;
                debug!(key_type = kind.as_str(), path = %path.display(), "Loaded private key");

                let hash_alg = bounded(
                    params.timeout,
                    "rsa hash negotiation".to_string(),
                    handle.best_supported_rsa_hash(),
                )
                .await??
                .flatten();
                bounded(
                    params.timeout,
                    "public key authentication".to_string(),
                    handle.authenticate_publickey(
                        &params.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    ),
                )
                .await??
            }
        };

        if !auth.success() {
            return Err(FerryError::AuthenticationFailure {
                host: params.host.clone(),
                username: params.username.clone(),
                reason: format!("server rejected {} credential", params.credential.kind()),
            });
        }

        info!(endpoint = %endpoint, auth = params.credential.kind(), "Connected");

        Ok(Self {
            handle,
            endpoint,
            io_timeout: params.timeout,
        })
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(&data[..]),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend_from_slice(&data[..])
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            // A channel closed without a status is treated as a failure.
            exit_code: exit_code.unwrap_or(255),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<&mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let receive = RemoteCommand::Receive(remote.to_string());
        let mut file = tokio::fs::File::open(local).await?;
        let total_bytes = file.metadata().await?.len();

        if let Some(tx) = progress {
            let _ = tx.send(TransferStatus::Ready).await;
        }

        let operation = format!("upload to {}", remote);
        let mut channel = bounded(
            self.io_timeout,
            operation.clone(),
            self.handle.channel_open_session(),
        )
        .await??;
        bounded(
            self.io_timeout,
            operation.clone(),
            channel.exec(true, receive.to_shell()),
        )
        .await??;

        let throttle = LogThrottle::new(Duration::from_secs(2));
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut bytes_sent: u64 = 0;
        let mut last_progress_update: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                let _ = channel.close().await;
                return Err(FerryError::Cancelled);
            }

            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }

            bounded(self.io_timeout, operation.clone(), channel.data(&buffer[..n])).await??;
            bytes_sent += n as u64;

            if bytes_sent - last_progress_update >= PROGRESS_UPDATE_INTERVAL
                || bytes_sent == total_bytes
            {
                if let Some(tx) = progress {
                    let _ = tx
                        .send(TransferStatus::InProgress {
                            total_bytes,
                            bytes_sent,
                            percentage: percentage(bytes_sent, total_bytes),
                        })
                        .await;
                }
                if throttle.should_log() {
                    debug!(bytes_sent, total_bytes, remote = %remote, "Upload progress");
                }
                last_progress_update = bytes_sent;
            }
        }

        bounded(self.io_timeout, operation.clone(), channel.eof()).await??;

        let mut exit_code = None;
        let mut stderr = Vec::new();
        while let Some(msg) = bounded(self.io_timeout, operation.clone(), channel.wait()).await?
        {
            match msg {
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    stderr.extend_from_slice(&data[..])
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        match exit_code {
            Some(0) => Ok(bytes_sent),
            code => Err(FerryError::RemoteCommandFailure {
                command: receive.to_shell(),
                exit_code: code.unwrap_or(255),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            }),
        }
    }

    async fn execute(&self, command: &RemoteCommand, timeout: Duration) -> Result<CommandOutput> {
        let line = command.to_shell();
        debug!(endpoint = %self.endpoint, command = %line, "Executing remote command");

        let output = bounded(timeout, format!("`{}`", line), self.run(&line)).await??;
        if !output.success() {
            debug!(
                command = %line,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Remote command failed"
            );
        }
        Ok(output)
    }

    async fn close(&self) -> Result<()> {
        let disconnect = bounded(
            self.io_timeout,
            format!("disconnect from {}", self.endpoint),
            self.handle.disconnect(Disconnect::ByApplication, "", "English"),
        )
        .await?;
        if let Err(e) = disconnect {
            warn!(endpoint = %self.endpoint, error = %e, "Disconnect failed");
            return Err(e.into());
        }
        debug!(endpoint = %self.endpoint, "Session closed");
        Ok(())
    }
}

/// Run `fut` with a deadline, mapping expiry to [`FerryError::NetworkTimeout`].
async fn bounded<F: std::future::Future>(
    after: Duration,
    operation: String,
    fut: F,
) -> Result<F::Output> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| FerryError::NetworkTimeout { operation, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::EcdsaCurve;
    use tempfile::tempdir;

    #[test]
    fn key_types_are_tried_rsa_first() {
        assert_eq!(
            KeyType::PRIORITY,
            [KeyType::Rsa, KeyType::Ed25519, KeyType::Ecdsa]
        );
    }

    #[test]
    fn detects_supported_algorithms() {
        assert_eq!(
            KeyType::detect(&Algorithm::Rsa { hash: None }),
            Some(KeyType::Rsa)
        );
        assert_eq!(KeyType::detect(&Algorithm::Ed25519), Some(KeyType::Ed25519));
        assert_eq!(
            KeyType::detect(&Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256
            }),
            Some(KeyType::Ecdsa)
        );
        assert_eq!(KeyType::detect(&Algorithm::Dsa), None);
    }

    #[test]
    fn garbage_key_file_is_invalid() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("id_bogus");
        std::fs::write(&path, "-----BEGIN NONSENSE-----\nabc\n-----END NONSENSE-----\n").unwrap();

        match load_private_key(&path) {
            Err(FerryError::InvalidKey { reason, .. }) => {
                assert!(reason.contains("tried rsa, ed25519, ecdsa"))
            }
            other => panic!("expected InvalidKey, got {:?}", other.map(|(k, _)| k)),
        }
    }

    #[test]
    fn tilde_key_paths_resolve_under_home() {
        let home = Some(PathBuf::from("/home/deploy"));
        assert_eq!(
            expand_home(Path::new("~/.ssh/id_rsa"), home.clone()),
            PathBuf::from("/home/deploy/.ssh/id_rsa")
        );
        assert_eq!(
            expand_home(Path::new("/etc/keys/id_rsa"), home.clone()),
            PathBuf::from("/etc/keys/id_rsa")
        );
        assert_eq!(
            expand_home(Path::new("~other/id_rsa"), home),
            PathBuf::from("~other/id_rsa")
        );
        assert_eq!(
            expand_home(Path::new("~/.ssh/id_rsa"), None),
            PathBuf::from("~/.ssh/id_rsa")
        );
    }

    #[test]
    fn tilde_key_file_is_read_from_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let err = load_private_key(Path::new("~/.ferry-test-no-such-key")).unwrap_err();
        match err {
            FerryError::InvalidKey { path, .. } => {
                assert_eq!(path, home.join(".ferry-test-no-such-key"))
            }
            other => panic!("expected InvalidKey, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stalled_step_times_out() {
        let err = bounded(
            Duration::from_millis(20),
            "upload to /tmp/app.zip".to_string(),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        match err {
            FerryError::NetworkTimeout { operation, after } => {
                assert_eq!(operation, "upload to /tmp/app.zip");
                assert_eq!(after, Duration::from_millis(20));
            }
            other => panic!("expected NetworkTimeout, got {:?}", other),
        }
    }

    #[test]
    fn missing_key_file_is_invalid() {
        let err = load_private_key(Path::new("/nonexistent/id_rsa")).unwrap_err();
        assert!(matches!(err, FerryError::InvalidKey { .. }));
    }
}
