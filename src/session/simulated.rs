//! An in-process stand-in for a remote host.
//!
//! Remote absolute paths map onto a local root directory, and every
//! [`RemoteCommand`] is interpreted directly instead of going through a
//! shell. Faults can be switched on to exercise retry, verification and
//! rollback paths.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    CommandOutput, ConnectParams, Connector, RemoteCommand, RemoteSession, TransferStatus,
    percentage,
};
use crate::core::archiver::{extract_archive, hash_file};
use crate::core::models::{join_remote, remote_base_name, remote_parent};
use crate::error::{FerryError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// Failures the simulated host can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Refuse every connection as an authentication failure.
    pub reject_auth: bool,
    /// Number of upcoming uploads that drop mid-transfer.
    pub failing_uploads: u32,
    /// Flip the last byte of every uploaded file.
    pub corrupt_uploads: bool,
    /// Every extraction exits nonzero after leaving partial output behind.
    pub fail_extract: bool,
    /// Renames onto a `.backup.` path are refused.
    pub fail_backup_rename: bool,
    /// Renames from a `.backup.` path are refused.
    pub fail_restore: bool,
    /// Removing a `.staging.` directory is refused.
    pub fail_staging_removal: bool,
}

#[derive(Debug, Default)]
struct HostState {
    faults: Faults,
    connections: u32,
    sessions_closed: u32,
    uploads_attempted: u32,
    commands: Vec<RemoteCommand>,
}

/// Shared handle to one simulated host. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    root: PathBuf,
    state: Arc<Mutex<HostState>>,
}

impl SimulatedHost {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self {
            root,
            state: Arc::new(Mutex::new(HostState::default())),
        })
    }

    /// Local path backing a remote absolute path.
    pub fn local_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    pub fn connections(&self) -> u32 {
        self.state().connections
    }

    pub fn sessions_closed(&self) -> u32 {
        self.state().sessions_closed
    }

    pub fn uploads_attempted(&self) -> u32 {
        self.state().uploads_attempted
    }

    /// Top-level commands executed so far, in order.
    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.state().commands.clone()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> Faults {
        self.state().faults.clone()
    }

    /// Interpret one command against the local root.
    pub fn apply(&self, command: &RemoteCommand) -> CommandOutput {
        match command {
            RemoteCommand::MakeDir(path) => io_result("mkdir", fs::create_dir_all(self.local_path(path))),
            RemoteCommand::Exists(path) => {
                if self.local_path(path).symlink_metadata().is_ok() {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            RemoteCommand::Move { from, to } => self.move_path(from, to),
            RemoteCommand::Copy {
                from,
                to,
                recursive,
            } => {
                let from = self.local_path(from);
                let to = self.local_path(to);
                let result = if *recursive {
                    copy_tree(&from, &to)
                } else {
                    fs::copy(&from, &to).map(|_| ())
                };
                io_result("cp", result)
            }
            RemoteCommand::RemoveAll(path) => {
                if self.faults().fail_staging_removal && path.contains(".staging.") {
                    return fail(1, &format!("rm: cannot remove '{}': Permission denied", path));
                }
                io_result("rm", remove_all(&self.local_path(path)))
            }
            RemoteCommand::RemoveFile(path) => {
                let local = self.local_path(path);
                if local.is_dir() {
                    return fail(1, &format!("rm: cannot remove '{}': Is a directory", path));
                }
                match fs::remove_file(&local) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => fail(1, &format!("rm: {}", e)),
                    _ => ok(""),
                }
            }
            RemoteCommand::Extract {
                format,
                archive,
                into,
            } => {
                let into_local = self.local_path(into);
                if self.faults().fail_extract {
                    // Leave something half-written behind, like a crashed unzip.
                    let _ = fs::create_dir_all(&into_local);
                    let _ = fs::write(into_local.join(".partial"), b"");
                    return fail(2, "simulated extraction failure");
                }
                match extract_archive(*format, &self.local_path(archive), &into_local) {
                    Ok(()) => ok(""),
                    Err(e) => fail(2, &format!("extract {}: {}", archive, e)),
                }
            }
            RemoteCommand::Hash { algorithm, path } => {
                match hash_file(&self.local_path(path), *algorithm) {
                    Ok(hex) => ok(&format!("{}  {}\n", hex, path)),
                    Err(e) => fail(1, &format!("{}: {}: {}", algorithm.remote_tool(), path, e)),
                }
            }
            RemoteCommand::Tail { path, lines } => match fs::read_to_string(self.local_path(path)) {
                Ok(content) => {
                    let all: Vec<&str> = content.lines().collect();
                    let start = all.len().saturating_sub(*lines);
                    let mut out = all[start..].join("\n");
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    ok(&out)
                }
                Err(e) => fail(1, &format!("tail: {}: {}", path, e)),
            },
            RemoteCommand::Cat(path) => match fs::read_to_string(self.local_path(path)) {
                Ok(content) => ok(&content),
                Err(e) => fail(1, &format!("cat: {}: {}", path, e)),
            },
            RemoteCommand::ListBackups { prefix } => {
                let parent = remote_parent(prefix);
                let name_prefix = remote_base_name(prefix);
                let mut found: Vec<String> = fs::read_dir(self.local_path(&parent))
                    .map(|entries| {
                        entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .filter(|name| name.starts_with(&name_prefix))
                            .map(|name| join_remote(&parent, &name))
                            .collect()
                    })
                    .unwrap_or_default();
                found.sort();
                let mut out = found.join("\n");
                if !out.is_empty() {
                    out.push('\n');
                }
                ok(&out)
            }
            RemoteCommand::Receive(path) => io_result("cat", fs::write(self.local_path(path), b"")),
            RemoteCommand::Chain(commands) => {
                let mut stdout = String::new();
                for command in commands {
                    let output = self.apply(command);
                    stdout.push_str(&output.stdout);
                    if !output.success() {
                        return CommandOutput { stdout, ..output };
                    }
                }
                ok(&stdout)
            }
        }
    }

    fn move_path(&self, from: &str, to: &str) -> CommandOutput {
        let faults = self.faults();
        if faults.fail_backup_rename && to.contains(".backup.") && !from.contains(".backup.") {
            return fail(1, &format!("mv: cannot move '{}': Permission denied", from));
        }
        if faults.fail_restore && from.contains(".backup.") {
            return fail(1, &format!("mv: cannot move '{}': Permission denied", from));
        }

        let source = self.local_path(from);
        let mut destination = self.local_path(to);
        if destination.is_dir() {
            destination = destination.join(remote_base_name(from));
        }
        io_result("mv", fs::rename(&source, &destination))
    }
}

#[async_trait]
impl Connector for SimulatedHost {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.state();
        if state.faults.reject_auth {
            return Err(FerryError::AuthenticationFailure {
                host: params.host.clone(),
                username: params.username.clone(),
                reason: "simulated host rejects all credentials".to_string(),
            });
        }
        state.connections += 1;
        debug!(endpoint = %params.endpoint(), root = %self.root.display(), "Simulated connect");

        Ok(Box::new(SimulatedSession {
            host: self.clone(),
            endpoint: params.endpoint(),
        }))
    }
}

pub struct SimulatedSession {
    host: SimulatedHost,
    endpoint: String,
}

#[async_trait]
impl RemoteSession for SimulatedSession {
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
        let corrupt = {
            let mut state = self.host.state();
            state.uploads_attempted += 1;
            if state.faults.failing_uploads > 0 {
                state.faults.failing_uploads -= 1;
                return Err(FerryError::Transport(
                    "simulated connection reset during upload".to_string(),
                ));
            }
            state.faults.corrupt_uploads
        };

        let destination = self.host.local_path(remote);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut reader = tokio::fs::File::open(local).await?;
        let total_bytes = reader.metadata().await?.len();
        let mut writer = tokio::fs::File::create(&destination).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut bytes_sent: u64 = 0;

        if let Some(tx) = progress {
            let _ = tx.send(TransferStatus::Ready).await;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(FerryError::Cancelled);
            }
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            bytes_sent += n as u64;

            if let Some(tx) = progress {
                let _ = tx
                    .send(TransferStatus::InProgress {
                        total_bytes,
                        bytes_sent,
                        percentage: percentage(bytes_sent, total_bytes),
                    })
                    .await;
            }
        }
        writer.flush().await?;
        drop(writer);

        if corrupt && bytes_sent > 0 {
            let mut bytes = tokio::fs::read(&destination).await?;
            if let Some(last) = bytes.last_mut() {
                *last ^= 0xff;
            }
            tokio::fs::write(&destination, bytes).await?;
        }

        Ok(bytes_sent)
    }

    async fn execute(&self, command: &RemoteCommand, _timeout: Duration) -> Result<CommandOutput> {
        self.host.state().commands.push(command.clone());
        let host = self.host.clone();
        let command = command.clone();
        Ok(tokio::task::spawn_blocking(move || host.apply(&command)).await?)
    }

    async fn close(&self) -> Result<()> {
        self.host.state().sessions_closed += 1;
        Ok(())
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(exit_code: u32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn io_result(tool: &str, result: std::io::Result<()>) -> CommandOutput {
    match result {
        Ok(()) => ok(""),
        Err(e) => fail(1, &format!("{}: {}", tool, e)),
    }
}

fn remove_all(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `cp -R from/. to` for directories, plain copy for files.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_file() {
        fs::copy(from, to)?;
        return Ok(());
    }
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ArchiveFormat, HashAlgorithm};
    use crate::session::Credential;
    use tempfile::tempdir;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "sim".to_string(),
            port: 22,
            username: "deploy".to_string(),
            credential: Credential::Password("pw".to_string()),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn commands_map_onto_root() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path()).unwrap();
        let session = host.connect(&params()).await.unwrap();
        let t = Duration::from_secs(1);

        session
            .execute(&RemoteCommand::MakeDir("/srv/app".to_string()), t)
            .await
            .unwrap();
        assert!(temp.path().join("srv/app").is_dir());

        let exists = session
            .execute(&RemoteCommand::Exists("/srv/app".to_string()), t)
            .await
            .unwrap();
        assert!(exists.success());

        let missing = session
            .execute(&RemoteCommand::Exists("/srv/other".to_string()), t)
            .await
            .unwrap();
        assert!(!missing.success());

        let moved = session
            .execute(
                &RemoteCommand::Move {
                    from: "/srv/app".to_string(),
                    to: "/srv/app.backup.1".to_string(),
                },
                t,
            )
            .await
            .unwrap();
        assert!(moved.success());
        assert!(temp.path().join("srv/app.backup.1").is_dir());

        let listed = session
            .execute(
                &RemoteCommand::ListBackups {
                    prefix: "/srv/app.backup.".to_string(),
                },
                t,
            )
            .await
            .unwrap();
        assert_eq!(listed.stdout, "/srv/app.backup.1\n");
        assert_eq!(host.commands().len(), 5);
    }

    #[tokio::test]
    async fn chain_stops_at_first_failure() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path()).unwrap();

        let output = host.apply(&RemoteCommand::chain([
            RemoteCommand::MakeDir("/a".to_string()),
            RemoteCommand::Extract {
                format: ArchiveFormat::Zip,
                archive: "/tmp/missing.zip".to_string(),
                into: "/a".to_string(),
            },
            RemoteCommand::MakeDir("/b".to_string()),
        ]));

        assert!(!output.success());
        assert!(temp.path().join("a").exists());
        assert!(!temp.path().join("b").exists());
    }

    #[tokio::test]
    async fn hash_output_looks_like_md5sum() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path()).unwrap();
        fs::write(temp.path().join("tmp/hello.txt"), b"hello world").unwrap();

        let output = host.apply(&RemoteCommand::Hash {
            algorithm: HashAlgorithm::Md5,
            path: "/tmp/hello.txt".to_string(),
        });
        assert_eq!(
            output.stdout,
            "5eb63bbbe01eeed093cb22bb8f5acdc3  /tmp/hello.txt\n"
        );
    }

    #[tokio::test]
    async fn rejected_auth_fails_connect() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path()).unwrap();
        host.set_faults(Faults {
            reject_auth: true,
            ..Default::default()
        });

        let err = host.connect(&params()).await.err().unwrap();
        assert!(matches!(err, FerryError::AuthenticationFailure { .. }));
        assert_eq!(host.connections(), 0);
    }

    #[tokio::test]
    async fn corrupted_upload_changes_content() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path().join("remote")).unwrap();
        host.set_faults(Faults {
            corrupt_uploads: true,
            ..Default::default()
        });
        let local = temp.path().join("a.bin");
        fs::write(&local, b"abc").unwrap();

        let session = host.connect(&params()).await.unwrap();
        let sent = session
            .upload_file(&local, "/tmp/a.bin", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sent, 3);
        let uploaded = fs::read(host.local_path("/tmp/a.bin")).unwrap();
        assert_eq!(uploaded.len(), 3);
        assert_ne!(uploaded, b"abc");
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let temp = tempdir().unwrap();
        let host = SimulatedHost::new(temp.path()).unwrap();
        fs::create_dir_all(temp.path().join("var/log")).unwrap();
        fs::write(temp.path().join("var/log/app.log"), "one\ntwo\nthree\n").unwrap();

        let session = host.connect(&params()).await.unwrap();
        let tail = session
            .read_tail("/var/log/app.log", 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(tail, "two\nthree\n");
    }
}
