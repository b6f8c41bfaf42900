use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::error::FerryError;
use crate::session::{ConnectParams, Credential};

/// Archive container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Digest used for transfer-integrity checks. Not a security boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Remote tool that prints `<hex>  <path>` for a file.
    pub fn remote_tool(&self) -> &'static str {
        match self {
            Self::Md5 => "md5sum",
            Self::Sha256 => "sha256sum",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => f.write_str("md5"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Directory,
}

/// Local file or directory to ship. Owned by the caller, never modified.
#[derive(Debug, Clone)]
pub struct SourceArtifact {
    pub path: PathBuf,
    pub exclude_patterns: Vec<String>,
}

impl SourceArtifact {
    pub fn new(path: impl Into<PathBuf>, exclude_patterns: Vec<String>) -> Self {
        Self {
            path: path.into(),
            exclude_patterns,
        }
    }

    /// `None` when the path does not exist.
    pub fn kind(&self) -> Option<SourceKind> {
        let metadata = std::fs::metadata(&self.path).ok()?;
        Some(if metadata.is_dir() {
            SourceKind::Directory
        } else {
            SourceKind::File
        })
    }

    /// Simple substring / suffix match, not glob semantics.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_patterns.iter().any(|pattern| {
            let suffix = pattern.replace('*', "");
            (!pattern.is_empty() && name.contains(pattern.as_str()))
                || (!suffix.is_empty() && name.ends_with(&suffix))
        })
    }
}

/// A built archive. Immutable once created; the hash is computed exactly once
/// over the final bytes.
#[derive(Debug, Clone, Serialize)]
pub struct Archive {
    pub path: PathBuf,
    pub format: ArchiveFormat,
    pub hash: String,
    pub hash_algorithm: HashAlgorithm,
    pub size: u64,
    /// Name of the single top-level entry, equal to the source's base name.
    pub root_name: String,
    pub source_kind: SourceKind,
}

impl Archive {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.{}", self.root_name, self.format.extension()))
    }
}

/// Remote install location and the backup name derived for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentTarget {
    pub remote_path: String,
    pub backup_path: String,
    pub staging_path: String,
}

impl DeploymentTarget {
    pub fn new(remote_path: &str, timestamp: &str) -> Self {
        let remote_path = normalize_remote_path(remote_path);
        let parent = remote_parent(&remote_path);
        let name = remote_base_name(&remote_path);
        let staging_path = join_remote(&parent, &format!(".{}.staging.{}", name, timestamp));

        Self {
            backup_path: format!("{}.backup.{}", remote_path, timestamp),
            remote_path,
            staging_path,
        }
    }

    pub fn parent(&self) -> String {
        remote_parent(&self.remote_path)
    }

    pub fn base_name(&self) -> String {
        remote_base_name(&self.remote_path)
    }

    /// Prefix shared by every backup ever taken of this target.
    pub fn backup_prefix(&self) -> String {
        format!("{}.backup.", self.remote_path)
    }
}

static LAST_RUN_MS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Timestamp used in archive, backup and staging names. Sorts lexically, and
/// is strictly increasing within one process so concurrent runs never share
/// a name.
pub fn run_timestamp() -> String {
    let now = chrono::Local::now();
    let wall = now.timestamp_millis();
    let previous = match LAST_RUN_MS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(wall.max(last.saturating_add(1)))
    }) {
        Ok(last) | Err(last) => last,
    };
    let ms = wall.max(previous.saturating_add(1));

    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&chrono::Local))
        .unwrap_or(now)
        .format("%Y%m%d_%H%M%S_%3f")
        .to_string()
}

/// Normalized install path, or an error for paths that would make the
/// install overwrite the remote root or its parent.
pub fn validate_remote_path(path: &str) -> Result<String, FerryError> {
    let normalized = normalize_remote_path(path.trim());
    let base = remote_base_name(&normalized);
    if path.trim().is_empty() || normalized == "/" || matches!(base.as_str(), "" | "." | "..") {
        return Err(FerryError::InvalidRemotePath(path.to_string()));
    }
    Ok(normalized)
}

pub fn normalize_remote_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn remote_parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    }
}

pub fn remote_base_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Archive,
    Connect,
    Upload,
    Verify,
    Install,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Connect => "connect",
            Self::Upload => "upload",
            Self::Verify => "verify",
            Self::Install => "install",
            Self::Cleanup => "cleanup",
        }
    }

    /// Process exit code for a hard failure at this stage.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Archive => 2,
            Self::Connect => 3,
            Self::Upload => 4,
            Self::Verify => 5,
            Self::Install => 6,
            Self::Cleanup => 0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const EXIT_CANCELLED: i32 = 130;

/// What happened when an install failure tried to put things back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// The backup was moved back onto the target path.
    Restored { backup_path: String },
    /// Nothing existed before; the partial target was removed.
    Removed,
    /// Best-effort restore did not complete. Never retried.
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub detail: String,
}

/// Sole externally observable outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: String,
    /// Failing stage, or the last stage reached on success.
    pub stage: Stage,
    pub success: bool,
    pub message: String,
    pub exit_code: i32,
    pub stages: Vec<StageReport>,
    pub rollback: Option<RollbackOutcome>,
    pub warnings: Vec<String>,
    /// Actions a dry run would have taken.
    pub plan: Vec<String>,
}

impl PipelineResult {
    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }
}

/// A named deployment target from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub credential: Credential,
    pub remote_path: String,
    /// Remote log file shown by `ferry tail`.
    pub log_path: Option<String>,
}

impl TargetRecord {
    pub fn connect_params(&self, timeout: Duration) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self.credential.clone(),
            timeout,
        }
    }
}

/// One row of run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: String,
    /// Registry name, or the endpoint for ad-hoc deploys.
    pub target: String,
    pub source: String,
    pub stage: String,
    pub success: bool,
    pub exit_code: i32,
    pub message: String,
    pub created_at: String,
}
