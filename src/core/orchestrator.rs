//! Runs one deployment through archive, connect, upload, verify, install and
//! cleanup.
//!
//! Stages run strictly in order and the first hard failure stops the
//! install path. Cleanup always runs, exactly once, before the result is
//! returned, and its problems never change the verdict.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, RetryConfig};
use crate::core::archiver::{self, Archiver};
use crate::core::installer::{Installer, RemoteArchive};
use crate::core::lock::TargetLocks;
use crate::core::models::{
    ArchiveFormat, DeploymentTarget, EXIT_CANCELLED, HashAlgorithm, PipelineResult,
    RollbackOutcome, SourceArtifact, Stage, StageReport, StageStatus, join_remote,
    run_timestamp, validate_remote_path,
};
use crate::core::verifier;
use crate::error::FerryError;
use crate::session::{
    ConnectParams, Connector, RemoteCommand, RemoteSession, TransferStatus,
    upload_file_with_retry,
};

/// The parts of [`AppConfig`] a pipeline run needs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub hash_algorithm: HashAlgorithm,
    pub retry: RetryConfig,
    pub command_timeout: Duration,
    pub remote_temp_dir: String,
    pub scratch_dir: PathBuf,
    pub backup_retention: Option<usize>,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            hash_algorithm: config.hash_algorithm,
            retry: config.retry.clone(),
            command_timeout: config.command_timeout(),
            remote_temp_dir: config.remote_temp_dir.clone(),
            scratch_dir: config.scratch_dir.clone(),
            backup_retention: config.backup_retention,
        }
    }
}

/// Everything that varies between runs.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub source: PathBuf,
    pub format: ArchiveFormat,
    pub exclude_patterns: Vec<String>,
    pub connect: ConnectParams,
    pub remote_path: String,
    pub verify: bool,
    /// Describe the run without touching the network or any filesystem.
    pub dry_run: bool,
}

type StageFailure = (Stage, FerryError);

/// Bookkeeping for one run. Cleanup reads the paths recorded here.
struct RunState {
    stages: Vec<StageReport>,
    warnings: Vec<String>,
    rollback: Option<RollbackOutcome>,
    plan: Vec<String>,
    local_archive: Option<PathBuf>,
    remote_archive: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            stages: Vec::new(),
            warnings: Vec::new(),
            rollback: None,
            plan: Vec::new(),
            local_archive: None,
            remote_archive: None,
        }
    }

    fn record(&mut self, stage: Stage, status: StageStatus, detail: impl Into<String>) {
        self.stages.push(StageReport {
            stage,
            status,
            detail: detail.into(),
        });
    }

    fn fail(&mut self, stage: Stage, error: FerryError) -> StageFailure {
        warn!(stage = %stage, error = %error, "Stage failed");
        self.record(stage, StageStatus::Failed, error.to_string());
        (stage, error)
    }

    fn ensure_active(&mut self, cancel: &CancellationToken, stage: Stage) -> Result<(), StageFailure> {
        if cancel.is_cancelled() {
            Err(self.fail(stage, FerryError::Cancelled))
        } else {
            Ok(())
        }
    }
}

/// Runs pipelines. Cheap to clone; clones share the per-target locks.
#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<PipelineSettings>,
    connector: Arc<dyn Connector>,
    archiver: Archiver,
    installer: Installer,
    locks: TargetLocks,
}

impl Orchestrator {
    pub fn new(settings: PipelineSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            archiver: Archiver::new(settings.scratch_dir.clone(), settings.hash_algorithm),
            installer: Installer::new(settings.command_timeout, settings.backup_retention),
            settings: Arc::new(settings),
            connector,
            locks: TargetLocks::new(),
        }
    }

    pub async fn run(
        &self,
        request: &DeployRequest,
        progress: Option<mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let run_id = Uuid::now_v7().to_string();
        let timestamp = run_timestamp();
        let span = info_span!(
            "deploy",
            run_id = %run_id,
            endpoint = %request.connect.endpoint(),
            remote_path = %request.remote_path
        );

        async {
            info!(source = %request.source.display(), dry_run = request.dry_run, "Starting pipeline");
            let started = Instant::now();

            let mut state = RunState::new();
            let mut session: Option<Box<dyn RemoteSession>> = None;

            // A bad install path is refused before anything is built or sent.
            let outcome = match validate_remote_path(&request.remote_path) {
                Err(e) => Err(state.fail(Stage::Install, e)),
                Ok(_) if request.dry_run => self.plan(request, &timestamp, &mut state),
                Ok(_) => {
                    self.execute(request, &timestamp, &mut state, &mut session, progress.as_ref(), cancel)
                        .await
                }
            };

            self.cleanup(&mut state, session).await;

            let result = finish(run_id.clone(), request, outcome, state);
            info!(
                success = result.success,
                stage = %result.stage,
                exit_code = result.exit_code,
                duration_ms = started.elapsed().as_millis() as u64,
                "Pipeline finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &DeployRequest,
        timestamp: &str,
        state: &mut RunState,
        session_slot: &mut Option<Box<dyn RemoteSession>>,
        progress: Option<&mpsc::Sender<TransferStatus>>,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        // archive
        state.ensure_active(cancel, Stage::Archive)?;
        let source = SourceArtifact::new(&request.source, request.exclude_patterns.clone());
        // Known before the build starts so a half-written archive is still removed.
        state.local_archive = self
            .archiver
            .output_path(&source, request.format, timestamp)
            .ok();
        let archive = self
            .archiver
            .build(&source, request.format, timestamp)
            .await
            .map_err(|e| state.fail(Stage::Archive, e))?;
        state.record(
            Stage::Archive,
            StageStatus::Ok,
            format!(
                "{} ({} bytes, {} {})",
                archive.file_name(),
                archive.size,
                archive.hash_algorithm,
                archive.hash
            ),
        );

        // connect
        state.ensure_active(cancel, Stage::Connect)?;
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(FerryError::Cancelled),
            result = self.connector.connect(&request.connect) => result,
        }
        .map_err(|e| state.fail(Stage::Connect, e))?;
        let session: &dyn RemoteSession = &**session_slot.insert(connected);
        state.record(Stage::Connect, StageStatus::Ok, session.endpoint());

        // upload
        state.ensure_active(cancel, Stage::Upload)?;
        let remote = join_remote(&self.settings.remote_temp_dir, &archive.file_name());
        state.remote_archive = Some(remote.clone());
        let upload = upload_file_with_retry(
            session,
            &archive.path,
            &remote,
            &self.settings.retry,
            progress,
            cancel,
        )
        .await
        .map_err(|e| state.fail(Stage::Upload, e))?;
        state.record(
            Stage::Upload,
            StageStatus::Ok,
            format!(
                "{} bytes to {} in {} attempt(s)",
                upload.bytes, remote, upload.attempts
            ),
        );

        // verify
        if request.verify {
            state.ensure_active(cancel, Stage::Verify)?;
            let verification = verifier::verify(
                session,
                &archive.hash,
                archive.hash_algorithm,
                &remote,
                self.settings.command_timeout,
            )
            .await
            .map_err(|e| state.fail(Stage::Verify, e))?;

            if !verification.matched {
                return Err(state.fail(
                    Stage::Verify,
                    FerryError::ChecksumMismatch {
                        local: verification.local,
                        remote: verification.remote,
                    },
                ));
            }
            state.record(
                Stage::Verify,
                StageStatus::Ok,
                format!("{} {}", archive.hash_algorithm, verification.remote),
            );
        } else {
            state.record(Stage::Verify, StageStatus::Skipped, "verification disabled");
        }

        // install
        state.ensure_active(cancel, Stage::Install)?;
        let target = DeploymentTarget::new(&request.remote_path, timestamp);
        let key = TargetLocks::key(
            &request.connect.host,
            request.connect.port,
            &target.remote_path,
        );
        let _guard = self.locks.acquire(&key).await;

        let remote_archive = RemoteArchive {
            path: remote,
            format: archive.format,
            root_name: archive.root_name.clone(),
            source_kind: archive.source_kind,
        };
        match self.installer.deploy(session, &remote_archive, &target).await {
            Ok(report) => {
                state.warnings.extend(report.warnings);
                let mut detail = format!("installed to {}", target.remote_path);
                if let Some(backup) = &report.backup_path {
                    detail.push_str(&format!(", previous content at {}", backup));
                }
                if !report.pruned.is_empty() {
                    detail.push_str(&format!(", pruned {} old backup(s)", report.pruned.len()));
                }
                let status = if report.overlaid {
                    detail.push_str(", overlaid without backup");
                    StageStatus::Warning
                } else {
                    StageStatus::Ok
                };
                state.record(Stage::Install, status, detail);
                Ok(())
            }
            Err(failure) => {
                state.warnings.extend(failure.warnings);
                state.rollback = failure.rollback;
                Err(state.fail(Stage::Install, failure.error))
            }
        }
    }

    /// Dry run: resolve everything that can be resolved locally and list the
    /// actions a real run would take.
    fn plan(
        &self,
        request: &DeployRequest,
        timestamp: &str,
        state: &mut RunState,
    ) -> Result<(), StageFailure> {
        let source = SourceArtifact::new(&request.source, request.exclude_patterns.clone());
        let kind = source
            .kind()
            .ok_or_else(|| state.fail(Stage::Archive, FerryError::SourceNotFound(source.path.clone())))?;
        let output = self
            .archiver
            .output_path(&source, request.format, timestamp)
            .map_err(|e| state.fail(Stage::Archive, e))?;
        let root_name = archiver::root_name(&source.path).map_err(|e| state.fail(Stage::Archive, e))?;
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = join_remote(&self.settings.remote_temp_dir, &file_name);
        let target = DeploymentTarget::new(&request.remote_path, timestamp);

        let mut plan = vec![
            format!(
                "archive {} -> {} (excluding {})",
                source.path.display(),
                output.display(),
                if source.exclude_patterns.is_empty() {
                    "nothing".to_string()
                } else {
                    source.exclude_patterns.join(", ")
                }
            ),
            format!(
                "connect {} using {}",
                request.connect.endpoint(),
                request.connect.credential.kind()
            ),
            format!(
                "upload -> {} (up to {} attempt(s), {}s apart)",
                remote, self.settings.retry.attempts, self.settings.retry.delay_secs
            ),
        ];
        if request.verify {
            plan.push(
                RemoteCommand::Hash {
                    algorithm: self.settings.hash_algorithm,
                    path: remote.clone(),
                }
                .to_shell(),
            );
        }
        plan.extend(self.installer.plan(
            &RemoteArchive {
                path: remote.clone(),
                format: request.format,
                root_name,
                source_kind: kind,
            },
            &target,
        ));
        plan.push(format!(
            "cleanup: remove {}, {}",
            output.display(),
            RemoteCommand::RemoveFile(remote).to_shell()
        ));

        for stage in [Stage::Archive, Stage::Connect, Stage::Upload, Stage::Verify, Stage::Install] {
            state.record(stage, StageStatus::Skipped, "dry run");
        }
        state.plan = plan;
        Ok(())
    }

    /// Remove the local archive, remove the uploaded archive and close the
    /// session. Runs once per run on every path.
    async fn cleanup(&self, state: &mut RunState, session: Option<Box<dyn RemoteSession>>) {
        let mut problems = Vec::new();

        if let Some(path) = state.local_archive.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed local archive"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => problems.push(format!("could not remove {}: {}", path.display(), e)),
            }
        }

        if let Some(session) = session {
            if let Some(remote) = state.remote_archive.take() {
                let command = RemoteCommand::RemoveFile(remote);
                let removed = match session.execute(&command, self.settings.command_timeout).await {
                    Ok(output) => output.check(&command).map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = removed {
                    problems.push(format!("could not remove remote archive: {}", e));
                }
            }
            if let Err(e) = session.close().await {
                problems.push(format!("could not close session: {}", e));
            }
        }

        if problems.is_empty() {
            state.record(Stage::Cleanup, StageStatus::Ok, "done");
        } else {
            for problem in &problems {
                warn!("Cleanup: {}", problem);
            }
            state.record(Stage::Cleanup, StageStatus::Warning, problems.join("; "));
            state.warnings.extend(problems);
        }
    }
}

fn finish(
    run_id: String,
    request: &DeployRequest,
    outcome: Result<(), StageFailure>,
    state: RunState,
) -> PipelineResult {
    let (stage, success, message, exit_code) = match outcome {
        Ok(()) if request.dry_run => (
            Stage::Cleanup,
            true,
            format!("dry run: {} action(s) planned", state.plan.len()),
            0,
        ),
        Ok(()) => (
            Stage::Cleanup,
            true,
            format!(
                "deployed {} to {}:{}",
                request.source.display(),
                request.connect.host,
                request.remote_path
            ),
            0,
        ),
        Err((stage, FerryError::Cancelled)) => {
            (stage, false, FerryError::Cancelled.to_string(), EXIT_CANCELLED)
        }
        Err((stage, error)) => (stage, false, error.to_string(), stage.exit_code()),
    };

    PipelineResult {
        run_id,
        stage,
        success,
        message,
        exit_code,
        stages: state.stages,
        rollback: state.rollback,
        warnings: state.warnings,
        plan: state.plan,
    }
}
