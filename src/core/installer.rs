//! Swaps an uploaded archive into place on the remote host.
//!
//! Sequence: make the parent, move any existing target aside to its backup
//! path, then extract into a staging directory and move the archive's root
//! entry onto the target, all in one chained command. If that chain fails the
//! backup is moved back. Both the backup rename and the rollback are best
//! effort; neither is retried.
//!
//! Two installs of the same target from different processes can still race
//! on the backup rename. [`crate::core::lock::TargetLocks`] only serialises
//! installs inside one process.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::models::{
    ArchiveFormat, DeploymentTarget, RollbackOutcome, SourceKind, join_remote,
};
use crate::error::FerryError;
use crate::session::{CommandOutput, RemoteCommand, RemoteSession};

/// An archive that has been uploaded and is ready to unpack.
#[derive(Debug, Clone)]
pub struct RemoteArchive {
    pub path: String,
    pub format: ArchiveFormat,
    pub root_name: String,
    pub source_kind: SourceKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    /// Where the previous content now lives, if there was any and the rename
    /// worked.
    pub backup_path: Option<String>,
    /// The backup rename failed and the new content was copied over the old.
    pub overlaid: bool,
    /// Old backups removed by the retention policy.
    pub pruned: Vec<String>,
    pub warnings: Vec<String>,
}

/// Hard install failure, plus whatever rollback managed to do.
#[derive(Debug)]
pub struct InstallFailure {
    pub error: FerryError,
    /// `None` when the failure happened before the target was touched.
    pub rollback: Option<RollbackOutcome>,
    pub warnings: Vec<String>,
}

/// State of the target before extraction started.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Prior {
    Absent,
    BackedUp(String),
    /// Existed, but could not be moved aside.
    InPlace,
}

#[derive(Debug, Clone)]
pub struct Installer {
    timeout: Duration,
    backup_retention: Option<usize>,
}

impl Installer {
    pub fn new(timeout: Duration, backup_retention: Option<usize>) -> Self {
        Self {
            timeout,
            backup_retention,
        }
    }

    /// Commands a deploy would issue when the target already exists and the
    /// backup rename succeeds.
    pub fn plan(&self, archive: &RemoteArchive, target: &DeploymentTarget) -> Vec<String> {
        let mut plan = vec![
            RemoteCommand::MakeDir(target.parent()).to_shell(),
            format!(
                "{} && {}",
                RemoteCommand::Exists(target.remote_path.clone()).to_shell(),
                RemoteCommand::Move {
                    from: target.remote_path.clone(),
                    to: target.backup_path.clone(),
                }
                .to_shell()
            ),
            install_chain(archive, target, false).to_shell(),
            format!(
                "on failure: {}",
                restore_chain(target, &Prior::BackedUp(target.backup_path.clone())).to_shell()
            ),
        ];
        if let Some(keep) = self.backup_retention {
            plan.push(format!(
                "keep newest {} of {}*",
                keep,
                target.backup_prefix()
            ));
        }
        plan
    }

    pub async fn deploy(
        &self,
        session: &dyn RemoteSession,
        archive: &RemoteArchive,
        target: &DeploymentTarget,
    ) -> Result<InstallReport, InstallFailure> {
        let mut report = InstallReport::default();

        let mkdir = RemoteCommand::MakeDir(target.parent());
        self.run(session, &mkdir).await.map_err(|error| InstallFailure {
            error,
            rollback: None,
            warnings: Vec::new(),
        })?;

        let exists = self
            .execute(session, &RemoteCommand::Exists(target.remote_path.clone()))
            .await
            .map_err(|error| InstallFailure {
                error,
                rollback: None,
                warnings: Vec::new(),
            })?
            .success();

        let prior = if exists {
            let rename = RemoteCommand::Move {
                from: target.remote_path.clone(),
                to: target.backup_path.clone(),
            };
            match self.run(session, &rename).await {
                Ok(_) => {
                    info!(backup = %target.backup_path, "Existing target moved aside");
                    report.backup_path = Some(target.backup_path.clone());
                    Prior::BackedUp(target.backup_path.clone())
                }
                Err(e) => {
                    // Deliberately not fatal: install proceeds over the old content.
                    warn!(target = %target.remote_path, error = %e, "Backup rename failed, continuing without backup");
                    report
                        .warnings
                        .push(format!("backup of {} not taken: {}", target.remote_path, e));
                    report.overlaid = true;
                    Prior::InPlace
                }
            }
        } else {
            Prior::Absent
        };

        let chain = install_chain(archive, target, prior == Prior::InPlace);
        if let Err(error) = self.run(session, &chain).await {
            warn!(target = %target.remote_path, error = %error, "Extraction failed, rolling back");
            let rollback = self.rollback(session, target, &prior, &mut report.warnings).await;
            if let RollbackOutcome::Failed { reason } = &rollback {
                let warning = FerryError::RollbackFailure(reason.clone()).to_string();
                warn!(target = %target.remote_path, "{}", warning);
                report.warnings.push(warning);
            }
            return Err(InstallFailure {
                error,
                rollback: Some(rollback),
                warnings: report.warnings,
            });
        }

        info!(target = %target.remote_path, "Archive installed");

        if let Some(keep) = self.backup_retention {
            self.prune_backups(session, target, keep, &mut report).await;
        }

        Ok(report)
    }

    async fn rollback(
        &self,
        session: &dyn RemoteSession,
        target: &DeploymentTarget,
        prior: &Prior,
        warnings: &mut Vec<String>,
    ) -> RollbackOutcome {
        if *prior == Prior::InPlace {
            let staging = RemoteCommand::RemoveAll(target.staging_path.clone());
            if let Err(e) = self.run(session, &staging).await {
                warn!(staging = %target.staging_path, error = %e, "Staging directory left behind");
                warnings.push(format!("could not remove {}: {}", target.staging_path, e));
            }
            return RollbackOutcome::Failed {
                reason: format!(
                    "no backup was taken; {} left as extracted",
                    target.remote_path
                ),
            };
        }

        match self.run(session, &restore_chain(target, prior)).await {
            Ok(_) => match prior {
                Prior::BackedUp(backup) => {
                    info!(backup = %backup, target = %target.remote_path, "Backup restored");
                    RollbackOutcome::Restored {
                        backup_path: backup.clone(),
                    }
                }
                _ => {
                    info!(target = %target.remote_path, "Partial target removed");
                    RollbackOutcome::Removed
                }
            },
            Err(e) => RollbackOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn prune_backups(
        &self,
        session: &dyn RemoteSession,
        target: &DeploymentTarget,
        keep: usize,
        report: &mut InstallReport,
    ) {
        let list = RemoteCommand::ListBackups {
            prefix: target.backup_prefix(),
        };
        let backups: Vec<String> = match self.run(session, &list).await {
            Ok(output) => output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Err(e) => {
                report.warnings.push(format!("could not list backups: {}", e));
                return;
            }
        };

        let excess = backups.len().saturating_sub(keep);
        for backup in backups.into_iter().take(excess) {
            match self.run(session, &RemoteCommand::RemoveAll(backup.clone())).await {
                Ok(_) => {
                    info!(backup = %backup, "Pruned old backup");
                    report.pruned.push(backup);
                }
                Err(e) => report
                    .warnings
                    .push(format!("could not prune {}: {}", backup, e)),
            }
        }
    }

    async fn execute(
        &self,
        session: &dyn RemoteSession,
        command: &RemoteCommand,
    ) -> crate::Result<CommandOutput> {
        session.execute(command, self.timeout).await
    }

    /// Execute and require a zero exit status.
    async fn run(
        &self,
        session: &dyn RemoteSession,
        command: &RemoteCommand,
    ) -> crate::Result<CommandOutput> {
        self.execute(session, command).await?.check(command)
    }
}

/// Extract into staging, place the root entry on the target, then remove
/// staging and the uploaded archive.
fn install_chain(archive: &RemoteArchive, target: &DeploymentTarget, overlay: bool) -> RemoteCommand {
    let staged_root = join_remote(&target.staging_path, &archive.root_name);
    let place = if overlay {
        RemoteCommand::Copy {
            from: staged_root,
            to: target.remote_path.clone(),
            recursive: archive.source_kind == SourceKind::Directory,
        }
    } else {
        RemoteCommand::Move {
            from: staged_root,
            to: target.remote_path.clone(),
        }
    };

    RemoteCommand::chain([
        RemoteCommand::MakeDir(target.staging_path.clone()),
        RemoteCommand::Extract {
            format: archive.format,
            archive: archive.path.clone(),
            into: target.staging_path.clone(),
        },
        place,
        RemoteCommand::RemoveAll(target.staging_path.clone()),
        RemoteCommand::RemoveFile(archive.path.clone()),
    ])
}

fn restore_chain(target: &DeploymentTarget, prior: &Prior) -> RemoteCommand {
    let mut commands = vec![
        RemoteCommand::RemoveAll(target.remote_path.clone()),
        RemoteCommand::RemoveAll(target.staging_path.clone()),
    ];
    if let Prior::BackedUp(backup) = prior {
        commands.push(RemoteCommand::Move {
            from: backup.clone(),
            to: target.remote_path.clone(),
        });
    }
    RemoteCommand::Chain(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archiver::Archiver;
    use crate::core::models::{HashAlgorithm, SourceArtifact};
    use crate::session::simulated::{Faults, SimulatedHost};
    use crate::session::{ConnectParams, Connector, Credential};
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _temp: TempDir,
        host: SimulatedHost,
        session: Box<dyn RemoteSession>,
        archive: RemoteArchive,
    }

    /// Build `app/{index.html,version.txt}` with the given version, upload it
    /// to the simulated host's /tmp.
    async fn fixture(version: &str) -> Fixture {
        let temp = tempdir().unwrap();
        let app = temp.path().join("src/app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("index.html"), "<h1>hi</h1>").unwrap();
        fs::write(app.join("version.txt"), version).unwrap();

        let archive = Archiver::new(temp.path().join("scratch"), HashAlgorithm::Md5)
            .build_blocking(&SourceArtifact::new(&app, vec![]), ArchiveFormat::Zip, "ts")
            .unwrap();

        let host = SimulatedHost::new(temp.path().join("remote")).unwrap();
        let session = host
            .connect(&ConnectParams {
                host: "sim".to_string(),
                port: 22,
                username: "deploy".to_string(),
                credential: Credential::Password("pw".to_string()),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        let remote = "/tmp/app_ts.zip".to_string();
        session
            .upload_file(&archive.path, &remote, None, &CancellationToken::new())
            .await
            .unwrap();

        Fixture {
            _temp: temp,
            host,
            session,
            archive: RemoteArchive {
                path: remote,
                format: archive.format,
                root_name: archive.root_name,
                source_kind: archive.source_kind,
            },
        }
    }

    fn seed_existing(host: &SimulatedHost, version: &str) {
        let existing = host.local_path("/srv/app");
        fs::create_dir_all(&existing).unwrap();
        fs::write(existing.join("version.txt"), version).unwrap();
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn installer(retention: Option<usize>) -> Installer {
        Installer::new(Duration::from_secs(5), retention)
    }

    #[tokio::test]
    async fn fresh_install_creates_target_without_backup() {
        let f = fixture("v2").await;
        let target = DeploymentTarget::new("/srv/app", "t1");

        let report = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap();

        assert!(report.backup_path.is_none());
        assert_eq!(read(&f.host.local_path("/srv/app/version.txt")), "v2");
        assert!(!f.host.local_path("/srv/app.backup.t1").exists());
        assert!(!f.host.local_path(&target.staging_path).exists());
        assert!(!f.host.local_path("/tmp/app_ts.zip").exists());
    }

    #[tokio::test]
    async fn existing_target_is_backed_up() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        let target = DeploymentTarget::new("/srv/app", "t1");

        let report = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap();

        assert_eq!(report.backup_path.as_deref(), Some("/srv/app.backup.t1"));
        assert_eq!(read(&f.host.local_path("/srv/app/version.txt")), "v2");
        assert_eq!(read(&f.host.local_path("/srv/app.backup.t1/version.txt")), "v1");
    }

    #[tokio::test]
    async fn failed_extraction_restores_previous_content() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        f.host.set_faults(Faults {
            fail_extract: true,
            ..Default::default()
        });
        let target = DeploymentTarget::new("/srv/app", "t1");

        let failure = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FerryError::RemoteCommandFailure { .. }));
        assert_eq!(
            failure.rollback,
            Some(RollbackOutcome::Restored {
                backup_path: "/srv/app.backup.t1".to_string()
            })
        );
        assert_eq!(read(&f.host.local_path("/srv/app/version.txt")), "v1");
        assert!(!f.host.local_path("/srv/app.backup.t1").exists());
        assert!(!f.host.local_path(&target.staging_path).exists());
    }

    #[tokio::test]
    async fn failed_extraction_without_prior_removes_target() {
        let f = fixture("v2").await;
        f.host.set_faults(Faults {
            fail_extract: true,
            ..Default::default()
        });
        let target = DeploymentTarget::new("/srv/app", "t1");

        let failure = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap_err();

        assert_eq!(failure.rollback, Some(RollbackOutcome::Removed));
        assert!(!f.host.local_path("/srv/app").exists());
    }

    #[tokio::test]
    async fn failed_restore_is_a_warning_on_the_failure() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        f.host.set_faults(Faults {
            fail_extract: true,
            fail_restore: true,
            ..Default::default()
        });
        let target = DeploymentTarget::new("/srv/app", "t1");

        let failure = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FerryError::RemoteCommandFailure { .. }));
        assert!(matches!(failure.rollback, Some(RollbackOutcome::Failed { .. })));
        assert!(failure.warnings.iter().any(|w| w.starts_with("rollback failed")));
        // The backup is still there for a human to recover.
        assert_eq!(read(&f.host.local_path("/srv/app.backup.t1/version.txt")), "v1");
    }

    #[tokio::test]
    async fn failed_backup_rename_overlays_and_warns() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        fs::write(f.host.local_path("/srv/app/extra.txt"), "kept").unwrap();
        f.host.set_faults(Faults {
            fail_backup_rename: true,
            ..Default::default()
        });
        let target = DeploymentTarget::new("/srv/app", "t1");

        let report = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap();

        assert!(report.overlaid);
        assert!(report.backup_path.is_none());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(read(&f.host.local_path("/srv/app/version.txt")), "v2");
        assert_eq!(read(&f.host.local_path("/srv/app/extra.txt")), "kept");
        assert!(!f.host.local_path("/srv/app/app").exists());
    }

    #[tokio::test]
    async fn leftover_staging_is_reported_when_overlay_fails() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        f.host.set_faults(Faults {
            fail_backup_rename: true,
            fail_extract: true,
            fail_staging_removal: true,
            ..Default::default()
        });
        let target = DeploymentTarget::new("/srv/app", "t1");

        let failure = installer(None)
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap_err();

        assert!(matches!(failure.rollback, Some(RollbackOutcome::Failed { .. })));
        assert!(
            failure
                .warnings
                .iter()
                .any(|w| w.contains(&target.staging_path) && w.contains("Permission denied")),
            "{:?}",
            failure.warnings
        );
        assert!(f.host.local_path(&target.staging_path).exists());
        assert_eq!(read(&f.host.local_path("/srv/app/version.txt")), "v1");
    }

    #[tokio::test]
    async fn retention_keeps_newest_backups() {
        let f = fixture("v2").await;
        seed_existing(&f.host, "v1");
        for ts in ["20260101_000000_000", "20260201_000000_000", "20260301_000000_000"] {
            fs::create_dir_all(f.host.local_path(&format!("/srv/app.backup.{}", ts))).unwrap();
        }
        let target = DeploymentTarget::new("/srv/app", "20261015_000000_000");

        let report = installer(Some(2))
            .deploy(f.session.as_ref(), &f.archive, &target)
            .await
            .unwrap();

        assert_eq!(
            report.pruned,
            vec![
                "/srv/app.backup.20260101_000000_000".to_string(),
                "/srv/app.backup.20260201_000000_000".to_string(),
            ]
        );
        assert!(f.host.local_path("/srv/app.backup.20260301_000000_000").exists());
        assert!(f.host.local_path("/srv/app.backup.20261015_000000_000").exists());
    }

    #[tokio::test]
    async fn plan_lists_swap_commands() {
        let target = DeploymentTarget::new("/srv/app", "t1");
        let archive = RemoteArchive {
            path: "/tmp/app_t1.tar.gz".to_string(),
            format: ArchiveFormat::TarGz,
            root_name: "app".to_string(),
            source_kind: SourceKind::Directory,
        };
        let plan = installer(Some(3)).plan(&archive, &target);

        assert_eq!(plan[0], "mkdir -p -- /srv");
        assert_eq!(plan[1], "test -e /srv/app && mv -- /srv/app /srv/app.backup.t1");
        assert!(plan[2].contains("tar -xzf /tmp/app_t1.tar.gz -C /srv/.app.staging.t1"));
        assert!(plan[2].contains("mv -- /srv/.app.staging.t1/app /srv/app"));
        assert!(plan[3].starts_with("on failure: rm -rf -- /srv/app"));
        assert_eq!(plan.len(), 5);
    }
}
