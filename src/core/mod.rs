pub mod archiver;
pub mod installer;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod verifier;

pub use archiver::Archiver;
pub use installer::{InstallReport, Installer, RemoteArchive};
pub use lock::TargetLocks;
pub use models::{PipelineResult, RollbackOutcome, Stage, TargetRecord};
pub use orchestrator::{DeployRequest, Orchestrator, PipelineSettings};
pub use verifier::{Verification, verify};
