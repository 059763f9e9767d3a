pub mod config;
mod error;
pub mod local;
mod orchestrator;
pub mod packages;
pub mod process;
mod progress;
pub mod remote;
pub mod run_log;
pub mod vcs;

pub const APP_NAME: &str = "PackageBackup";

pub use config::{Credentials, Settings};
pub use error::{Error, Result};
pub use local::CopyStats;
pub use orchestrator::{
    BackupEvent, BackupHandle, BackupLeg, BackupMode, BackupOptions, BackupOrchestrator,
    BackupOutcome, BackupRequest, BackupState, LegFailure, RemoteTarget, commit_message,
    default_commit_message, remote_branch_name,
};
pub use packages::PackageRef;
pub use process::{
    CommandRunner, GitCandidate, GitExecutable, ProcessResult, ProcessRunner,
    ScriptedCommandRunner, default_git_candidates, locate_git,
};
pub use progress::{ProgressSink, TaskProgress};
pub use remote::{
    GitHubClient, GitHubClientConfig, InMemoryRepositoryHost, RecordingSettle, RepositoryHost,
    RepositoryStatus, Settle, TokioSettle,
};
pub use vcs::{GitBackend, ShellGit};
