use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Credentials;
use crate::local::{CopyStats, backup_destination, backup_timestamp, copy_tree};
use crate::packages::PackageRef;
use crate::progress::{ProgressSink, TaskProgress};
use crate::remote::{
    RepositoryHost, RepositoryStatus, authenticated_repository_url, repository_url,
};
use crate::vcs::{GitBackend, identity_email};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Local,
    Remote,
    Both,
}

impl BackupMode {
    pub fn includes_local(self) -> bool {
        matches!(self, Self::Local | Self::Both)
    }

    pub fn includes_remote(self) -> bool {
        matches!(self, Self::Remote | Self::Both)
    }
}

impl FromStr for BackupMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "remote" | "github" => Ok(Self::Remote),
            "both" => Ok(Self::Both),
            other => Err(Error::InvalidConfig {
                message: format!("unknown backup mode: {other} (expected local, remote or both)"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub package: PackageRef,
    pub mode: BackupMode,
    pub local_destination: Option<PathBuf>,
    pub backup_name: String,
    pub repository_name: String,
    pub branch_name: String,
    pub commit_message: String,
}

impl BackupRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.package.source_path.is_dir() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "package source must be an existing directory: {}",
                    self.package.source_path.display()
                ),
            });
        }

        if self.mode.includes_local() {
            if self.backup_name.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: "backup name must not be empty".to_string(),
                });
            }
            if contains_path_separator(&self.backup_name) {
                return Err(Error::InvalidConfig {
                    message: "backup name must not contain path separators".to_string(),
                });
            }
            let Some(destination) = &self.local_destination else {
                return Err(Error::InvalidConfig {
                    message: "local backup requires a destination".to_string(),
                });
            };
            if is_within(destination, &self.package.source_path) {
                return Err(Error::InvalidConfig {
                    message: "destination must not be inside the package source".to_string(),
                });
            }
        }

        if self.mode.includes_remote() {
            if self.repository_name.trim().is_empty()
                || self.repository_name.contains(char::is_whitespace)
                || contains_path_separator(&self.repository_name)
            {
                return Err(Error::InvalidConfig {
                    message: "repository name must be a single non-empty path segment"
                        .to_string(),
                });
            }
            if self.branch_name.trim().is_empty() || self.branch_name.contains(char::is_whitespace)
            {
                return Err(Error::InvalidConfig {
                    message: "branch name must be non-empty and contain no whitespace"
                        .to_string(),
                });
            }
            if self.commit_message.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: "commit message must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackupState {
    Idle,
    CopyingLocal,
    EnsuringRemote,
    InitializingRepo,
    Pushing,
    Complete,
    Failed,
    PartialSuccess,
}

impl BackupState {
    pub fn phase(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CopyingLocal => "copy",
            Self::EnsuringRemote => "ensure_remote",
            Self::InitializingRepo => "init_repo",
            Self::Pushing => "push",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::PartialSuccess => "partial_success",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::PartialSuccess)
    }

    fn fraction(self, mode: BackupMode) -> f32 {
        if self.is_terminal() {
            return 1.0;
        }
        match (mode, self) {
            (_, Self::Idle) => 0.0,
            (BackupMode::Local, Self::CopyingLocal) => 0.3,
            (BackupMode::Remote, Self::EnsuringRemote) => 0.2,
            (BackupMode::Remote, Self::InitializingRepo) => 0.4,
            (BackupMode::Both, Self::CopyingLocal) => 0.1,
            (BackupMode::Both, Self::EnsuringRemote) => 0.5,
            (BackupMode::Both, Self::InitializingRepo) => 0.6,
            (_, Self::Pushing) => 0.8,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupLeg {
    Local,
    Remote,
}

#[derive(Debug)]
pub struct LegFailure {
    pub leg: BackupLeg,
    pub error: Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTarget {
    pub owner: String,
    pub repository: String,
    pub branch: String,
    pub repository_status: RepositoryStatus,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub state: BackupState,
    pub local_path: Option<PathBuf>,
    pub local_stats: Option<CopyStats>,
    pub remote: Option<RemoteTarget>,
    pub partial_failure: bool,
    pub errors: Vec<LegFailure>,
}

impl BackupOutcome {
    fn new() -> Self {
        Self {
            state: BackupState::Idle,
            local_path: None,
            local_stats: None,
            remote: None,
            partial_failure: false,
            errors: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == BackupState::Complete
    }

    pub fn error_for(&self, leg: BackupLeg) -> Option<&Error> {
        self.errors.iter().find(|f| f.leg == leg).map(|f| &f.error)
    }
}

#[derive(Default)]
pub struct BackupOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a dyn ProgressSink>,
    /// Overrides the `%Y-%m-%d-%H-%M` timestamp taken at the start of the run.
    pub timestamp: Option<String>,
}

#[derive(Debug)]
pub enum BackupEvent {
    Progress(TaskProgress),
    Finished(BackupOutcome),
}

pub struct BackupHandle {
    pub events: mpsc::UnboundedReceiver<BackupEvent>,
    pub cancel: CancellationToken,
}

struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<BackupEvent>,
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, progress: TaskProgress) {
        let _ = self.tx.send(BackupEvent::Progress(progress));
    }
}

struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl FlightGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> Result<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyRunning)?;
        Ok(Self {
            busy: Arc::clone(busy),
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

struct Reporter<'a> {
    mode: BackupMode,
    sink: Option<&'a dyn ProgressSink>,
}

impl Reporter<'_> {
    fn emit(&self, state: BackupState, message: &str) {
        debug!(
            event = "backup.state",
            phase = state.phase(),
            status = message,
            "backup.state"
        );
        if let Some(sink) = self.sink {
            sink.on_progress(TaskProgress {
                phase: state.phase().to_string(),
                fraction: state.fraction(self.mode),
                message: message.to_string(),
            });
        }
    }
}

/// Drives one backup at a time: local copy, then repository ensure, commit and
/// push. A second request while one is in flight fails with
/// [`Error::AlreadyRunning`].
pub struct BackupOrchestrator<H, G> {
    host: H,
    git: G,
    credentials: Credentials,
    git_host: String,
    busy: Arc<AtomicBool>,
}

impl<H: RepositoryHost, G: GitBackend> BackupOrchestrator<H, G> {
    pub fn new(host: H, git: G, credentials: Credentials, git_host: impl Into<String>) -> Self {
        Self {
            host,
            git,
            credentials,
            git_host: git_host.into(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn test_connection(&self) -> bool {
        if !self.credentials.is_configured() {
            return false;
        }
        self.host.test_auth().await
    }

    pub async fn run_backup(&self, request: BackupRequest) -> Result<BackupOutcome> {
        self.run_backup_with(request, BackupOptions::default()).await
    }

    pub async fn run_backup_with(
        &self,
        request: BackupRequest,
        options: BackupOptions<'_>,
    ) -> Result<BackupOutcome> {
        let _guard = FlightGuard::acquire(&self.busy)?;
        request.validate()?;
        Ok(self.execute(&request, &options).await)
    }

    /// Starts the backup on the tokio runtime and returns a stream of progress
    /// events that ends with [`BackupEvent::Finished`].
    pub fn begin_backup(self: &Arc<Self>, request: BackupRequest) -> Result<BackupHandle>
    where
        H: 'static,
        G: 'static,
    {
        self.begin_backup_at(request, None)
    }

    /// [`BackupOrchestrator::begin_backup`] with the run timestamp supplied by
    /// the caller, so names built before the run can share it.
    pub fn begin_backup_at(
        self: &Arc<Self>,
        request: BackupRequest,
        timestamp: Option<String>,
    ) -> Result<BackupHandle>
    where
        H: 'static,
        G: 'static,
    {
        let guard = FlightGuard::acquire(&self.busy)?;
        request.validate()?;

        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let _guard = guard;
            let sink = ChannelProgressSink { tx: tx.clone() };
            let options = BackupOptions {
                cancel: Some(&task_cancel),
                progress: Some(&sink),
                timestamp,
            };
            let outcome = orchestrator.execute(&request, &options).await;
            let _ = tx.send(BackupEvent::Finished(outcome));
        });

        Ok(BackupHandle { events, cancel })
    }

    async fn execute(&self, request: &BackupRequest, options: &BackupOptions<'_>) -> BackupOutcome {
        let timestamp = options.timestamp.clone().unwrap_or_else(backup_timestamp);
        let reporter = Reporter {
            mode: request.mode,
            sink: options.progress,
        };
        let started = Instant::now();
        info!(
            event = "backup.prepare",
            package = %request.package.name,
            source_path = %request.package.source_path.display(),
            mode = ?request.mode,
            timestamp = %timestamp,
            "backup.prepare"
        );

        let mut outcome = BackupOutcome::new();
        reporter.emit(BackupState::Idle, "Preparing backup...");

        if request.mode.includes_local() {
            let local = match check_cancel(options) {
                Ok(()) => {
                    outcome.state = BackupState::CopyingLocal;
                    reporter.emit(BackupState::CopyingLocal, "Copying files...");
                    self.copy_local(request, &timestamp).await
                }
                Err(e) => Err(e),
            };
            match local {
                Ok((path, stats)) => {
                    outcome.local_path = Some(path);
                    outcome.local_stats = Some(stats);
                }
                Err(e) => {
                    error!(
                        event = "backup.local_failed",
                        code = e.code(),
                        error = %e,
                        "backup.local_failed"
                    );
                    outcome.errors.push(LegFailure {
                        leg: BackupLeg::Local,
                        error: e,
                    });
                    return self.finish(outcome, &reporter, started);
                }
            }
        }

        if request.mode.includes_remote() {
            match self
                .remote_leg(request, &timestamp, options, &reporter, &mut outcome)
                .await
            {
                Ok(target) => outcome.remote = Some(target),
                Err(e) => {
                    error!(
                        event = "backup.remote_failed",
                        code = e.code(),
                        error = %e,
                        local_completed = outcome.local_path.is_some(),
                        "backup.remote_failed"
                    );
                    outcome.errors.push(LegFailure {
                        leg: BackupLeg::Remote,
                        error: e,
                    });
                }
            }
        }

        self.finish(outcome, &reporter, started)
    }

    async fn copy_local(
        &self,
        request: &BackupRequest,
        timestamp: &str,
    ) -> Result<(PathBuf, CopyStats)> {
        let destination = request
            .local_destination
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig {
                message: "local backup requires a destination".to_string(),
            })?;
        let dest = backup_destination(destination, &request.backup_name, timestamp);

        let phase_started = Instant::now();
        debug!(event = "phase.start", phase = "copy", dest = %dest.display(), "phase.start");

        let source = request.package.source_path.clone();
        let target = dest.clone();
        let stats = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| Error::Copy {
                message: format!("copy task failed: {e}"),
            })??;

        debug!(
            event = "phase.finish",
            phase = "copy",
            duration_ms = phase_started.elapsed().as_millis() as u64,
            files = stats.files,
            bytes = stats.bytes,
            "phase.finish"
        );
        Ok((dest, stats))
    }

    async fn remote_leg(
        &self,
        request: &BackupRequest,
        timestamp: &str,
        options: &BackupOptions<'_>,
        reporter: &Reporter<'_>,
        outcome: &mut BackupOutcome,
    ) -> Result<RemoteTarget> {
        if !self.credentials.is_configured() {
            return Err(Error::NotConfigured);
        }

        let owner = self.host.owner().to_string();
        let repository = request.repository_name.as_str();
        let repo_dir = request.package.source_path.as_path();
        let branch = remote_branch_name(&request.branch_name, timestamp);
        let message = commit_message(&request.commit_message, timestamp);

        check_cancel(options)?;
        outcome.state = BackupState::EnsuringRemote;
        reporter.emit(BackupState::EnsuringRemote, "Checking/creating repository...");
        let repository_status = self.host.ensure_repository(repository).await?;

        check_cancel(options)?;
        outcome.state = BackupState::InitializingRepo;
        reporter.emit(
            BackupState::InitializingRepo,
            "Creating local git repository...",
        );
        let clean_url = repository_url(&self.git_host, &owner, repository);
        let username = self.credentials.username.as_str();
        self.git.init_or_verify(repo_dir, &clean_url).await?;
        self.git
            .configure_identity(repo_dir, username, &identity_email(username))
            .await?;
        self.git
            .branch_and_commit(repo_dir, &branch, &message)
            .await?;

        check_cancel(options)?;
        outcome.state = BackupState::Pushing;
        reporter.emit(BackupState::Pushing, "Pushing to GitHub...");
        let push_url =
            authenticated_repository_url(&self.git_host, &self.credentials.token, &owner, repository);
        let pushed = match self.git.repoint_remote(repo_dir, &push_url).await {
            Ok(()) => self.git.push(repo_dir, &branch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = self.git.repoint_remote(repo_dir, &clean_url).await {
            warn!(
                event = "git.remote_reset_failed",
                repo_dir = %repo_dir.display(),
                error = %e,
                "git.remote_reset_failed"
            );
        }
        pushed?;

        info!(
            event = "backup.pushed",
            owner = %owner,
            repository,
            branch = %branch,
            "backup.pushed"
        );
        Ok(RemoteTarget {
            owner,
            repository: repository.to_string(),
            branch,
            repository_status,
        })
    }

    fn finish(
        &self,
        mut outcome: BackupOutcome,
        reporter: &Reporter<'_>,
        started: Instant,
    ) -> BackupOutcome {
        outcome.state = if outcome.errors.is_empty() {
            BackupState::Complete
        } else if outcome.local_path.is_some() {
            BackupState::PartialSuccess
        } else {
            BackupState::Failed
        };
        outcome.partial_failure = outcome.state == BackupState::PartialSuccess;

        let message = match outcome.state {
            BackupState::Complete => "Complete!",
            BackupState::PartialSuccess => "Local backup saved, remote backup failed",
            _ => "Backup failed",
        };
        reporter.emit(outcome.state, message);

        info!(
            event = "backup.finish",
            state = outcome.state.phase(),
            errors = outcome.errors.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "backup.finish"
        );
        outcome
    }
}

pub fn remote_branch_name(branch_name: &str, timestamp: &str) -> String {
    format!("backup/{branch_name}_{timestamp}")
}

pub fn commit_message(message: &str, timestamp: &str) -> String {
    format!("{message} - {timestamp}")
}

/// Message used when the caller leaves it blank.
pub fn default_commit_message(timestamp: &str) -> String {
    format!("Backup: {timestamp}")
}

fn check_cancel(options: &BackupOptions<'_>) -> Result<()> {
    if let Some(cancel) = options.cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn contains_path_separator(s: &str) -> bool {
    s.contains(['/', '\\']) || s == "." || s == ".."
}

fn is_within(path: &Path, root: &Path) -> bool {
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(p), Ok(r)) => p.starts_with(r),
        _ => path.starts_with(root),
    }
}
