//! Locating the `git` executable and running it against a working directory.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Error, Result};

const GIT_NOT_FOUND_MESSAGE: &str = "Git not found! Please install Git or add it to your system PATH.\n\n\
     Download Git from: https://git-scm.com/downloads\n\n\
     After installation, restart the tool.";

pub const UNKNOWN_VERSION: &str = "unknown";

/// A resolved `git` executable. Resolve once with [`locate_git`] and pass the
/// value to whatever runs commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitExecutable {
    path: PathBuf,
}

impl GitExecutable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCandidate {
    /// A program name resolved through `PATH`; accepted when `--version` exits 0.
    OnPath(String),
    /// An absolute install location; accepted when the file exists.
    File(PathBuf),
}

pub fn default_git_candidates() -> Vec<GitCandidate> {
    let mut candidates = vec![GitCandidate::OnPath("git".to_string())];

    #[cfg(windows)]
    {
        for dir in [
            r"C:\Program Files\Git\bin",
            r"C:\Program Files (x86)\Git\bin",
            r"C:\Program Files\Git\cmd",
            r"C:\Program Files (x86)\Git\cmd",
        ] {
            candidates.push(GitCandidate::File(Path::new(dir).join("git.exe")));
        }
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            let programs = Path::new(&local).join("Programs").join("Git");
            candidates.push(GitCandidate::File(programs.join("bin").join("git.exe")));
            candidates.push(GitCandidate::File(programs.join("cmd").join("git.exe")));
        }
    }

    #[cfg(not(windows))]
    {
        for path in ["/usr/bin/git", "/usr/local/bin/git", "/opt/homebrew/bin/git"] {
            candidates.push(GitCandidate::File(PathBuf::from(path)));
        }
    }

    candidates
}

/// Tries `candidates` in order and returns the first usable executable.
pub async fn locate_git(candidates: &[GitCandidate]) -> Result<GitExecutable> {
    for candidate in candidates {
        match candidate {
            GitCandidate::OnPath(program) => {
                let status = Command::new(program)
                    .arg("--version")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                match status {
                    Ok(status) if status.success() => {
                        debug!(event = "git.located", path = %program, "git.located");
                        return Ok(GitExecutable::new(program));
                    }
                    Ok(status) => {
                        debug!(event = "git.candidate_failed", path = %program, %status, "git.candidate_failed");
                    }
                    Err(e) => {
                        debug!(event = "git.candidate_failed", path = %program, error = %e, "git.candidate_failed");
                    }
                }
            }
            GitCandidate::File(path) => {
                if path.is_file() {
                    debug!(event = "git.located", path = %path.display(), "git.located");
                    return Ok(GitExecutable::new(path));
                }
            }
        }
    }

    Err(Error::ExecutableNotFound {
        message: GIT_NOT_FOUND_MESSAGE.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Spawns `git <args>` in `working_dir` and captures its output. Only
    /// spawn/timeout problems are errors here; see [`CommandRunner::run`].
    fn execute<'a>(
        &'a self,
        working_dir: &'a Path,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>>;

    fn run<'a>(
        &'a self,
        working_dir: &'a Path,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.execute(working_dir, args).await?;
            check_result(args, result)
        })
    }

    fn version<'a>(&'a self) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        Box::pin(async move {
            let args = ["--version".to_string()];
            match self.run(Path::new("."), &args).await {
                Ok(r) if !r.stdout.trim().is_empty() => r.stdout.trim().to_string(),
                _ => UNKNOWN_VERSION.to_string(),
            }
        })
    }
}

/// Non-zero exit with stderr output is a failure. Zero exit is success even
/// when stderr is non-empty; git reports progress there.
pub fn check_result(args: &[String], result: ProcessResult) -> Result<ProcessResult> {
    if result.exit_code != 0 {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            return Err(Error::Command {
                command: redact_args(args).join(" "),
                exit_code: result.exit_code,
                stderr: stderr.to_string(),
            });
        }
        warn!(
            event = "git.nonzero_exit_without_stderr",
            command = %subcommand(args),
            exit_code = result.exit_code,
            "git.nonzero_exit_without_stderr"
        );
    }
    Ok(result)
}

pub struct ProcessRunner {
    git: GitExecutable,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(git: GitExecutable, timeout: Duration) -> Self {
        Self { git, timeout }
    }

    pub fn git(&self) -> &GitExecutable {
        &self.git
    }
}

impl CommandRunner for ProcessRunner {
    fn execute<'a>(
        &'a self,
        working_dir: &'a Path,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = Command::new(self.git.path());
            cmd.args(args)
                .current_dir(working_dir)
                .env("GIT_TERMINAL_PROMPT", "0")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let started = Instant::now();
            let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
                Ok(output) => output.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::ExecutableNotFound {
                            message: GIT_NOT_FOUND_MESSAGE.to_string(),
                        }
                    } else {
                        Error::Io(e)
                    }
                })?,
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: format!("git {}", subcommand(args)),
                        after: self.timeout,
                    });
                }
            };

            let result = ProcessResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            debug!(
                event = "git.command",
                args = %redact_args(args).join(" "),
                working_dir = %working_dir.display(),
                exit_code = result.exit_code,
                duration_ms = started.elapsed().as_millis() as u64,
                "git.command"
            );
            Ok(result)
        })
    }
}

/// Test double that answers each git subcommand with a canned result and
/// records every invocation. Unscripted subcommands succeed with no output.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    pub executed: AtomicUsize,
    responses: Mutex<HashMap<String, ProcessResult>>,
    invocations: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn respond(&self, subcommand: &str, result: ProcessResult) {
        self.responses
            .lock()
            .await
            .insert(subcommand.to_string(), result);
    }

    pub async fn invocations(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.invocations.lock().await.clone()
    }

    pub async fn subcommands(&self) -> Vec<String> {
        self.invocations
            .lock()
            .await
            .iter()
            .map(|(_, args)| subcommand(args).to_string())
            .collect()
    }
}

impl CommandRunner for ScriptedCommandRunner {
    fn execute<'a>(
        &'a self,
        working_dir: &'a Path,
        args: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>> {
        Box::pin(async move {
            self.invocations
                .lock()
                .await
                .push((working_dir.to_path_buf(), args.to_vec()));
            self.executed.fetch_add(1, Ordering::Relaxed);
            let scripted = self.responses.lock().await.get(subcommand(args)).cloned();
            Ok(scripted.unwrap_or_default())
        })
    }
}

fn subcommand(args: &[String]) -> &str {
    args.first().map(String::as_str).unwrap_or("")
}

pub(crate) fn redact_args(args: &[String]) -> Vec<String> {
    args.iter().map(|a| redact_url(a)).collect()
}

/// Replaces URL userinfo (`https://token@host/...`) with `***`.
pub(crate) fn redact_url(value: &str) -> String {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = value.strip_prefix(scheme) {
            let authority_end = rest.find('/').unwrap_or(rest.len());
            if let Some(at) = rest[..authority_end].rfind('@') {
                return format!("{scheme}***@{}", &rest[at + 1..]);
            }
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn nonzero_exit_with_stderr_is_a_command_error() {
        let err = check_result(
            &args(&["commit", "-m", "msg"]),
            ProcessResult::failed(1, "nothing to commit\n"),
        )
        .unwrap_err();
        match err {
            Error::Command {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "commit -m msg");
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "nothing to commit");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_exit_with_stderr_is_success() {
        let result = ProcessResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: "Switched to a new branch 'backup/x'".to_string(),
        };
        assert!(check_result(&args(&["checkout", "-b", "backup/x"]), result).is_ok());
    }

    #[test]
    fn nonzero_exit_without_stderr_is_tolerated() {
        assert!(check_result(&args(&["add", "."]), ProcessResult::failed(1, "  ")).is_ok());
    }

    #[test]
    fn token_urls_are_redacted() {
        assert_eq!(
            redact_url("https://ghp_abc@github.com/octocat/foo-backup.git"),
            "https://***@github.com/octocat/foo-backup.git"
        );
        assert_eq!(
            redact_url("https://github.com/octocat/foo-backup.git"),
            "https://github.com/octocat/foo-backup.git"
        );
        assert_eq!(redact_url("user@example.com"), "user@example.com");
    }

    #[test]
    fn command_errors_never_carry_the_token() {
        let err = check_result(
            &args(&["remote", "set-url", "origin", "https://ghp_abc@github.com/o/r.git"]),
            ProcessResult::failed(128, "fatal: boom"),
        )
        .unwrap_err();
        assert!(!err.to_string().contains("ghp_abc"));
    }

    #[tokio::test]
    async fn missing_candidates_report_remediation() {
        let err = locate_git(&[
            GitCandidate::OnPath("definitely-not-a-real-git-binary".to_string()),
            GitCandidate::File(PathBuf::from("/nonexistent/git")),
        ])
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound { .. }));
        assert!(err.to_string().contains("git-scm.com"));
    }

    #[tokio::test]
    async fn file_candidate_is_accepted_when_present() {
        let temp = tempfile::tempdir().unwrap();
        let fake = temp.path().join("git");
        std::fs::write(&fake, b"").unwrap();
        let git = locate_git(&[
            GitCandidate::OnPath("definitely-not-a-real-git-binary".to_string()),
            GitCandidate::File(fake.clone()),
        ])
        .await
        .unwrap();
        assert_eq!(git.path(), fake.as_path());
    }

    #[tokio::test]
    async fn version_falls_back_to_unknown() {
        let runner = ScriptedCommandRunner::new();
        runner
            .respond("--version", ProcessResult::failed(1, "boom"))
            .await;
        assert_eq!(runner.version().await, UNKNOWN_VERSION);

        let runner = ScriptedCommandRunner::new();
        runner
            .respond("--version", ProcessResult::ok("git version 2.43.0\n"))
            .await;
        assert_eq!(runner.version().await, "git version 2.43.0");
    }

    #[tokio::test]
    async fn missing_executable_surfaces_as_not_found() {
        let runner = ProcessRunner::new(
            GitExecutable::new("/nonexistent/bin/git"),
            Duration::from_secs(5),
        );
        let temp = tempfile::tempdir().unwrap();
        let err = runner
            .run(temp.path(), &args(&["status"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound { .. }));
        assert_eq!(runner.version().await, UNKNOWN_VERSION);
    }
}
