use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use package_backup_core::config::{load_credentials, load_settings, save_credentials};
use package_backup_core::local::backup_timestamp;
use package_backup_core::packages::{
    default_repository_name, directory_size, format_bytes, list_packages,
};
use package_backup_core::run_log::{RunKind, start_run_log};
use package_backup_core::{
    APP_NAME, BackupEvent, BackupLeg, BackupMode, BackupOrchestrator, BackupOutcome,
    BackupRequest, BackupState, CommandRunner, Credentials, GitExecutable, GitHubClient,
    GitHubClientConfig, ProcessRunner, ProgressSink, RepositoryHost, Settings, ShellGit,
    TaskProgress, default_commit_message, default_git_candidates, locate_git,
};

#[derive(Parser)]
#[command(name = "pkgbackup")]
#[command(about = "Back up cached packages to a local folder and/or GitHub", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    project_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Packages {
        #[command(subcommand)]
        cmd: PackagesCmd,
    },
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    Connection {
        #[command(subcommand)]
        cmd: ConnectionCmd,
    },
    Git {
        #[command(subcommand)]
        cmd: GitCmd,
    },
    Backup {
        #[command(subcommand)]
        cmd: BackupCmd,
    },
}

#[derive(Subcommand)]
enum PackagesCmd {
    List,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Get,
    /// Saves credentials; the token is read from stdin.
    Set {
        #[arg(long)]
        username: String,
        /// Stored and shown by `config get` only. Backup branches are named
        /// from `backup run --branch`, which defaults to the backup name.
        #[arg(long)]
        default_branch: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectionCmd {
    Test,
}

#[derive(Subcommand)]
enum GitCmd {
    Version,
}

#[derive(Subcommand)]
enum BackupCmd {
    Run {
        #[arg(long)]
        package: String,
        #[arg(long, default_value = "both")]
        mode: String,
        #[arg(long)]
        destination: Option<PathBuf>,
        /// Backup folder prefix; defaults to the package name.
        #[arg(long)]
        name: Option<String>,
        /// Defaults to `{package}-backup`.
        #[arg(long)]
        repository: Option<String>,
        /// Defaults to the backup name.
        #[arg(long)]
        branch: Option<String>,
        /// Defaults to `Backup: {timestamp}`.
        #[arg(long)]
        message: Option<String>,
    },
}

#[derive(Debug, serde::Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }
}

struct NdjsonProgressSink {
    task_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: TaskProgress) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "phase": p.phase,
            "fraction": p.fraction,
            "message": p.message,
        });
        println!("{line}");
    }
}

const EXIT_PARTIAL_SUCCESS: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let project_dir = cli
        .project_dir
        .or_else(|| {
            std::env::var("PKGBACKUP_PROJECT_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_project_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("PKGBACKUP_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| default_data_dir(&project_dir));

    match cli.cmd {
        Command::Packages { cmd } => match cmd {
            PackagesCmd::List => packages_list(&project_dir, cli.json).await.map(|()| 0),
        },
        Command::Config { cmd } => match cmd {
            ConfigCmd::Get => config_get(&project_dir, cli.json).await.map(|()| 0),
            ConfigCmd::Set {
                username,
                default_branch,
            } => config_set(&project_dir, username, default_branch, cli.json)
                .await
                .map(|()| 0),
        },
        Command::Connection { cmd } => match cmd {
            ConnectionCmd::Test => connection_test(&project_dir, &data_dir, cli.json)
                .await
                .map(|()| 0),
        },
        Command::Git { cmd } => match cmd {
            GitCmd::Version => git_version(cli.json).await.map(|()| 0),
        },
        Command::Backup { cmd } => match cmd {
            BackupCmd::Run {
                package,
                mode,
                destination,
                name,
                repository,
                branch,
                message,
            } => {
                backup_run(
                    &project_dir,
                    &data_dir,
                    BackupArgs {
                        package,
                        mode,
                        destination,
                        name,
                        repository,
                        branch,
                        message,
                    },
                    cli.json,
                    cli.events,
                )
                .await
            }
        },
    }
}

async fn packages_list(project_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(project_dir).map_err(map_core_err)?;
    let cache_dir = project_dir.join(&settings.package_cache_dir);
    let packages = list_packages(&cache_dir).map_err(map_core_err)?;

    if json {
        let items: Vec<serde_json::Value> = packages
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "sourcePath": p.source_path,
                    "sizeBytes": directory_size(&p.source_path).ok(),
                    "defaultRepository": default_repository_name(Some(p)),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({ "cacheDir": cache_dir, "packages": items })
        );
    } else if packages.is_empty() {
        println!("no packages found in {}", cache_dir.display());
    } else {
        for p in &packages {
            let size = directory_size(&p.source_path)
                .map(format_bytes)
                .unwrap_or_else(|_| "?".to_string());
            println!("{}\t{size}", p.name);
        }
    }
    Ok(())
}

async fn config_get(project_dir: &Path, json: bool) -> Result<(), CliError> {
    let creds = load_credentials(project_dir).map_err(map_core_err)?;
    let settings = load_settings(project_dir).map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "credentials": {
                    "username": creds.username,
                    "tokenPresent": !creds.token.is_empty(),
                    "defaultBranch": creds.default_branch,
                    "configured": creds.is_configured(),
                },
                "settings": settings,
            })
        );
    } else {
        println!("username={}", creds.username);
        println!("tokenPresent={}", !creds.token.is_empty());
        println!("defaultBranch={}", creds.default_branch);
        println!("configured={}", creds.is_configured());
    }
    Ok(())
}

async fn config_set(
    project_dir: &Path,
    username: String,
    default_branch: Option<String>,
    json: bool,
) -> Result<(), CliError> {
    let existing = load_credentials(project_dir).map_err(map_core_err)?;

    let mut token = String::new();
    std::io::stdin()
        .read_to_string(&mut token)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let token = match token.trim() {
        "" => existing.token,
        t => t.to_string(),
    };

    let creds = Credentials {
        username: username.trim().to_string(),
        token,
        default_branch: default_branch
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or(existing.default_branch),
    };
    save_credentials(project_dir, &creds).map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "configured": creds.is_configured() })
        );
    } else {
        println!("ok");
    }
    Ok(())
}

async fn connection_test(project_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(project_dir).map_err(map_core_err)?;
    let creds = load_credentials(project_dir).map_err(map_core_err)?;
    if !creds.is_configured() {
        return Err(map_core_err(package_backup_core::Error::NotConfigured));
    }

    let run_id = format!("con_{}", uuid::Uuid::new_v4());
    let _log = start_run_log(RunKind::ConnectionTest, &run_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;

    let client = github_client(&settings, &creds)?;
    let ok = client.test_auth().await;
    tracing::info!(event = "run.finish", kind = "connection-test", ok, "run.finish");
    if !ok {
        return Err(map_core_err(package_backup_core::Error::Auth {
            message: format!(
                "{} rejected the token for {} or was unreachable",
                settings.api_base_url, creds.username
            ),
        }));
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "ok": true, "username": creds.username })
        );
    } else {
        println!("Connection successful! Authenticated as {}", creds.username);
    }
    Ok(())
}

async fn git_version(json: bool) -> Result<(), CliError> {
    let git = locate_git(&default_git_candidates())
        .await
        .map_err(map_core_err)?;
    let runner = ProcessRunner::new(git.clone(), Duration::from_secs(30));
    let version = runner.version().await;

    if json {
        println!(
            "{}",
            serde_json::json!({ "path": git.path(), "version": version })
        );
    } else {
        println!("{version}");
        println!("path={}", git.path().display());
    }
    Ok(())
}

struct BackupArgs {
    package: String,
    mode: String,
    destination: Option<PathBuf>,
    name: Option<String>,
    repository: Option<String>,
    branch: Option<String>,
    message: Option<String>,
}

async fn backup_run(
    project_dir: &Path,
    data_dir: &Path,
    args: BackupArgs,
    json: bool,
    events: bool,
) -> Result<i32, CliError> {
    let settings = load_settings(project_dir).map_err(map_core_err)?;
    let creds = load_credentials(project_dir).map_err(map_core_err)?;
    let mode: BackupMode = args.mode.parse().map_err(map_core_err)?;

    let cache_dir = project_dir.join(&settings.package_cache_dir);
    let package = list_packages(&cache_dir)
        .map_err(map_core_err)?
        .into_iter()
        .find(|p| p.name == args.package)
        .ok_or_else(|| {
            CliError::new(
                "config.invalid",
                format!("package not found in {}: {}", cache_dir.display(), args.package),
            )
        })?;

    let backup_name = args.name.unwrap_or_else(|| package.name.clone());
    let timestamp = backup_timestamp();
    let request = BackupRequest {
        mode,
        local_destination: args.destination,
        repository_name: args
            .repository
            .unwrap_or_else(|| default_repository_name(Some(&package))),
        branch_name: args.branch.unwrap_or_else(|| backup_name.clone()),
        commit_message: args
            .message
            .unwrap_or_else(|| default_commit_message(&timestamp)),
        backup_name,
        package,
    };

    // Local-only runs never shell out, so a missing git is not an error there.
    let git = if mode.includes_remote() {
        locate_git(&default_git_candidates())
            .await
            .map_err(map_core_err)?
    } else {
        GitExecutable::new("git")
    };
    let orchestrator = Arc::new(BackupOrchestrator::new(
        github_client(&settings, &creds)?,
        ShellGit::new(ProcessRunner::new(git, settings.command_timeout())),
        creds,
        settings.git_host.clone(),
    ));

    let task_id = format!("tsk_{}", uuid::Uuid::new_v4());
    let _log = start_run_log(RunKind::Backup, &task_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    tracing::info!(
        event = "run.start",
        kind = "backup",
        run_id = %task_id,
        package = %request.package.name,
        "run.start"
    );

    let mut handle = orchestrator
        .begin_backup_at(request, Some(timestamp))
        .map_err(map_core_err)?;
    if events {
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "backup",
                "state": "running"
            })
        );
    }

    let sink = NdjsonProgressSink {
        task_id: task_id.clone(),
    };
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;
    let outcome = loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(BackupEvent::Progress(p)) => {
                    if events {
                        sink.on_progress(p);
                    }
                }
                Some(BackupEvent::Finished(outcome)) => break outcome,
                None => {
                    return Err(CliError::new(
                        "task.failed",
                        "backup task ended without an outcome",
                    ));
                }
            },
            _ = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                tracing::warn!(event = "run.cancel_requested", run_id = %task_id, "run.cancel_requested");
                handle.cancel.cancel();
            }
        }
    };

    tracing::info!(
        event = "run.finish",
        kind = "backup",
        run_id = %task_id,
        state = outcome.state.phase(),
        "run.finish"
    );
    report_outcome(&task_id, &outcome, json, events)?;

    match outcome.state {
        BackupState::Complete => Ok(0),
        BackupState::PartialSuccess => {
            if let Some(e) = outcome.error_for(BackupLeg::Remote) {
                emit_error(&core_err_details(e));
            }
            Ok(EXIT_PARTIAL_SUCCESS)
        }
        _ => {
            let first = outcome
                .errors
                .into_iter()
                .next()
                .map(|f| map_core_err(f.error))
                .unwrap_or_else(|| CliError::new("task.failed", "backup failed"));
            Err(first)
        }
    }
}

fn report_outcome(
    task_id: &str,
    outcome: &BackupOutcome,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let summary = serde_json::json!({
        "state": outcome.state,
        "localPath": outcome.local_path,
        "localStats": outcome.local_stats.as_ref().map(|s| serde_json::json!({
            "files": s.files,
            "dirs": s.dirs,
            "bytes": s.bytes,
        })),
        "remote": outcome.remote,
        "partialFailure": outcome.partial_failure,
        "errors": outcome.errors.iter().map(|f| serde_json::json!({
            "leg": f.leg,
            "code": f.error.code(),
            "message": f.error.to_string(),
        })).collect::<Vec<_>>(),
    });

    if events {
        let state = match outcome.state {
            BackupState::Complete => "succeeded",
            BackupState::PartialSuccess => "partial",
            _ => "failed",
        };
        println!(
            "{}",
            serde_json::json!({
                "type": "task.state",
                "taskId": task_id,
                "kind": "backup",
                "state": state,
                "result": summary,
            })
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&summary)
                .map_err(|e| CliError::new("task.failed", e.to_string()))?
        );
        return Ok(());
    }

    if let Some(path) = &outcome.local_path {
        println!("localPath={}", path.display());
    }
    if let Some(stats) = &outcome.local_stats {
        println!(
            "filesCopied={} bytesCopied={}",
            stats.files,
            format_bytes(stats.bytes)
        );
    }
    if let Some(remote) = &outcome.remote {
        println!(
            "remote={}/{} branch={}",
            remote.owner, remote.repository, remote.branch
        );
    }
    println!("state={}", outcome.state.phase());
    Ok(())
}

fn github_client(settings: &Settings, creds: &Credentials) -> Result<GitHubClient, CliError> {
    GitHubClient::new(GitHubClientConfig::from_settings(settings, creds)).map_err(map_core_err)
}

fn default_project_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_data_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(format!(".{}", APP_NAME.to_ascii_lowercase()))
}

fn core_err_details(e: &package_backup_core::Error) -> CliError {
    let details = match e {
        package_backup_core::Error::Command {
            command, exit_code, ..
        } => serde_json::json!({ "command": command, "exitCode": exit_code }),
        package_backup_core::Error::Timeout { operation, after } => {
            serde_json::json!({ "operation": operation, "afterSecs": after.as_secs() })
        }
        _ => serde_json::json!({}),
    };
    CliError {
        code: e.code(),
        message: e.to_string(),
        details,
        retryable: e.retryable(),
    }
}

fn map_core_err(e: package_backup_core::Error) -> CliError {
    core_err_details(&e)
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
