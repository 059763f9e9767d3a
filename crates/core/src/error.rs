use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("github is not configured (username and token are required)")]
    NotConfigured,

    #[error("{message}")]
    ExecutableNotFound { message: String },

    #[error("git {command} failed (exit code {exit_code}): {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("repository check/creation failed: {message}")]
    Repository { message: String },

    #[error("local backup failed: {message}")]
    Copy { message: String },

    #[error("github authentication failed: {message}")]
    Auth { message: String },

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("a backup is already in progress")]
    AlreadyRunning,

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "io.failed",
            Self::Walkdir(_) => "io.walk_failed",
            Self::NotConfigured => "config.not_configured",
            Self::ExecutableNotFound { .. } => "git.not_found",
            Self::Command { .. } => "git.command_failed",
            Self::Repository { .. } => "remote.repository_failed",
            Self::Copy { .. } => "local.copy_failed",
            Self::Auth { .. } => "remote.unauthorized",
            Self::Timeout { .. } => "task.timeout",
            Self::AlreadyRunning => "task.already_running",
            Self::Cancelled => "task.cancelled",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Repository { .. } | Self::Timeout { .. } | Self::AlreadyRunning
        )
    }
}
