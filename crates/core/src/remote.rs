use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Credentials, Settings};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RepositoryStatus {
    Exists,
    Created,
}

pub trait RepositoryHost: Send + Sync {
    /// Account that owns backup repositories.
    fn owner(&self) -> &str;

    /// Advisory auth check; never fails, only reports.
    fn test_auth<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Checks for `name` under [`RepositoryHost::owner`] and creates it as a
    /// private, auto-initialized repository when missing.
    fn ensure_repository<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RepositoryStatus>> + Send + 'a>>;
}

/// Waits out provider propagation lag after a repository is created.
pub trait Settle: Send + Sync {
    fn settle<'a>(&'a self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSettle;

impl Settle for TokioSettle {
    fn settle<'a>(&'a self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(delay))
    }
}

/// [`Settle`] that returns at once and records each requested delay.
#[derive(Debug, Default)]
pub struct RecordingSettle {
    pub calls: AtomicUsize,
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSettle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delays(&self) -> Vec<Duration> {
        self.delays.lock().await.clone()
    }
}

impl Settle for RecordingSettle {
    fn settle<'a>(&'a self, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.delays.lock().await.push(delay);
        })
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub api_base_url: String,
    pub username: String,
    pub token: String,
    pub user_agent: String,
    pub repository_description: String,
    pub settle_delay: Duration,
    pub timeout: Duration,
}

impl GitHubClientConfig {
    pub fn from_settings(settings: &Settings, creds: &Credentials) -> Self {
        Self {
            api_base_url: settings.api_base_url.clone(),
            username: creds.username.clone(),
            token: creds.token.clone(),
            user_agent: settings.user_agent.clone(),
            repository_description: settings.repository_description.clone(),
            settle_delay: settings.settle_delay(),
            timeout: settings.http_timeout(),
        }
    }
}

/// REST client for the GitHub API. Headers, including the token, are fixed
/// when the client is built; a new token means a new client.
pub struct GitHubClient {
    api_base_url: String,
    owner: String,
    repository_description: String,
    settle_delay: Duration,
    settle: Arc<dyn Settle>,
    timeout: Duration,
    client: reqwest::Client,
}

impl GitHubClient {
    pub fn new(config: GitHubClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {}", config.token)).map_err(|_| {
            Error::InvalidConfig {
                message: "token contains characters not allowed in a header".to_string(),
            }
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).map_err(|_| Error::InvalidConfig {
                message: "user_agent contains characters not allowed in a header".to_string(),
            })?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            owner: config.username,
            repository_description: config.repository_description,
            settle_delay: config.settle_delay,
            settle: Arc::new(TokioSettle),
            timeout: config.timeout,
            client,
        })
    }

    /// Replaces the timer used for the post-creation settle delay.
    pub fn with_settle(mut self, settle: Arc<dyn Settle>) -> Self {
        self.settle = settle;
        self
    }

    fn request_error(&self, operation: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::Timeout {
                operation: operation.to_string(),
                after: self.timeout,
            };
        }
        Error::Repository {
            message: format!("{operation} request failed: {e}"),
        }
    }

    async fn create_repository(&self, name: &str) -> Result<()> {
        let body = serde_json::json!({
            "name": name,
            "description": self.repository_description,
            "private": true,
            "auto_init": true,
        });
        let res = self
            .client
            .post(format!("{}/user/repos", self.api_base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error("repository create", e))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Repository {
                message: format!("failed to create repository: http {status}: {body}"),
            });
        }

        info!(
            event = "remote.repository_created",
            owner = %self.owner,
            repository = name,
            "remote.repository_created"
        );
        if !self.settle_delay.is_zero() {
            self.settle.settle(self.settle_delay).await;
        }
        Ok(())
    }
}

impl RepositoryHost for GitHubClient {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn test_auth<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self
                .client
                .get(format!("{}/user", self.api_base_url))
                .send()
                .await
            {
                Ok(res) => {
                    let ok = res.status().is_success();
                    debug!(event = "remote.auth_check", status = %res.status(), ok, "remote.auth_check");
                    ok
                }
                Err(e) => {
                    warn!(event = "remote.auth_check_failed", error = %e, "remote.auth_check_failed");
                    false
                }
            }
        })
    }

    fn ensure_repository<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RepositoryStatus>> + Send + 'a>> {
        Box::pin(async move {
            let res = self
                .client
                .get(format!(
                    "{}/repos/{}/{}",
                    self.api_base_url, self.owner, name
                ))
                .send()
                .await
                .map_err(|e| self.request_error("repository check", e))?;

            let status = res.status();
            if status.is_success() {
                debug!(
                    event = "remote.repository_exists",
                    owner = %self.owner,
                    repository = name,
                    "remote.repository_exists"
                );
                return Ok(RepositoryStatus::Exists);
            }
            if status != StatusCode::NOT_FOUND {
                let body = res.text().await.unwrap_or_default();
                return Err(Error::Repository {
                    message: format!("repository check returned http {status}: {body}"),
                });
            }

            self.create_repository(name).await?;
            Ok(RepositoryStatus::Created)
        })
    }
}

/// In-memory [`RepositoryHost`] that tracks call counts.
#[derive(Debug)]
pub struct InMemoryRepositoryHost {
    pub existence_checks: AtomicUsize,
    pub creations: AtomicUsize,
    pub auth_checks: AtomicUsize,
    owner: String,
    auth_ok: AtomicBool,
    repositories: Mutex<HashSet<String>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryRepositoryHost {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            existence_checks: AtomicUsize::new(0),
            creations: AtomicUsize::new(0),
            auth_checks: AtomicUsize::new(0),
            owner: owner.into(),
            auth_ok: AtomicBool::new(true),
            repositories: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn set_auth_ok(&self, ok: bool) {
        self.auth_ok.store(ok, Ordering::Relaxed);
    }

    /// Makes every following `ensure_repository` fail with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().await = Some(message.into());
    }

    pub async fn insert(&self, name: &str) {
        self.repositories.lock().await.insert(name.to_string());
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.repositories.lock().await.contains(name)
    }

    pub fn calls(&self) -> usize {
        self.existence_checks.load(Ordering::Relaxed)
            + self.creations.load(Ordering::Relaxed)
            + self.auth_checks.load(Ordering::Relaxed)
    }
}

impl RepositoryHost for InMemoryRepositoryHost {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn test_auth<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            self.auth_checks.fetch_add(1, Ordering::Relaxed);
            self.auth_ok.load(Ordering::Relaxed)
        })
    }

    fn ensure_repository<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RepositoryStatus>> + Send + 'a>> {
        Box::pin(async move {
            self.existence_checks.fetch_add(1, Ordering::Relaxed);
            if let Some(message) = self.failure.lock().await.clone() {
                return Err(Error::Repository { message });
            }

            let mut repos = self.repositories.lock().await;
            if repos.contains(name) {
                return Ok(RepositoryStatus::Exists);
            }
            self.creations.fetch_add(1, Ordering::Relaxed);
            repos.insert(name.to_string());
            Ok(RepositoryStatus::Created)
        })
    }
}

pub fn repository_url(git_host: &str, owner: &str, repository: &str) -> String {
    format!("https://{git_host}/{owner}/{repository}.git")
}

/// Push URL carrying the token. Only ever handed to git for the push itself.
pub fn authenticated_repository_url(
    git_host: &str,
    token: &str,
    owner: &str,
    repository: &str,
) -> String {
    format!("https://{token}@{git_host}/{owner}/{repository}.git")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_ensure_observes_existing_repository() {
        let host = InMemoryRepositoryHost::new("octocat");
        assert_eq!(
            host.ensure_repository("foo-backup").await.unwrap(),
            RepositoryStatus::Created
        );
        assert_eq!(
            host.ensure_repository("foo-backup").await.unwrap(),
            RepositoryStatus::Exists
        );
        assert_eq!(host.creations.load(Ordering::Relaxed), 1);
        assert_eq!(host.existence_checks.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn urls_embed_token_only_for_push() {
        assert_eq!(
            repository_url("github.com", "octocat", "foo-backup"),
            "https://github.com/octocat/foo-backup.git"
        );
        assert_eq!(
            authenticated_repository_url("github.com", "ghp_x", "octocat", "foo-backup"),
            "https://ghp_x@github.com/octocat/foo-backup.git"
        );
    }

    #[test]
    fn client_rejects_token_with_newline() {
        let err = GitHubClient::new(GitHubClientConfig {
            api_base_url: "https://api.github.com".to_string(),
            username: "octocat".to_string(),
            token: "bad\ntoken".to_string(),
            user_agent: "ua".to_string(),
            repository_description: "d".to_string(),
            settle_delay: Duration::ZERO,
            timeout: Duration::from_secs(1),
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
