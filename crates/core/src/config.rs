use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CREDENTIALS_FILE_NAME: &str = ".packagebackup.config";
pub const SETTINGS_FILE_NAME: &str = "packagebackup.toml";
pub const GITIGNORE_FILE_NAME: &str = ".gitignore";
pub const DEFAULT_BRANCH_PREFIX: &str = "backup";

const CREDENTIALS_SECTION: &str = "[github]";

/// GitHub credentials persisted as flat `key=value` text.
///
/// The token is stored in plaintext on disk; `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
    pub default_branch: String,
}

impl Credentials {
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.token.is_empty()
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: String::new(),
            token: String::new(),
            default_branch: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("default_branch", &self.default_branch)
            .finish()
    }
}

pub fn credentials_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CREDENTIALS_FILE_NAME)
}

pub fn parse_credentials(text: &str) -> Credentials {
    let mut creds = Credentials::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "username" => creds.username = value,
            "token" => creds.token = value,
            "default-branch" => creds.default_branch = value,
            _ => {}
        }
    }
    creds
}

pub fn credentials_to_text(creds: &Credentials) -> String {
    format!(
        "{CREDENTIALS_SECTION}\nusername={}\ntoken={}\ndefault-branch={}\n",
        creds.username, creds.token, creds.default_branch
    )
}

pub fn load_credentials(config_dir: &Path) -> Result<Credentials> {
    let path = credentials_path(config_dir);
    if !path.exists() {
        return Ok(Credentials::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("credentials read failed: {e}"),
    })?;
    Ok(parse_credentials(&text))
}

pub fn save_credentials(config_dir: &Path, creds: &Credentials) -> Result<()> {
    if creds.username.contains(['\n', '\r']) || creds.token.contains(['\n', '\r']) {
        return Err(Error::InvalidConfig {
            message: "username and token must be single-line values".to_string(),
        });
    }

    std::fs::create_dir_all(config_dir).map_err(|e| Error::InvalidConfig {
        message: format!("config dir create failed: {e}"),
    })?;

    let path = credentials_path(config_dir);
    atomic_write(&path, credentials_to_text(creds).as_bytes()).map_err(|e| {
        Error::InvalidConfig {
            message: format!("credentials write failed: {e}"),
        }
    })?;
    tracing::debug!(
        event = "config.credentials_saved",
        path = %path.display(),
        "config.credentials_saved"
    );

    ensure_credentials_ignored(config_dir).map_err(|e| Error::InvalidConfig {
        message: format!(".gitignore update failed: {e}"),
    })?;
    Ok(())
}

/// Lists the credentials file in `{dir}/.gitignore`, creating the file when
/// missing. Returns `true` when the entry was added.
pub fn ensure_credentials_ignored(dir: &Path) -> std::io::Result<bool> {
    let path = dir.join(GITIGNORE_FILE_NAME);
    let existing = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    if existing
        .lines()
        .any(|line| matches!(line.trim(), CREDENTIALS_FILE_NAME | "/.packagebackup.config"))
    {
        return Ok(false);
    }

    let mut entry = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(CREDENTIALS_FILE_NAME);
    entry.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(entry.as_bytes())?;
    tracing::debug!(
        event = "config.gitignore_updated",
        path = %path.display(),
        "config.gitignore_updated"
    );
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub package_cache_dir: String,
    pub api_base_url: String,
    pub git_host: String,
    pub settle_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub repository_description: String,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            package_cache_dir: "Library/PackageCache".to_string(),
            api_base_url: "https://api.github.com".to_string(),
            git_host: "github.com".to_string(),
            settle_delay_ms: 2000,
            http_timeout_secs: 30,
            command_timeout_secs: 300,
            repository_description: "Package Backup".to_string(),
            user_agent: "Package-Backup-Tool".to_string(),
        }
    }
}

impl Settings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = settings_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("settings read failed: {e}"),
    })?;
    let settings: Settings = toml::from_str(&text).map_err(|e| Error::InvalidConfig {
        message: format!("settings invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    std::fs::create_dir_all(config_dir).map_err(|e| Error::InvalidConfig {
        message: format!("config dir create failed: {e}"),
    })?;

    let text = toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("settings encode failed: {e}"),
    })?;

    atomic_write(&settings_path(config_dir), text.as_bytes()).map_err(|e| {
        Error::InvalidConfig {
            message: format!("settings write failed: {e}"),
        }
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if !(settings.api_base_url.starts_with("https://")
        || settings.api_base_url.starts_with("http://"))
    {
        return Err(Error::InvalidConfig {
            message: "api_base_url must be an http(s) URL".to_string(),
        });
    }
    if settings.git_host.trim().is_empty() || settings.git_host.contains('/') {
        return Err(Error::InvalidConfig {
            message: "git_host must be a bare host name".to_string(),
        });
    }
    if settings.http_timeout_secs == 0 || settings.command_timeout_secs == 0 {
        return Err(Error::InvalidConfig {
            message: "timeouts must be > 0".to_string(),
        });
    }
    if settings.user_agent.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "user_agent must not be empty".to_string(),
        });
    }
    if settings.package_cache_dir.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "package_cache_dir must not be empty".to_string(),
        });
    }
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(tmp, path)?;
    Ok(())
}
