//! Application configuration for Conveyor.
//!
//! User config lives at `~/.conveyor/conveyor.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConveyorError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "conveyor.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".conveyor";

// ---------------------------------------------------------------------------
// Config structs (matching conveyor.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker pool and queue settings.
    #[serde(default)]
    pub worker: WorkerSection,

    /// Remote build backend settings.
    #[serde(default)]
    pub remote: RemoteSection,

    /// Build log transport settings.
    #[serde(default)]
    pub logs: LogsSection,

    /// GitHub commit status settings.
    #[serde(default)]
    pub github: GitHubSection,
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Number of concurrent build workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum number of queued build requests before pushes block.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Hard limit on a single build attempt.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    100
}
fn default_build_timeout_secs() -> u64 {
    20 * 60
}

/// `[remote]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    /// CodeBuild endpoint (usually a local SigV4 signing proxy).
    #[serde(default = "default_codebuild_endpoint")]
    pub endpoint: String,

    /// Prefix prepended to repository names when tagging images.
    #[serde(default)]
    pub image_repository_prefix: Option<String>,

    /// Interval between build status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive throttled polls tolerated before giving up.
    #[serde(default = "default_max_throttles")]
    pub max_throttles: u32,

    /// CodeBuild compute type for created projects.
    #[serde(default = "default_compute_type")]
    pub compute_type: String,

    /// Build container image for created projects.
    #[serde(default = "default_build_image")]
    pub build_image: String,

    /// IAM service role ARN for created projects.
    #[serde(default)]
    pub service_role: String,

    /// Docker registry credentials secret exposed to the build.
    #[serde(default)]
    pub docker_credentials_secret: Option<String>,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            endpoint: default_codebuild_endpoint(),
            image_repository_prefix: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_throttles: default_max_throttles(),
            compute_type: default_compute_type(),
            build_image: default_build_image(),
            service_role: String::new(),
            docker_credentials_secret: None,
        }
    }
}

fn default_codebuild_endpoint() -> String {
    "http://127.0.0.1:8080/codebuild".into()
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_max_throttles() -> u32 {
    10
}
fn default_compute_type() -> String {
    "BUILD_GENERAL1_MEDIUM".into()
}
fn default_build_image() -> String {
    "aws/codebuild/docker:17.09.0".into()
}

/// Where build logs are written and read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// In-process only; useful for tests and one-shot CLI builds.
    Memory,
    /// libSQL database on local disk, shared between processes.
    Local,
    /// CloudWatch Logs.
    Cloudwatch,
}

/// `[logs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsSection {
    /// Log transport backend.
    #[serde(default = "default_log_backend")]
    pub backend: LogBackend,

    /// Log group that build logs are written under.
    #[serde(default = "default_log_group")]
    pub group: String,

    /// Database path for the `local` backend.
    #[serde(default = "default_local_path")]
    pub local_path: String,

    /// CloudWatch Logs endpoint (usually a local SigV4 signing proxy).
    #[serde(default = "default_cloudwatch_endpoint")]
    pub endpoint: String,

    /// Minimum interval between reads of a log stream.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// How long to keep tailing remote logs after the build finished.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Base URL for human-facing log links (`<url_base>/<build id>`).
    #[serde(default)]
    pub url_base: Option<String>,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            backend: default_log_backend(),
            group: default_log_group(),
            local_path: default_local_path(),
            endpoint: default_cloudwatch_endpoint(),
            throttle_ms: default_throttle_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            url_base: None,
        }
    }
}

fn default_log_backend() -> LogBackend {
    LogBackend::Local
}
fn default_log_group() -> String {
    "conveyor".into()
}
fn default_local_path() -> String {
    "~/.conveyor/logs.db".into()
}
fn default_cloudwatch_endpoint() -> String {
    "http://127.0.0.1:8080/logs".into()
}
fn default_throttle_ms() -> u64 {
    1_000
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}

/// `[github]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSection {
    /// GitHub API base URL.
    #[serde(default = "default_github_api")]
    pub api_base: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Commit status context label.
    #[serde(default = "default_status_context")]
    pub context: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api(),
            token_env: default_token_env(),
            context: default_status_context(),
        }
    }
}

fn default_github_api() -> String {
    "https://api.github.com".into()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_status_context() -> String {
    "container/docker".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub build_timeout: Duration,
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            workers: config.worker.workers.max(1),
            queue_capacity: config.worker.queue_capacity.max(1),
            build_timeout: Duration::from_secs(config.worker.build_timeout_secs),
        }
    }
}

/// Runtime remote executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Prefix for image repositories (`<prefix>/<owner>/<name>`).
    pub image_repository_prefix: Option<String>,
    pub poll_interval: Duration,
    pub max_throttles: u32,
    /// Minimum interval between reads of the remote log stream.
    pub log_throttle: Duration,
    /// How long to keep tailing after the remote build reached a terminal state.
    pub drain_timeout: Duration,
    pub compute_type: String,
    pub build_image: String,
    pub service_role: String,
    pub docker_credentials_secret: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExecutorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            image_repository_prefix: config.remote.image_repository_prefix.clone(),
            poll_interval: Duration::from_millis(config.remote.poll_interval_ms),
            max_throttles: config.remote.max_throttles,
            log_throttle: Duration::from_millis(config.logs.throttle_ms),
            drain_timeout: Duration::from_millis(config.logs.drain_timeout_ms),
            compute_type: config.remote.compute_type.clone(),
            build_image: config.remote.build_image.clone(),
            service_role: config.remote.service_role.clone(),
            docker_credentials_secret: config.remote.docker_credentials_secret.clone(),
        }
    }
}

/// Runtime log channel configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub backend: LogBackend,
    pub group: String,
    pub local_path: PathBuf,
    pub endpoint: String,
    pub throttle: Duration,
    pub url_base: Option<String>,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            backend: config.logs.backend,
            group: config.logs.group.clone(),
            local_path: expand_home(&config.logs.local_path),
            endpoint: config.logs.endpoint.clone(),
            throttle: Duration::from_millis(config.logs.throttle_ms),
            url_base: config.logs.url_base.clone(),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.conveyor/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ConveyorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.conveyor/conveyor.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ConveyorError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ConveyorError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ConveyorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ConveyorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ConveyorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the GitHub token from the configured env var.
pub fn github_token(config: &AppConfig) -> Result<String> {
    let var_name = &config.github.token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ConveyorError::config(format!(
            "GitHub token not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("queue_capacity"));
        assert!(toml_str.contains("GITHUB_TOKEN"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.worker.workers, 4);
        assert_eq!(parsed.logs.backend, LogBackend::Local);
        assert_eq!(parsed.github.context, "container/docker");
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[worker]
workers = 2

[logs]
backend = "cloudwatch"
group = "/conveyor/builds"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.worker.workers, 2);
        assert_eq!(config.worker.queue_capacity, 100);
        assert_eq!(config.logs.backend, LogBackend::Cloudwatch);
        assert_eq!(config.logs.group, "/conveyor/builds");
        assert_eq!(config.remote.poll_interval_ms, 5_000);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let mut app = AppConfig::default();
        app.worker.workers = 0;
        let pool = PoolConfig::from(&app);
        assert_eq!(pool.workers, 1);
        assert_eq!(pool.build_timeout, Duration::from_secs(1200));

        let exec = ExecutorConfig::from(&app);
        assert_eq!(exec.poll_interval, Duration::from_secs(5));
        assert_eq!(exec.log_throttle, Duration::from_secs(1));
    }

    #[test]
    fn github_token_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.github.token_env = "CONVEYOR_TEST_NONEXISTENT_TOKEN_12345".into();
        let result = github_token(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("token not found"));
    }
}
