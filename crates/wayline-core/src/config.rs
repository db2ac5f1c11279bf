use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaylineError};

/// Top-level Wayline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    /// Rule-table classifiers registered as tools at startup.
    #[serde(default)]
    pub classifiers: Vec<ClassifierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts at writing one checkpoint before the execution fails.
    #[serde(default = "default_checkpoint_write_attempts")]
    pub checkpoint_write_attempts: u32,
    /// Timeout applied to tools that do not declare their own.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Default lifetime of a pending approval request.
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// How often the server sweeps expired approval requests.
    #[serde(default = "default_approval_sweep_interval")]
    pub approval_sweep_interval_secs: u64,
    /// Upper bound on concurrently running branches of one fanout (0 = unbounded).
    #[serde(default)]
    pub max_fanout_concurrency: usize,
    /// Resume non-terminal executions when the server starts.
    #[serde(default = "default_recover_on_start")]
    pub recover_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_write_attempts: default_checkpoint_write_attempts(),
            tool_timeout_secs: default_tool_timeout(),
            approval_timeout_secs: default_approval_timeout(),
            approval_sweep_interval_secs: default_approval_sweep_interval(),
            max_fanout_concurrency: 0,
            recover_on_start: default_recover_on_start(),
        }
    }
}

fn default_checkpoint_write_attempts() -> u32 { 3 }
fn default_tool_timeout() -> u64 { 30 }
fn default_approval_timeout() -> u64 { 86_400 }
fn default_approval_sweep_interval() -> u64 { 30 }
fn default_recover_on_start() -> bool { true }

/// Retry configuration for tool invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }

/// Persistence backend for executions, checkpoints and approvals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database path.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.wayline/wayline.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    /// Directory of `*.json` workflow definitions loaded at startup.
    #[serde(default = "default_workflows_dir")]
    pub dir: String,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            dir: default_workflows_dir(),
        }
    }
}

fn default_workflows_dir() -> String { "workflows".to_string() }

/// A rule-table classifier exposed as a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ClassifierRule>,
    /// Worker chosen when no rule matches.
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRule {
    /// Condition over the classifier input, same grammar as edge conditions.
    pub when: String,
    pub worker: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaylineError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WaylineError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "Config file missing, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the SQLite path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the workflow definitions directory (expand ~).
    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.workflows.dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
