//! Configuration management for hotpatch
//!
//! This module provides the configuration structures loaded at process start:
//! the authorized operator, the target table, workflow limits, and the code-host
//! and model settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{HotpatchError, Result, TargetSpec};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "hotpatch.toml";

/// Process-level hotpatch configuration
///
/// Loaded from `hotpatch.toml` (or the path given on the command line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotpatchConfig {
    /// The single operator identity allowed to propose and resolve
    #[serde(default)]
    pub authorized_operator: String,

    /// Directory holding the audit log, memory and snapshots
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Crash log read by the debug and health commands
    #[serde(default = "default_error_log")]
    pub error_log: PathBuf,

    /// Workflow limits
    #[serde(default)]
    pub limits: Limits,

    /// Code host settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Model selection
    #[serde(default)]
    pub model: ModelConfig,

    /// Target table keyed by short identifier
    #[serde(default)]
    pub targets: BTreeMap<String, TargetEntry>,
}

/// Workflow limits and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Diff lines shown before truncation
    #[serde(default = "default_diff_preview_lines")]
    pub diff_preview_lines: usize,

    /// Memory entries passed to the transform as context
    #[serde(default = "default_memory_context_entries")]
    pub memory_context_entries: usize,

    /// Memory entries retained per target
    #[serde(default = "default_memory_retained_entries")]
    pub memory_retained_entries: usize,

    /// Upper bound on a single transform call
    #[serde(default = "default_transform_timeout_secs")]
    pub transform_timeout_secs: u64,

    /// Upper bound on a deploy trigger call
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,

    /// Upper bound on a single code host request
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    /// Pending proposals older than this are discarded on resolve
    #[serde(default)]
    pub proposal_ttl_secs: Option<u64>,
}

/// GitHub contents API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Environment variable containing the access token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Branch used when a target does not name one
    #[serde(default = "default_branch")]
    pub default_branch: String,

    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model to use
    #[serde(default = "default_model")]
    pub default: String,

    /// Environment variable containing API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

/// One `[targets.<key>]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub deploy_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub markers: Vec<String>,
}

// Default value providers
fn default_state_dir() -> PathBuf {
    PathBuf::from(".hotpatch")
}

fn default_error_log() -> PathBuf {
    PathBuf::from("error_log.txt")
}

fn default_diff_preview_lines() -> usize {
    40
}

fn default_memory_context_entries() -> usize {
    5
}

fn default_memory_retained_entries() -> usize {
    50
}

fn default_transform_timeout_secs() -> u64 {
    120
}

fn default_deploy_timeout_secs() -> u64 {
    10
}

fn default_store_timeout_secs() -> u64 {
    30
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_PAT".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_commit_message() -> String {
    "Auto update from hotpatch".to_string()
}

fn default_model() -> String {
    "sonnet".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> usize {
    16000
}

impl HotpatchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path` if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| HotpatchError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write an example configuration to `path`
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&Self::example()).map_err(|e| {
            HotpatchError::Config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Example configuration with one placeholder target
    pub fn example() -> Self {
        let mut config = Self {
            authorized_operator: "0".to_string(),
            ..Self::default()
        };
        config.targets.insert(
            "demo".to_string(),
            TargetEntry {
                owner: "your-org".to_string(),
                repo: "your-bot".to_string(),
                path: "bot.py".to_string(),
                deploy_url: "https://your-bot.example.com".to_string(),
                branch: None,
                markers: vec!["import".to_string()],
            },
        );
        config
    }

    /// Check the invariants the workflow relies on
    pub fn validate(&self) -> Result<()> {
        if self.authorized_operator.trim().is_empty() {
            return Err(HotpatchError::Config(
                "authorized_operator must be set".to_string(),
            ));
        }
        if self.targets.is_empty() {
            return Err(HotpatchError::Config(
                "at least one [targets.<key>] table is required".to_string(),
            ));
        }
        if self.limits.diff_preview_lines == 0 {
            return Err(HotpatchError::Config(
                "limits.diff_preview_lines must be greater than zero".to_string(),
            ));
        }
        for (key, entry) in &self.targets {
            if key.contains(':') || key.trim() != key || key.to_lowercase() != *key {
                return Err(HotpatchError::Config(format!(
                    "target key '{}' must be lowercase without spaces or ':'",
                    key
                )));
            }
            if entry.deploy_url.trim().is_empty() {
                return Err(HotpatchError::Config(format!(
                    "target '{}' has an empty deploy_url",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Resolve the target table into immutable specs
    pub fn target_specs(&self) -> BTreeMap<String, TargetSpec> {
        self.targets
            .iter()
            .map(|(key, entry)| {
                let branch = entry
                    .branch
                    .clone()
                    .unwrap_or_else(|| self.github.default_branch.clone());
                let spec = TargetSpec::new(
                    key.clone(),
                    entry.owner.clone(),
                    entry.repo.clone(),
                    entry.path.clone(),
                    entry.deploy_url.trim_end_matches('/'),
                )
                .with_branch(branch)
                .with_markers(entry.markers.clone());
                (key.clone(), spec)
            })
            .collect()
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir.join("deploy_log.jsonl")
    }

    pub fn memory_path(&self) -> PathBuf {
        self.state_dir.join("memory.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }
}

impl Default for HotpatchConfig {
    fn default() -> Self {
        Self {
            authorized_operator: String::new(),
            state_dir: default_state_dir(),
            error_log: default_error_log(),
            limits: Limits::default(),
            github: GitHubConfig::default(),
            model: ModelConfig::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            diff_preview_lines: default_diff_preview_lines(),
            memory_context_entries: default_memory_context_entries(),
            memory_retained_entries: default_memory_retained_entries(),
            transform_timeout_secs: default_transform_timeout_secs(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            proposal_ttl_secs: None,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_env: default_token_env(),
            default_branch: default_branch(),
            commit_message: default_commit_message(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
        }
    }
}
