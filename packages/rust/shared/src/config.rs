//! Application configuration for stepledger.
//!
//! User config lives at `~/.stepledger/stepledger.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stepledger_format::KeyCase;

use crate::error::{Result, StepLedgerError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "stepledger.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".stepledger";

// ---------------------------------------------------------------------------
// Config structs (matching stepledger.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// On-disk formats and project-root discovery.
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP fetch collaborator.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Legacy state-file migration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the progress file and step logs.
    #[serde(default = "default_progress_dir")]
    pub progress_dir: String,

    /// Progress file name inside `progress_dir`.
    #[serde(default = "default_progress_file_name")]
    pub progress_file_name: String,

    /// Reuse successful steps from the previous iteration.
    #[serde(default = "default_true")]
    pub resume_from_last_successful: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            progress_dir: default_progress_dir(),
            progress_file_name: default_progress_file_name(),
            resume_from_last_successful: true,
        }
    }
}

fn default_progress_dir() -> String {
    ".stepledger/progress".into()
}
fn default_progress_file_name() -> String {
    "progress.json".into()
}
fn default_true() -> bool {
    true
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Key casing written to progress and step-log files.
    #[serde(default = "default_key_case")]
    pub key_case: KeyCase,

    /// Key casing written to processing-state files.
    #[serde(default)]
    pub state_key_case: KeyCase,

    /// Files or directories that mark a project root.
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_case: default_key_case(),
            state_key_case: KeyCase::Snake,
            root_markers: default_root_markers(),
        }
    }
}

fn default_key_case() -> KeyCase {
    KeyCase::Camel
}
fn default_root_markers() -> Vec<String> {
    [".git", "Cargo.toml", "package.json", ".stepledger-root"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Total attempts before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Re-download even if the destination already exists.
    #[serde(default)]
    pub overwrite_existing: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            overwrite_existing: false,
        }
    }
}

fn default_timeout_ms() -> u64 {
    60_000
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}

/// `[migration]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// File name searched for when migrating a directory tree.
    #[serde(default = "default_migration_file_name")]
    pub progress_file_name: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            progress_file_name: default_migration_file_name(),
        }
    }
}

fn default_migration_file_name() -> String {
    "question.progress.json".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.stepledger/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StepLedgerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.stepledger/stepledger.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| StepLedgerError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        StepLedgerError::config(format!("failed to parse {}: {e}", path.display()))
    })?;

    if config.fetch.retries == 0 {
        return Err(StepLedgerError::config("fetch.retries must be at least 1"));
    }
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StepLedgerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StepLedgerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StepLedgerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
