//! Per-repository configuration
//!
//! Stored in `<repo>/.cosmos/forge.toml`. Every field has a default, so a
//! missing file (or a missing table inside it) is fine.

use crate::budget::BudgetConfig;
use crate::edit::MatchPolicy;
use crate::heal::HealConfig;
use anyhow::Context;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".cosmos";
pub const CONFIG_FILE: &str = "forge.toml";
pub const MODEL_ENV: &str = "COSMOS_FORGE_MODEL";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const KEYRING_SERVICE: &str = "cosmos-forge";
const KEYRING_USERNAME: &str = "openrouter_api_key";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// OpenRouter model id used for generation.
    pub model: String,
    /// Completion tokens requested from the model.
    pub max_output_tokens: u32,
    /// Total context budget when the task does not set one.
    pub token_budget: usize,
    pub budget: BudgetConfig,
    pub heal: HealConfig,
    pub match_policy: MatchPolicy,
    /// Shell command for the validation gate; autodetected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_command: Option<String>,
    pub check_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub task_deadline_secs: u64,
    /// Write `.cosmos/forge/runs/<task_id>.json` after each run.
    pub write_reports: bool,
    /// Append learning records to `.cosmos/forge/history.jsonl`.
    pub record_history: bool,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: 16_384,
            token_budget: 120_000,
            budget: BudgetConfig::default(),
            heal: HealConfig::default(),
            match_policy: MatchPolicy::default(),
            check_command: None,
            check_timeout_secs: 300,
            generation_timeout_secs: 180,
            task_deadline_secs: 900,
            write_reports: true,
            record_history: true,
        }
    }
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("COSMOS_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

impl ForgeConfig {
    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load config for `repo_root`, or return defaults.
    ///
    /// A file that fails to parse is moved aside to `forge.toml.bak` so the
    /// next save does not silently discard it.
    pub fn load(repo_root: &Path) -> Self {
        let path = Self::path(repo_root);
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ForgeConfig>(&content) {
                Ok(config) => config,
                Err(err) => {
                    preserve_corrupt_config(&path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "config file was corrupted; a backup was saved and defaults were loaded"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
    }

    pub fn save(&self, repo_root: &Path) -> anyhow::Result<()> {
        let path = Self::path(repo_root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err).with_context(|| format!("Failed to write {}", path.display()));
        }
        Ok(())
    }

    /// OpenRouter API key from the environment, then the system keychain.
    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }
        if keyring_disabled() {
            return None;
        }
        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, "couldn't read the API key from the system keychain");
                None
            }
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let backup = path.with_extension("toml.bak");
    if fs::rename(path, &backup).is_err() {
        let _ = fs::write(&backup, content);
    }
}
