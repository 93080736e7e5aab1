//! Ambient configuration (§0.3): supplements, never replaces, a loop's own
//! `LoopConfig` overrides. Loaded through the same fallback chain the
//! original config loader used — explicit path, then a project-local file,
//! then an XDG user config, then built-in defaults — logging and falling
//! through rather than aborting on a bad file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
    #[serde(rename = "commit-prefix")]
    pub commit_prefix: String,
    #[serde(rename = "stop-pattern")]
    pub stop_pattern: String,
    #[serde(rename = "activity-timeout-seconds")]
    pub activity_timeout_seconds: u64,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            branch_prefix: "ralph/".to_string(),
            commit_prefix: "[ralph]".to_string(),
            stop_pattern: crate::domain::DEFAULT_STOP_PATTERN.to_string(),
            activity_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    #[serde(rename = "max-loops")]
    pub max_loops: u32,
    #[serde(rename = "max-consecutive-errors")]
    pub max_consecutive_errors: u32,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self { max_loops: 10, max_consecutive_errors: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    #[serde(rename = "store-path")]
    pub store_path: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { store_path: default_store_path() }
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("ralph").join("store")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(rename = "provider-id")]
    pub provider_id: String,
    #[serde(rename = "model-id")]
    pub model_id: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { provider_id: "anthropic".to_string(), model_id: "claude-sonnet-4-5".to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub git: GitSettings,
    pub concurrency: ConcurrencySettings,
    pub persistence: PersistenceSettings,
    pub agent: AgentSettings,
}

impl Config {
    /// `--config` path, then `.ralph.yml` in the current directory, then
    /// `$XDG_CONFIG_HOME/ralph/ralph.yml`, then defaults. A present-but-bad
    /// file only logs a warning; it never aborts startup.
    pub fn load(explicit_path: Option<&Path>) -> Self {
        if let Some(path) = explicit_path {
            return Self::load_from_file(path).unwrap_or_else(|| {
                warn!(path = %path.display(), "Config::load: failed to parse explicit config, using defaults");
                Self::default()
            });
        }

        let local = PathBuf::from(".ralph.yml");
        if local.is_file() {
            if let Some(config) = Self::load_from_file(&local) {
                info!(path = %local.display(), "Config::load: loaded project-local config");
                return config;
            }
            warn!(path = %local.display(), "Config::load: failed to parse project-local config, falling through");
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_path = config_dir.join("ralph").join("ralph.yml");
            if xdg_path.is_file() {
                if let Some(config) = Self::load_from_file(&xdg_path) {
                    info!(path = %xdg_path.display(), "Config::load: loaded user config");
                    return config;
                }
                warn!(path = %xdg_path.display(), "Config::load: failed to parse user config, falling through");
            }
        }

        info!("Config::load: no config file found, using defaults");
        Self::default()
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_yaml::from_str(&contents).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.git.branch_prefix, "ralph/");
        assert_eq!(config.concurrency.max_consecutive_errors, 3);
        assert_eq!(config.agent.provider_id, "anthropic");
    }

    #[test]
    fn deserializes_kebab_case_partial_config() {
        let yaml = "git:\n  branch-prefix: \"custom/\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.git.branch_prefix, "custom/");
        assert_eq!(config.git.commit_prefix, "[ralph]");
        assert_eq!(config.concurrency.max_loops, 10);
    }

    #[test]
    fn load_with_missing_explicit_path_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/ralph.yml")));
        assert_eq!(config.agent.model_id, "claude-sonnet-4-5");
    }
}
