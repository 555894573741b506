//! Configuration loading, resolution and write-back
//!
//! Resolution follows a fixed priority order (highest first):
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file (`~/.config/kwp/config.toml`, then `/etc/kwp/config.toml`)
//! 4. Compiled defaults

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG_PATH: &str = "KWP_CONFIG";
/// Environment variable overriding the model backend endpoint
pub const ENV_OLLAMA_URL: &str = "KWP_OLLAMA_URL";
/// Environment variable overriding the model preset
pub const ENV_MODEL: &str = "KWP_MODEL";

/// Complete TOML configuration
///
/// Every section falls back to its defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub model: ModelSection,
    pub engine: EngineSection,
    pub logging: LoggingConfig,
    pub server: ServerSection,
    /// Directory receiving run records (defaults to the platform data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,
}

/// Vision model backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSection {
    /// Base URL of the Ollama-compatible backend
    pub endpoint: String,
    /// Model preset key (e.g. "qwen3-vl:8b", "llava")
    pub preset: String,
    /// Overrides the preset temperature when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Hard bound for a single request attempt
    pub timeout_secs: u64,
    /// Retries after the first attempt for timeouts and transient failures
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Optional client-side request quota
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<u32>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            preset: "qwen3-vl:8b".to_string(),
            temperature: None,
            timeout_secs: 120,
            max_retries: 2,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
            requests_per_second: None,
        }
    }
}

/// Tag synthesis engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    /// Concurrent model requests (1 for a single GPU-bound backend)
    pub worker_limit: usize,
    /// Maximum time gap between neighbouring photos of one cluster
    pub time_gap_hours: f64,
    /// Maximum distance between neighbouring photos of one cluster
    pub distance_km: f64,
    /// Prompt kind used for photo-level tags ("tags" or "detailed_tags")
    pub photo_prompt: String,
    /// Optional extra free-text request per photo ("brief" or "description")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_description: Option<String>,
    pub photo_ai_weight: f32,
    pub group_ai_weight: f32,
    pub user_hint_weight: f32,
    /// Weight for existing tags when the caller supplies none
    pub existing_weight: f32,
    /// Share of the best ancestor weight added to a surviving specific tag
    pub ancestor_reinforcement: f32,
    /// Emit the capture year as a technical tag
    pub exif_year_tag: bool,
    /// Extra synonym groups for hierarchy resolution (canonical -> synonyms)
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_limit: 1,
            time_gap_hours: 6.0,
            distance_km: 5.0,
            photo_prompt: "tags".to_string(),
            include_description: None,
            photo_ai_weight: 0.7,
            group_ai_weight: 0.6,
            user_hint_weight: 0.5,
            existing_weight: 0.7,
            ancestor_reinforcement: 0.1,
            exif_year_tag: false,
            synonyms: BTreeMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5730".to_string(),
        }
    }
}

impl TomlConfig {
    /// Apply `KWP_OLLAMA_URL` / `KWP_MODEL` on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env(ENV_OLLAMA_URL) {
            info!("Model endpoint overridden by {}", ENV_OLLAMA_URL);
            self.model.endpoint = url;
        }
        if let Some(model) = non_empty_env(ENV_MODEL) {
            info!("Model preset overridden by {}", ENV_MODEL);
            self.model.preset = model;
        }
    }

    /// Directory for run records, falling back to the platform data dir
    pub fn results_dir(&self) -> PathBuf {
        self.results_dir
            .clone()
            .unwrap_or_else(default_results_dir)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve which config file to read, if any
///
/// Returns `None` when no file is named and no default file exists, in which
/// case compiled defaults apply.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Some(path) = non_empty_env(ENV_CONFIG_PATH) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: Default file locations
    default_config_file()
}

/// Per-user config file location (`~/.config/kwp/config.toml` on Linux)
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kwp").join("config.toml"))
}

fn default_config_file() -> Option<PathBuf> {
    if let Some(path) = user_config_path() {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/kwp/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default results folder
pub fn default_results_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("kwp").join("results"))
        .unwrap_or_else(|| PathBuf::from("./kwp_results"))
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load configuration using the full resolution order
///
/// An explicitly named file that cannot be read is an error; a missing
/// default file is not.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(cli_arg) {
        Some(path) => {
            let config = load_toml_config(&path)?;
            info!("Configuration loaded from {}", path.display());
            config
        }
        None => {
            debug!("No config file found, using compiled defaults");
            TomlConfig::default()
        }
    };

    config.apply_env_overrides();
    Ok(config)
}

/// Write configuration to a TOML file atomically
///
/// Writes a sibling temp file first, then renames it over the target.
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        warn!("Config rename failed, removing temp file: {}", e);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.model.endpoint, "http://localhost:11434");
        assert_eq!(config.model.preset, "qwen3-vl:8b");
        assert_eq!(config.model.timeout_secs, 120);
        assert_eq!(config.engine.worker_limit, 1);
        assert_eq!(config.engine.photo_prompt, "tags");
        assert!(config.engine.synonyms.is_empty());
    }

    #[test]
    fn test_user_config_path_location() {
        if let Some(path) = user_config_path() {
            assert!(path.ends_with("kwp/config.toml"));
        }
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
    }

    #[test]
    fn test_partial_section() {
        let config: TomlConfig = toml::from_str(
            r#"
            [engine]
            worker_limit = 3

            [engine.synonyms]
            church = ["chapel"]
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.worker_limit, 3);
        assert_eq!(config.engine.time_gap_hours, 6.0);
        assert_eq!(config.engine.synonyms["church"], vec!["chapel".to_string()]);
        assert_eq!(config.model, ModelSection::default());
    }
}
