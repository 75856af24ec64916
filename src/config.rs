use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::EngineOptions;

/// Root for netscope's own files (config, logs, default capture output).
/// `NETSCOPE_HOME` overrides the location for tests and portable setups.
pub fn netscope_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NETSCOPE_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".netscope")
}

pub fn config_path() -> PathBuf {
    netscope_home_dir().join("config.json")
}

pub fn default_output_folder() -> PathBuf {
    netscope_home_dir().join("captures")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    /// Initial navigation target; consumed by the browsing UI, not the
    /// capture core.
    pub target_url: String,
    /// Base directory for session archives.
    pub output_folder: PathBuf,
    /// User agent the navigation host advertises.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub win_width: u32,
    pub win_height: u32,
    /// Strip bearer-token signatures, cookie values, and credential body
    /// fields from everything emitted and archived.
    pub redact_secrets: bool,
    /// Opt-in to response-body persistence.
    pub capture_bodies: bool,
    /// Bodies above this size are never persisted.
    pub capture_body_max_bytes: usize,
    /// Regex matched against the response content type; only matches are
    /// persisted. An invalid pattern matches nothing.
    pub capture_body_types: String,
    /// Attach the diagnostic channel bridge when the host exposes one.
    pub enable_cdp: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            target_url: "https://example.com".to_string(),
            output_folder: default_output_folder(),
            user_agent: None,
            win_width: 1_280,
            win_height: 800,
            redact_secrets: true,
            capture_bodies: false,
            capture_body_max_bytes: 1_048_576,
            capture_body_types: r"^(application/json|application/[a-z.+-]*\+json|text/)".to_string(),
            enable_cdp: true,
        }
    }
}

impl CaptureConfig {
    /// Compile the body-type filter. An empty or invalid pattern yields
    /// `None`, which downstream treats as match-nothing (persistence off).
    pub fn body_types_regex(&self) -> Option<Regex> {
        let pattern = self.capture_body_types.trim();
        if pattern.is_empty() {
            return None;
        }
        match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                warn!("invalid captureBodyTypes pattern {pattern:?}, persisting nothing: {err}");
                None
            }
        }
    }

    /// Resolve the engine's capture options from this configuration; read
    /// once at session start.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            redact_secrets: self.redact_secrets,
            capture_bodies: self.capture_bodies,
            capture_body_max_bytes: self.capture_body_max_bytes,
            capture_body_types: self.body_types_regex(),
            enable_cdp: self.enable_cdp,
        }
    }
}

pub fn load_config() -> Result<CaptureConfig> {
    load_config_from(&config_path())
}

/// Load configuration from `path`; a missing file yields the defaults, a
/// present-but-malformed file is an error the CLI surfaces.
pub fn load_config_from(path: &Path) -> Result<CaptureConfig> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CaptureConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {:?}", path));
        }
    };
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {:?}", path))
}

pub fn save_config(config: &CaptureConfig) -> Result<()> {
    save_config_to(config, &config_path())
}

pub fn save_config_to(config: &CaptureConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        crate::util::ensure_directory(parent)?;
    }
    let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, text).with_context(|| format!("failed to write config {:?}", path))
}

/// Load the config, writing the defaults to disk first when no file exists
/// yet, so `config show` always has something concrete to point at.
pub fn load_or_bootstrap() -> Result<CaptureConfig> {
    let path = config_path();
    if !path.exists() {
        let config = CaptureConfig::default();
        save_config_to(&config, &path)?;
        return Ok(config);
    }
    load_config_from(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config.win_width, 1_280);
        assert!(config.redact_secrets);
        assert!(!config.capture_bodies);
    }

    #[test]
    fn save_and_load_round_trip_with_camel_case_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let config = CaptureConfig {
            capture_bodies: true,
            capture_body_max_bytes: 4_096,
            ..Default::default()
        };
        save_config_to(&config, &path).expect("save");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"captureBodyMaxBytes\": 4096"));
        assert!(text.contains("\"redactSecrets\": true"));

        let loaded = load_config_from(&path).expect("load");
        assert!(loaded.capture_bodies);
        assert_eq!(loaded.capture_body_max_bytes, 4_096);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn partial_file_falls_back_to_field_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"captureBodies": true}"#).expect("write");

        let config = load_config_from(&path).expect("load");
        assert!(config.capture_bodies);
        assert_eq!(config.win_height, 800);
    }

    #[test]
    fn invalid_body_type_pattern_matches_nothing() {
        let config = CaptureConfig {
            capture_body_types: "[unclosed".to_string(),
            ..Default::default()
        };
        assert!(config.body_types_regex().is_none());
        assert!(config.engine_options().capture_body_types.is_none());

        let config = CaptureConfig {
            capture_body_types: String::new(),
            ..Default::default()
        };
        assert!(config.body_types_regex().is_none());
    }

    #[test]
    fn default_body_type_pattern_matches_json_and_text() {
        let config = CaptureConfig::default();
        let re = config.body_types_regex().expect("valid default");
        assert!(re.is_match("application/json"));
        assert!(re.is_match("application/problem+json"));
        assert!(re.is_match("text/plain; charset=utf-8"));
        assert!(!re.is_match("image/png"));
    }
}
