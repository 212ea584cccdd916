use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FerretError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    /// Minimum confidence at which the orchestrator stops escalating.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Two-digit years below this are read as 20xx.
    #[serde(default = "default_date_pivot_year")]
    pub date_pivot_year: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_ceiling_secs")]
    pub poll_ceiling_secs: u64,
    #[serde(default)]
    pub ai_endpoint: Option<String>,
    #[serde(default = "default_ai_timeout_secs")]
    pub ai_timeout_secs: u64,
    /// Name of the environment variable holding the AI service key.
    #[serde(default = "default_ai_api_key_env")]
    pub ai_api_key_env: String,
}

fn default_acceptance_threshold() -> f64 {
    0.6
}

fn default_max_attempts() -> usize {
    4
}

fn default_date_pivot_year() -> u32 {
    crate::normalize::DEFAULT_PIVOT_YEAR
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_poll_ceiling_secs() -> u64 {
    300
}

fn default_ai_timeout_secs() -> u64 {
    60
}

fn default_ai_api_key_env() -> String {
    "FERRET_AI_API_KEY".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            acceptance_threshold: default_acceptance_threshold(),
            max_attempts: default_max_attempts(),
            date_pivot_year: default_date_pivot_year(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_ceiling_secs: default_poll_ceiling_secs(),
            ai_endpoint: None,
            ai_timeout_secs: default_ai_timeout_secs(),
            ai_api_key_env: default_ai_api_key_env(),
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("ferret.db")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("uploads")
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(FerretError::Settings(format!(
                "acceptance_threshold must be between 0 and 1, got {}",
                self.acceptance_threshold
            )));
        }
        if self.max_attempts == 0 {
            return Err(FerretError::Settings("max_attempts must be at least 1".to_string()));
        }
        if self.date_pivot_year > 99 {
            return Err(FerretError::Settings(format!(
                "date_pivot_year must be a two-digit year, got {}",
                self.date_pivot_year
            )));
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("FERRET_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ferret")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("FERRET_CONFIG_DIR") {
        return PathBuf::from(dir).join("data");
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ferret")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable settings, using defaults");
                Settings::default()
            }
        }
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    settings.validate()?;
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| FerretError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            data_dir: "/tmp/test".to_string(),
            acceptance_threshold: 0.75,
            ai_endpoint: Some("http://localhost:8080/extract".to_string()),
            ..Settings::default()
        };
        let json = serde_json::to_string_pretty(&settings).unwrap();
        std::fs::write(&path, &json).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.acceptance_threshold, 0.75);
        assert_eq!(loaded.ai_endpoint.as_deref(), Some("http://localhost:8080/extract"));
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.acceptance_threshold, 0.6);
        assert_eq!(s.max_attempts, 4);
        assert_eq!(s.date_pivot_year, 50);
        assert_eq!(s.poll_interval_secs, 2);
        assert_eq!(s.poll_ceiling_secs, 300);
        assert!(s.ai_endpoint.is_none());
        assert!(!s.data_dir.is_empty());
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test", "acceptance_threshold": 0.8}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.acceptance_threshold, 0.8);
        assert_eq!(s.max_attempts, 4);
        assert_eq!(s.ai_api_key_env, "FERRET_AI_API_KEY");
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let s = Settings { acceptance_threshold: 1.5, ..Settings::default() };
        assert!(s.validate().is_err());
        let s = Settings { max_attempts: 0, ..Settings::default() };
        assert!(s.validate().is_err());
        let s = Settings { date_pivot_year: 1950, ..Settings::default() };
        assert!(s.validate().is_err());
    }
}
