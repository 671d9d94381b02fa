use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Local user whose keys this instance manages.
    pub user_id: String,
    pub data_dir: PathBuf,

    // Key directory
    pub directory_url: Option<String>,
    pub directory_timeout_ms: u64,

    // Derivation policy
    pub allow_bootstrap: bool,

    // Storage
    pub seal_store: bool,

    // Logging
    pub log_level: String,
    pub log_json: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            data_dir: PathBuf::from("./medc-data"),
            directory_url: None,
            directory_timeout_ms: 3000,
            allow_bootstrap: true,
            seal_store: true,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl EncryptionConfig {
    /// Config for one user with every other field at its default.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let mut config: EncryptionConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MEDC_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(user) = lookup("MEDC_USER_ID") {
            self.user_id = user;
        }
        if let Some(dir) = lookup("MEDC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("MEDC_DIRECTORY_URL") {
            self.directory_url = Some(url);
        }
        if let Some(ms) = lookup("MEDC_DIRECTORY_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                self.directory_timeout_ms = ms;
            }
        }
        if let Some(flag) = lookup("MEDC_ALLOW_BOOTSTRAP") {
            if let Ok(flag) = flag.parse::<bool>() {
                self.allow_bootstrap = flag;
            }
        }
        if let Some(flag) = lookup("MEDC_SEAL_STORE") {
            if let Ok(flag) = flag.parse::<bool>() {
                self.seal_store = flag;
            }
        }
        if let Some(level) = lookup("MEDC_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "user_id must not be empty".to_string(),
            ));
        }
        if self.directory_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "directory_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("keys.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EncryptionConfig::default();
        assert_eq!(config.directory_timeout_ms, 3000);
        assert!(config.allow_bootstrap);
        assert!(config.seal_store);
        // No user yet.
        assert!(config.validate().is_err());
        assert!(EncryptionConfig::for_user("dr-lee").validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = EncryptionConfig::for_user("dr-lee");
        config.directory_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MEDC_USER_ID", "patient-7"),
            ("MEDC_DIRECTORY_TIMEOUT_MS", "250"),
            ("MEDC_ALLOW_BOOTSTRAP", "false"),
            ("MEDC_SEAL_STORE", "not-a-bool"),
        ]
        .into_iter()
        .collect();

        let mut config = EncryptionConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.user_id, "patient-7");
        assert_eq!(config.directory_timeout(), Duration::from_millis(250));
        assert!(!config.allow_bootstrap);
        assert!(config.seal_store);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "user_id = \"dr-lee\"\ndirectory_url = \"https://api.example.test/api\""
        )
        .unwrap();

        let config = EncryptionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(
            config.directory_url.as_deref(),
            Some("https://api.example.test/api")
        );
        assert_eq!(config.directory_timeout_ms, 3000);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EncryptionConfig::load_from_file(Path::new("/nonexistent/medc.toml")),
            Err(ConfigError::FileNotFound(_))
        ));
    }
}
