// Workspace configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure, read from `.quarry.toml` in the
/// project root. The core consumes these values; it does not own them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Index storage location; `:memory:` selects the ephemeral
    /// in-memory mode.
    pub database: String,
    /// File extensions considered indexable.
    pub extensions: Vec<String>,
    /// Exclusion glob patterns applied during directory expansion.
    pub exclude: Vec<String>,
    /// Quiescence window for keystroke-driven reindexing.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            database: ".quarry/index.sqlite".to_string(),
            extensions: vec!["php".to_string(), "phpt".to_string()],
            exclude: vec![
                "**/vendor/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/.git/**".to_string(),
                "**/cache/**".to_string(),
            ],
            debounce_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a project directory, falling back to the
    /// defaults when `.quarry.toml` is absent or unreadable.
    pub fn from_project_dir<P: AsRef<Path>>(project_dir: P) -> Self {
        let config_path = project_dir.as_ref().join(".quarry.toml");

        match Self::from_file(&config_path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::debug!("Could not load config from {}: {}", config_path.display(), e);
                tracing::info!("Using default configuration");
                Self::default()
            }
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index.database.is_empty() {
            anyhow::bail!("Index database location cannot be empty");
        }
        if self.index.extensions.is_empty() {
            anyhow::bail!("At least one indexable extension is required");
        }
        if self.index.debounce_ms == 0 {
            anyhow::bail!("Debounce delay must be greater than 0");
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.index.extensions.contains(&"php".to_string()));
        assert!(config.index.exclude.contains(&"**/vendor/**".to_string()));
        assert_eq!(config.index.debounce_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.index.extensions.clear();
        assert!(config.validate().is_err());
        config.index.extensions = vec!["php".to_string()];

        config.index.debounce_ms = 0;
        assert!(config.validate().is_err());
        config.index.debounce_ms = 500;

        config.logging.level = "noisy".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".quarry.toml");
        std::fs::write(&path, "[index]\ndatabase = \":memory:\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.index.database, ":memory:");
        // Unspecified sections keep their defaults.
        assert_eq!(config.index.debounce_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_project_dir(dir.path());
        assert_eq!(config.index.debounce_ms, 500);
    }
}
