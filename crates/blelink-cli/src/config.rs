//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blelink_core::{LinkConfig, ReconnectOptions};
use serde::{Deserialize, Serialize};

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Disable colored output
    #[serde(default)]
    pub no_color: bool,

    /// Peripheral profile: service, characteristic, name filter and timeouts
    #[serde(default)]
    pub link: LinkConfig,

    /// Backoff used when restoring a lost link in watch mode
    #[serde(default)]
    pub reconnect: ReconnectOptions,

    /// Behavior settings
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

/// Controls what the client does on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Try the remembered peripheral when `watch` starts.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Restore the session in the background after the link drops.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_reconnect: true,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blelink")
            .join("config.toml")
    }

    /// Load config from `path`, falling back to defaults on any problem.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<Config>(&content) {
                    Ok(config) => match config.validate() {
                        Ok(()) => return config,
                        Err(e) => eprintln!("Warning: Ignoring invalid config: {}", e),
                    },
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Check the link profile and backoff settings.
    pub fn validate(&self) -> Result<()> {
        self.link.validate().context("Invalid [link] section")?;
        self.reconnect
            .validate()
            .context("Invalid [reconnect] section")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_behavior_enables_automation() {
        let config = Config::default();
        assert!(config.behavior.auto_connect);
        assert!(config.behavior.auto_reconnect);
        assert!(!config.no_color);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [link]
            name_prefix = "Tag-"

            [behavior]
            auto_reconnect = false
            "#,
        )
        .unwrap();

        assert_eq!(config.link.name_prefix, "Tag-");
        assert_eq!(config.link.store_key, LinkConfig::default().store_key);
        assert!(config.behavior.auto_connect);
        assert!(!config.behavior.auto_reconnect);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.link = config.link.scan_duration(Duration::from_secs(9));
        config.no_color = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.link.scan_duration, Duration::from_secs(9));
        assert!(loaded.no_color);
    }

    #[test]
    fn test_unparseable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "link = [not valid").unwrap();

        let loaded = Config::load_from(&path);
        assert_eq!(loaded.link, LinkConfig::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_from(&dir.path().join("absent.toml"));
        assert!(loaded.behavior.auto_connect);
    }
}
