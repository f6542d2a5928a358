//! Configuration for tickloop.
//!
//! Controls how the crate names and sizes the OS threads it spawns, and the
//! default state an Instructor starts with.
//!
//! Loaded from `.tickloop.yml` or `~/.config/tickloop/tickloop.yml`.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::LoopState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub threads: ThreadConfig,
    pub instructor: InstructorConfig,
}

/// Settings applied to every thread tickloop spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThreadConfig {
    /// Thread names are `{name_prefix}-{role}-{seq}`.
    pub name_prefix: String,
    /// Stack size in bytes; platform default when unset.
    pub stack_size: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name_prefix: env!("CARGO_PKG_NAME").to_string(),
            stack_size: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InstructorConfig {
    /// State applied to every loop the instructor starts.
    pub default_state: LoopState,
}

impl Config {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .tickloop.yml in current directory
    /// 3. ~/.config/tickloop/tickloop.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        let project_config = PathBuf::from(format!(".{}.yml", project_name));
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", project_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.threads.name_prefix.is_empty() {
            eyre::bail!("threads.name-prefix must not be empty");
        }
        if self.threads.stack_size == Some(0) {
            eyre::bail!("threads.stack-size must be > 0");
        }
        Ok(())
    }
}
