//! Configuration management for the sync agent.
//!
//! Provides hierarchical configuration loading from multiple sources with priority:
//! 1. Default values (hardcoded)
//! 2. Main config file (`CONFIG_PATH` or the explicit path)
//! 3. Local overrides (`config/local`)
//! 4. Environment variables (highest priority, `CONFD__SECTION__FIELD`)

mod backend;
mod confd;
mod monitoring;
mod retry;
pub use backend::*;
pub use confd::*;
pub use monitoring::*;
pub use retry::*;


//---
use std::env;
use std::path::PathBuf;

use config::Config as ConfigBuilder;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::Result;

/// Main config file used when neither an explicit path nor `CONFIG_PATH` is given
const DEFAULT_CONFIG_PATH: &str = "config/confd";

/// Where and how the agent writes its own log
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_log_file")]
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            file_name: default_log_file(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_log_file() -> String {
    "confd.log".into()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Processing run configuration
    #[serde(default)]
    pub confd: Config,
    /// Key/value backend connection
    #[serde(default)]
    pub backend: BackendConfig,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Agent log output
    #[serde(default)]
    pub log: LogConfig,
}

impl Settings {
    /// Load configuration from multiple sources with priority:
    /// 1. Main config file
    /// 2. Local overrides
    /// 3. Environment variables
    ///
    /// # Arguments
    /// * `config_path` - Optional path to the main configuration file, falls back to the
    ///   `CONFIG_PATH` environment variable
    ///
    /// # Returns
    /// Merged and validated configuration
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = ConfigBuilder::builder();

        // 1. Main config file
        if let Some(path) = config_path {
            config = config.add_source(File::with_name(path).required(true));
        } else if let Ok(path) = env::var("CONFIG_PATH") {
            config = config.add_source(File::with_name(&path).required(true));
        } else {
            config = config.add_source(File::with_name(DEFAULT_CONFIG_PATH).required(false));
        }

        // 2. Local overrides
        config = config.add_source(File::with_name("config/local").required(false));

        // 3. Environment variables (highest priority)
        config = config.add_source(
            Environment::with_prefix("CONFD")
                .prefix_separator("__")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("backend.host"),
        );

        let settings: Settings = config.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.confd.validate()?;
        self.backend.validate()?;
        self.monitoring.validate()?;
        Ok(())
    }
}
