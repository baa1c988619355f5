use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use config::ConfigError;
use minijinja::Value;
use serde::Deserialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Observes the outcome of a check, reload or update step.
///
/// Arguments are the destination path, the command string (empty for
/// updates) and the error the step produced, if any.
pub type CommandHook = Arc<dyn Fn(&Path, &str, Option<&Error>) + Send + Sync>;

/// Rewrites a logical absolute key into a backend-specific key.
pub type KeyHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Extra template function, called with the positional arguments of the
/// template call site.
pub type TemplateFn =
    Arc<dyn Fn(&[Value]) -> std::result::Result<Value, minijinja::Error> + Send + Sync>;

/// Scheduling strategy of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Interval,
    Watch,
}

/// Callbacks fired by the resource processors
#[derive(Clone, Default)]
pub struct Hooks {
    /// Fired after `check_cmd` ran
    pub on_check_cmd_done: Option<CommandHook>,

    /// Fired after `reload_cmd` ran
    pub on_reload_cmd_done: Option<CommandHook>,

    /// Fired after the destination file was replaced (or failed to be)
    pub on_update_done: Option<CommandHook>,

    /// Maps logical keys onto the backend namespace before fetch and watch
    pub abs_key_adjuster: Option<KeyHook>,

    /// Maps keys passed to template accessors before the KvStore lookup
    pub template_key_adjuster: Option<KeyHook>,
}

/// Configuration of one processing run
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Root of the resource tree: descriptors in `conf.d`, templates in `templates`
    #[serde(default = "default_confdir")]
    pub confdir: PathBuf,

    /// Seconds between two passes in interval mode
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Overrides the `prefix` of every resource when set
    #[serde(default)]
    pub prefix: Option<String>,

    /// Render and compare only, never touch destinations
    #[serde(default)]
    pub noop: bool,

    /// Run each resource once and return
    #[serde(default)]
    pub onetime: bool,

    /// Re-run resources on backend change notifications
    #[serde(default)]
    pub watch: bool,

    /// Converge files without running check/reload commands
    #[serde(default)]
    pub sync_only: bool,

    /// Keep staged files that were not used to replace a destination
    #[serde(default)]
    pub keep_stage_file: bool,

    /// PEM file holding the private key for encrypted values
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// PEM private key, takes precedence over `private_key_file`
    #[serde(default)]
    pub private_key: Option<String>,

    /// Backoff between failed watch calls
    #[serde(default)]
    pub retry: BackoffPolicy,

    #[serde(skip)]
    pub func_map: HashMap<String, TemplateFn>,

    #[serde(skip)]
    pub hooks: Hooks,
}

impl Debug for Config {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("confdir", &self.confdir)
            .field("interval", &self.interval)
            .field("prefix", &self.prefix)
            .field("noop", &self.noop)
            .field("onetime", &self.onetime)
            .field("watch", &self.watch)
            .field("sync_only", &self.sync_only)
            .field("keep_stage_file", &self.keep_stage_file)
            .field("func_map", &self.func_map.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confdir: default_confdir(),
            interval: default_interval(),
            prefix: None,
            noop: false,
            onetime: false,
            watch: false,
            sync_only: false,
            keep_stage_file: false,
            private_key_file: None,
            private_key: None,
            retry: BackoffPolicy::default(),
            func_map: HashMap::new(),
            hooks: Hooks::default(),
        }
    }
}

impl Config {
    /// Rejects contradictory mode flags and unusable values
    pub fn validate(&self) -> Result<()> {
        if self.onetime && self.watch {
            return Err(Error::Config(ConfigError::Message(
                "onetime and watch mode are mutually exclusive".into(),
            )));
        }

        if !self.onetime && self.interval == 0 {
            return Err(Error::Config(ConfigError::Message(
                "interval must be greater than 0 unless onetime is set".into(),
            )));
        }

        if self.confdir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message("confdir must not be empty".into())));
        }

        self.retry.validate()?;

        Ok(())
    }

    pub fn mode(&self) -> RunMode {
        if self.onetime {
            RunMode::Once
        } else if self.watch {
            RunMode::Watch
        } else {
            RunMode::Interval
        }
    }

    /// Directory holding the resource descriptors
    pub fn conf_d_dir(&self) -> PathBuf {
        self.confdir.join("conf.d")
    }

    /// Directory holding the source templates
    pub fn templates_dir(&self) -> PathBuf {
        self.confdir.join("templates")
    }

    /// PEM key material for decrypting accessors, if any.
    pub fn decryption_key(&self) -> Result<Option<String>> {
        if let Some(key) = &self.private_key {
            return Ok(Some(key.clone()));
        }
        match &self.private_key_file {
            Some(path) => std::fs::read_to_string(path).map(Some).map_err(|e| {
                Error::System(crate::SystemError::PathError {
                    path: path.clone(),
                    source: e,
                })
            }),
            None => Ok(None),
        }
    }

    pub fn with_hooks(
        mut self,
        hooks: Hooks,
    ) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_func(
        mut self,
        name: impl Into<String>,
        f: TemplateFn,
    ) -> Self {
        self.func_map.insert(name.into(), f);
        self
    }
}

fn default_confdir() -> PathBuf {
    PathBuf::from("/etc/confd")
}
fn default_interval() -> u64 {
    600
}
