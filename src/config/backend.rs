use std::fmt::Debug;
use std::path::Path;

use config::Config;
use config::ConfigError;
use config::File;
use config::FileFormat;
use serde::Deserialize;

use super::KeyHook;
use crate::Error;
use crate::Result;
use crate::SystemError;

/// Connection settings of one key/value backend
#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    /// Registered backend type, e.g. `etcdv3` or `metad`
    #[serde(rename = "type", default = "default_backend_type")]
    pub backend_type: String,

    /// Endpoint addresses
    #[serde(default)]
    pub host: Vec<String>,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// CA bundle used to verify the backend (PEM path)
    #[serde(default)]
    pub client_ca_keys: String,

    /// Client certificate for mutual TLS (PEM path)
    #[serde(default)]
    pub client_cert: String,

    /// Client private key for mutual TLS (PEM path)
    #[serde(default)]
    pub client_key: String,

    #[serde(skip)]
    pub real_key: Option<KeyHook>,
}

impl Debug for BackendConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("type", &self.backend_type)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("client_ca_keys", &self.client_ca_keys)
            .field("client_cert", &self.client_cert)
            .field("client_key", &self.client_key)
            .field("real_key", &self.real_key.is_some())
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: default_backend_type(),
            host: Vec::new(),
            user: String::new(),
            password: String::new(),
            client_ca_keys: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
            real_key: None,
        }
    }
}

impl BackendConfig {
    /// Loads a backend config from a TOML file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cfg: BackendConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds a backend config from a JSON document
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: BackendConfig = serde_json::from_str(s).map_err(SystemError::Json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_type.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message("backend type must not be empty".into())));
        }
        if self.host.iter().any(|h| h.trim().is_empty()) {
            return Err(Error::Config(ConfigError::Message(
                "backend host entries must not be empty".into(),
            )));
        }
        let mtls = [&self.client_cert, &self.client_key];
        if mtls.iter().filter(|v| v.is_empty()).count() == 1 {
            return Err(Error::Config(ConfigError::Message(
                "client_cert and client_key must be set together".into(),
            )));
        }
        Ok(())
    }

    /// Applies the key-rewriting hook, identity when none is installed
    pub fn real_key(
        &self,
        abs_key: &str,
    ) -> String {
        match &self.real_key {
            Some(f) => f(abs_key),
            None => abs_key.to_string(),
        }
    }

    pub fn tls_enabled(&self) -> bool {
        !self.client_ca_keys.is_empty() || !self.client_cert.is_empty()
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty()
    }

    pub fn with_real_key(
        mut self,
        hook: KeyHook,
    ) -> Self {
        self.real_key = Some(hook);
        self
    }
}

fn default_backend_type() -> String {
    "etcdv3".into()
}
