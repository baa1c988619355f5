use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use super::BackendClient;
use super::EtcdClient;
use super::MetadClient;
use crate::BackendConfig;
use crate::BackendError;
use crate::Result;

/// Builds a connected client from its configuration
pub type BackendConstructor =
    Arc<dyn Fn(BackendConfig) -> BoxFuture<'static, Result<Arc<dyn BackendClient>>> + Send + Sync>;

/// Maps backend type names to constructors.
///
/// Created explicitly at process start and handed to whoever builds clients.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `etcdv3` (alias `etcd`) and `metad` backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let etcd: BackendConstructor = Arc::new(|cfg| {
            async move {
                let client = EtcdClient::connect(cfg).await?;
                Ok(Arc::new(client) as Arc<dyn BackendClient>)
            }
            .boxed()
        });
        registry.register("etcdv3", etcd.clone());
        registry.register("etcd", etcd);
        registry.register(
            "metad",
            Arc::new(|cfg| {
                async move {
                    let client = MetadClient::new(cfg)?;
                    Ok(Arc::new(client) as Arc<dyn BackendClient>)
                }
                .boxed()
            }),
        );
        registry
    }

    /// Adds or replaces the constructor of `name`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: BackendConstructor,
    ) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds the client registered for `config.backend_type`.
    ///
    /// # Errors
    /// [`BackendError::UnknownBackendType`] for unregistered types, plus
    /// whatever the constructor reports.
    pub async fn new_backend_client(
        &self,
        config: BackendConfig,
    ) -> Result<Arc<dyn BackendClient>> {
        config.validate()?;
        let constructor = self
            .constructors
            .get(&config.backend_type)
            .ok_or_else(|| BackendError::UnknownBackendType(config.backend_type.clone()))?;
        info!(backend = %config.backend_type, hosts = ?config.host, "creating backend client");
        constructor(config).await
    }
}
