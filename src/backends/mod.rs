//! Key/value backend abstraction.
//!
//! Every backend implements [`BackendClient`]; concrete clients are selected
//! once through a [`BackendRegistry`] and then only used through the trait.
//!
//! ```ignore
//! let registry = BackendRegistry::with_defaults();
//! let client = registry.new_backend_client(backend_config).await?;
//! let values = client.get_values(&["/app/worker_count".to_string()]).await?;
//! ```

mod etcd;
mod metad;
mod registry;

pub use etcd::*;
pub use metad::*;
pub use registry::*;


use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use crate::Result;

/// Uniform interface over key/value sources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Registered type name of this client
    fn backend_type(&self) -> &'static str;

    /// Prefix scan of each key, merged into one mapping keyed by logical key.
    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>>;

    /// Blocks until a key under `prefix` starting with one of `keys`
    /// changes, or `stop` fires.
    ///
    /// A `cursor` of zero returns [`INITIAL_CURSOR`](crate::constants::INITIAL_CURSOR)
    /// immediately without contacting the backend, so the caller performs
    /// its first full fetch. On stop the given cursor is returned unchanged.
    /// On error the caller keeps its previous cursor and retries with backoff.
    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        cursor: u64,
        stop: CancellationToken,
    ) -> Result<u64>;

    /// Whether push notification is supported; interval polling otherwise
    fn watch_enabled(&self) -> bool;

    /// Releases pooled connections
    async fn close(&self);
}

/// Rewrites a key returned by the backend from the `real` namespace back to
/// the `logical` one it was requested under.
///
/// Keys outside `real` are returned unchanged.
pub fn remap_to_logical(
    logical: &str,
    real: &str,
    key: &str,
) -> String {
    if logical == real {
        return key.to_string();
    }
    match key.strip_prefix(real) {
        Some(rest) => format!("{logical}{rest}"),
        None => key.to_string(),
    }
}

/// Pairs each logical key with its backend key, longest real key first so
/// nested keys are remapped by their most specific request.
pub(crate) fn key_pairs(
    keys: &[String],
    real_key: impl Fn(&str) -> String,
) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = keys.iter().map(|k| (k.clone(), real_key(k))).collect();
    pairs.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    pairs
}

/// Maps `key` back through the first pair whose real key prefixes it.
pub(crate) fn remap_with_pairs(
    pairs: &[(String, String)],
    key: &str,
) -> String {
    pairs
        .iter()
        .find(|(_, real)| key.starts_with(real.as_str()))
        .map(|(logical, real)| remap_to_logical(logical, real, key))
        .unwrap_or_else(|| key.to_string())
}
