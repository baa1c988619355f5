use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Code;
use tonic::Request;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::pool::prefix_range_end;
use super::pool::ConnectionPool;
use crate::backends::key_pairs;
use crate::backends::remap_with_pairs;
use crate::constants::INITIAL_CURSOR;
use crate::proto::etcdserverpb::auth_client::AuthClient;
use crate::proto::etcdserverpb::kv_client::KvClient;
use crate::proto::etcdserverpb::watch_client::WatchClient;
use crate::proto::etcdserverpb::watch_request::RequestUnion;
use crate::proto::etcdserverpb::AuthenticateRequest;
use crate::proto::etcdserverpb::RangeRequest;
use crate::proto::etcdserverpb::WatchCreateRequest;
use crate::proto::etcdserverpb::WatchRequest;
use crate::BackendClient;
use crate::BackendConfig;
use crate::BackendError;
use crate::Error;
use crate::Result;

const TOKEN_METADATA_KEY: &str = "token";

/// Client of an etcd v3 compatible cluster store.
///
/// Channels are pooled per endpoint; a failing endpoint is skipped in favor
/// of the next one. When `user` is configured, an auth token is obtained
/// lazily and refreshed when the server rejects it.
///
/// The store revision of the last fetch of each key is remembered, so the
/// first watch after a fetch replays every change made since that fetch.
pub struct EtcdClient {
    config: BackendConfig,
    pool: ConnectionPool,
    token: ArcSwapOption<String>,
    pub(super) fetched_at: DashMap<String, i64>,
}

impl EtcdClient {
    /// Creates the client. Channels connect lazily, so an unreachable
    /// cluster surfaces on the first request rather than here.
    pub async fn connect(config: BackendConfig) -> Result<Self> {
        let client = Self::new(config)?;
        info!(hosts = ?client.config.host, tls = client.config.tls_enabled(), "etcd client ready");
        Ok(client)
    }

    /// Creates the client without contacting any endpoint.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let pool = ConnectionPool::new(&config)?;
        Ok(Self {
            config,
            pool,
            token: ArcSwapOption::empty(),
            fetched_at: DashMap::new(),
        })
    }

    async fn authenticate(
        &self,
        channel: Channel,
    ) -> Result<()> {
        if !self.config.has_credentials() || self.token.load().is_some() {
            return Ok(());
        }
        let mut auth = AuthClient::new(channel);
        let resp = auth
            .authenticate(AuthenticateRequest {
                name: self.config.user.clone(),
                password: self.config.password.clone(),
            })
            .await?;
        debug!("etcd auth token acquired for {}", self.config.user);
        self.token.store(Some(Arc::new(resp.into_inner().token)));
        Ok(())
    }

    fn authorized<T>(
        &self,
        message: T,
    ) -> Result<Request<T>> {
        let mut request = Request::new(message);
        if let Some(token) = self.token.load_full() {
            let value = MetadataValue::try_from(token.as_str())
                .map_err(|e| BackendError::InvalidResponse(format!("invalid auth token: {e}")))?;
            request.metadata_mut().insert(TOKEN_METADATA_KEY, value);
        }
        Ok(request)
    }

    /// Runs `op` against each endpoint in rotation until one succeeds.
    async fn with_failover<T, F, Fut>(
        &self,
        op_name: &str,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Channel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = String::from("no endpoint tried");
        for endpoint in self.pool.rotation() {
            let channel = self.pool.channel(&endpoint)?;
            if let Err(e) = self.authenticate(channel.clone()).await {
                warn!("{} auth on {} failed: {}", op_name, endpoint, e);
                self.pool.mark_failed(&endpoint);
                last = e.to_string();
                continue;
            }
            match op(channel).await {
                Ok(v) => return Ok(v),
                Err(Error::Backend(BackendError::TonicStatusError(status))) if !is_retryable(&status) => {
                    if status.code() == Code::Unauthenticated {
                        self.token.store(None);
                    }
                    return Err(BackendError::TonicStatusError(status).into());
                }
                Err(e) => {
                    warn!("{} on {} failed: {}", op_name, endpoint, e);
                    self.pool.mark_failed(&endpoint);
                    last = e.to_string();
                }
            }
        }
        error!("{} failed on every endpoint", op_name);
        Err(BackendError::AllEndpointsFailed {
            count: self.pool.len(),
            last,
        }
        .into())
    }

    /// Store revision of the response and the key/value pairs in range
    async fn range(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
    ) -> Result<(i64, Vec<(String, String)>)> {
        self.with_failover("range", |channel| {
            let request = RangeRequest {
                key: key.clone(),
                range_end: range_end.clone(),
                ..Default::default()
            };
            async move {
                let mut kv = KvClient::new(channel);
                let resp = kv.range(self.authorized(request)?).await?.into_inner();
                let revision = resp.header.as_ref().map(|h| h.revision).unwrap_or_default();
                let kvs = resp
                    .kvs
                    .into_iter()
                    .map(|kv| {
                        (
                            String::from_utf8_lossy(&kv.key).into_owned(),
                            String::from_utf8_lossy(&kv.value).into_owned(),
                        )
                    })
                    .collect();
                Ok((revision, kvs))
            }
        })
        .await
    }

    /// Revision a watch without a cursor starts from: right after the
    /// oldest fetch of the watched keys, or the current revision (0) when
    /// none of them was fetched yet.
    pub(super) fn first_watch_revision(
        &self,
        real_keys: &[String],
    ) -> i64 {
        real_keys
            .iter()
            .filter_map(|k| self.fetched_at.get(k).map(|r| *r))
            .filter(|r| *r > 0)
            .min()
            .map(|r| r + 1)
            .unwrap_or(0)
    }

    async fn watch_once(
        &self,
        real_prefix: &str,
        real_keys: &[String],
        cursor: u64,
    ) -> Result<u64> {
        let start_revision = if cursor <= INITIAL_CURSOR {
            self.first_watch_revision(real_keys)
        } else {
            cursor as i64 + 1
        };
        let create = WatchRequest {
            request_union: Some(RequestUnion::CreateRequest(WatchCreateRequest {
                key: real_prefix.as_bytes().to_vec(),
                range_end: prefix_range_end(real_prefix.as_bytes()),
                start_revision,
                ..Default::default()
            })),
        };

        let endpoint = self
            .pool
            .rotation()
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::NoEndpoints(self.config.backend_type.clone()))?;
        let channel = self.pool.channel(&endpoint)?;
        self.authenticate(channel.clone()).await?;

        // Keep the request side open: closing it ends the watch server-side.
        let outbound = tokio_stream::once(create).chain(tokio_stream::pending());
        let mut client = WatchClient::new(channel);
        let mut inbound = match client.watch(self.authorized(outbound)?).await {
            Ok(resp) => resp.into_inner(),
            Err(status) => {
                if is_retryable(&status) {
                    self.pool.mark_failed(&endpoint);
                }
                return Err(status.into());
            }
        };

        loop {
            let resp = match inbound.message().await {
                Ok(Some(resp)) => resp,
                Ok(None) => return Err(BackendError::InvalidResponse("watch stream closed".into()).into()),
                Err(status) => {
                    if is_retryable(&status) {
                        self.pool.mark_failed(&endpoint);
                    }
                    return Err(status.into());
                }
            };
            if resp.canceled {
                if resp.compact_revision > 0 {
                    // history is gone: report a change so the caller refetches
                    // everything, then resume from the compaction point
                    warn!(
                        "watch on {} hit compaction at {}: {}",
                        real_prefix, resp.compact_revision, resp.cancel_reason
                    );
                    return Ok((resp.compact_revision as u64).max(INITIAL_CURSOR + 1));
                }
                return Err(BackendError::WatchCanceled(resp.cancel_reason).into());
            }
            let revision = resp.header.as_ref().map(|h| h.revision).unwrap_or_default();
            for event in &resp.events {
                let Some(kv) = &event.kv else { continue };
                let key = String::from_utf8_lossy(&kv.key);
                if real_keys.iter().any(|k| key.starts_with(k.as_str())) {
                    debug!("watch on {} fired by {}", real_prefix, key);
                    let revision = revision.max(kv.mod_revision);
                    return Ok((revision.max(0) as u64).max(INITIAL_CURSOR + 1));
                }
            }
        }
    }
}

#[async_trait]
impl BackendClient for EtcdClient {
    fn backend_type(&self) -> &'static str {
        "etcdv3"
    }

    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        let pairs = key_pairs(keys, |k| self.config.real_key(k));
        let mut values = HashMap::new();
        for (_, real) in &pairs {
            let (revision, kvs) = self
                .range(real.as_bytes().to_vec(), prefix_range_end(real.as_bytes()))
                .await?;
            self.fetched_at.insert(real.clone(), revision);
            for (k, v) in kvs {
                values.insert(remap_with_pairs(&pairs, &k), v);
            }
        }
        Ok(values)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        cursor: u64,
        stop: CancellationToken,
    ) -> Result<u64> {
        if cursor == 0 {
            return Ok(INITIAL_CURSOR);
        }
        let real_prefix = self.config.real_key(prefix);
        let real_keys: Vec<String> = keys.iter().map(|k| self.config.real_key(k)).collect();

        tokio::select! {
            _ = stop.cancelled() => Ok(cursor),
            r = self.watch_once(&real_prefix, &real_keys, cursor) => r,
        }
    }

    fn watch_enabled(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.pool.clear();
        self.fetched_at.clear();
        self.token.store(None);
    }
}

fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Unknown | Code::Aborted | Code::Cancelled
    )
}
