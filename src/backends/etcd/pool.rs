use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tonic::transport::Certificate;
use tonic::transport::Channel;
use tonic::transport::ClientTlsConfig;
use tonic::transport::Endpoint;
use tonic::transport::Identity;
use tracing::debug;
use tracing::trace;

use crate::BackendConfig;
use crate::BackendError;
use crate::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-endpoint gRPC channels with round-robin failover.
///
/// Channels are created lazily and cached; a failed endpoint is evicted and
/// the rotation moves on to the next one.
pub(crate) struct ConnectionPool {
    endpoints: Vec<String>,
    channels: DashMap<String, Channel>,
    tls: Option<ClientTlsConfig>,
    next: AtomicUsize,
}

impl ConnectionPool {
    pub(crate) fn new(config: &BackendConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(BackendError::NoEndpoints(config.backend_type.clone()).into());
        }
        let tls = if config.tls_enabled() {
            Some(Self::load_tls(config)?)
        } else {
            None
        };
        let endpoints = config
            .host
            .iter()
            .map(|h| normalize_endpoint(h, tls.is_some()))
            .collect();

        Ok(Self {
            endpoints,
            channels: DashMap::new(),
            tls,
            next: AtomicUsize::new(0),
        })
    }

    fn load_tls(config: &BackendConfig) -> Result<ClientTlsConfig> {
        let read = |path: &str| {
            std::fs::read(path).map_err(|e| BackendError::Tls(format!("cannot read {path}: {e}")))
        };
        let mut tls = ClientTlsConfig::new();
        if !config.client_ca_keys.is_empty() {
            tls = tls.ca_certificate(Certificate::from_pem(read(&config.client_ca_keys)?));
        }
        if !config.client_cert.is_empty() {
            let cert = read(&config.client_cert)?;
            let key = read(&config.client_key)?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        Ok(tls)
    }

    /// Endpoints in failover order, starting with the current one
    pub(crate) fn rotation(&self) -> Vec<String> {
        let start = self.next.load(Ordering::Relaxed) % self.endpoints.len();
        self.endpoints[start..]
            .iter()
            .chain(self.endpoints[..start].iter())
            .cloned()
            .collect()
    }

    /// Get or create the channel of `endpoint`
    pub(crate) fn channel(
        &self,
        endpoint: &str,
    ) -> Result<Channel> {
        // Fast path: cached channel
        if let Some(channel) = self.channels.get(endpoint) {
            trace!("reuse channel to {}", endpoint);
            return Ok(channel.clone());
        }

        debug!("establishing channel to {}", endpoint);
        let mut builder = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| BackendError::InvalidURI(format!("{endpoint}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Some(TCP_KEEPALIVE))
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT);
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.clone()).map_err(Box::new).map_err(BackendError::from)?;
        }
        let channel = builder.connect_lazy();
        self.channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    /// Evicts the channel of a failing endpoint and advances the rotation
    pub(crate) fn mark_failed(
        &self,
        endpoint: &str,
    ) {
        debug!("endpoint {} failed, rotating", endpoint);
        self.channels.remove(endpoint);
        if let Some(idx) = self.endpoints.iter().position(|e| e == endpoint) {
            let _ = self.next.compare_exchange(
                idx,
                (idx + 1) % self.endpoints.len(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    pub(crate) fn clear(&self) {
        self.channels.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }
}

/// Adds a scheme to bare `host:port` endpoints
pub(crate) fn normalize_endpoint(
    host: &str,
    tls: bool,
) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else if tls {
        format!("https://{host}")
    } else {
        format!("http://{host}")
    }
}

/// Smallest key greater than every key starting with `prefix`
pub(crate) fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // every byte was 0xff: range to the end of the keyspace
    vec![0]
}
