use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::Response;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::warn;

use super::etcd::normalize_endpoint;
use super::key_pairs;
use super::remap_with_pairs;
use crate::constants::INITIAL_CURSOR;
use crate::constants::METAD_VERSION_HEADER;
use crate::BackendClient;
use crate::BackendConfig;
use crate::BackendError;
use crate::Error;
use crate::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Client of a tree-structured HTTP metadata service.
///
/// Endpoints form a ring; the client sticks to one until it fails and then
/// moves to the next. Watches are long polls whose cursor comes from the
/// version response header, not from the payload.
pub struct MetadClient {
    config: BackendConfig,
    http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
}

impl MetadClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(BackendError::NoEndpoints(config.backend_type.clone()).into());
        }
        let endpoints: Vec<String> = config.host.iter().map(|h| normalize_endpoint(h, false)).collect();
        let http = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        // Spread agents over the ring instead of all hitting the first host.
        let start = rand::thread_rng().gen_range(0..endpoints.len());
        Ok(Self {
            config,
            http,
            endpoints,
            current: AtomicUsize::new(start),
        })
    }

    pub fn current_endpoint(&self) -> &str {
        &self.endpoints[self.current.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    fn advance(
        &self,
        from: usize,
    ) {
        let _ = self.current.compare_exchange(
            from,
            (from + 1) % self.endpoints.len(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// GET `path` with `query`, failing over around the ring.
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut last = String::from("no endpoint tried");
        for _ in 0..self.endpoints.len() {
            let idx = self.current.load(Ordering::Relaxed) % self.endpoints.len();
            let url = format!("{}{}", self.endpoints[idx], path);
            let mut request = self.http.get(&url).header(ACCEPT, "application/json").query(query);
            if let Some(t) = timeout {
                request = request.timeout(t);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    warn!("metad {} answered {}", url, resp.status());
                    last = format!("{} answered {}", url, resp.status());
                    self.advance(idx);
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!("metad request {} failed: {}", url, e);
                    last = e.to_string();
                    self.advance(idx);
                }
            }
        }
        Err(BackendError::AllEndpointsFailed {
            count: self.endpoints.len(),
            last,
        }
        .into())
    }

    async fn watch_loop(
        &self,
        real_prefix: &str,
        real_keys: &[String],
        mut cursor: u64,
    ) -> Result<u64> {
        loop {
            let resp = self
                .get(
                    real_prefix,
                    &[("wait", "true".to_string()), ("prev_version", cursor.to_string())],
                    None,
                )
                .await?;
            if !resp.status().is_success() {
                return Err(BackendError::InvalidResponse(format!("watch answered {}", resp.status())).into());
            }
            let version = resp
                .headers()
                .get(METAD_VERSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    BackendError::InvalidResponse(format!("missing or invalid {METAD_VERSION_HEADER} header"))
                })?;
            let body: serde_json::Value = resp.json().await?;

            let mut changed = HashMap::new();
            flatten_json(real_prefix, &body, &mut changed);
            if changed.keys().any(|k| real_keys.iter().any(|rk| k.starts_with(rk.as_str()))) {
                debug!("metad watch on {} fired at version {}", real_prefix, version);
                return Ok(version.max(INITIAL_CURSOR + 1));
            }
            cursor = version;
        }
    }
}

#[async_trait]
impl BackendClient for MetadClient {
    fn backend_type(&self) -> &'static str {
        "metad"
    }

    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        let pairs = key_pairs(keys, |k| self.config.real_key(k));
        let mut values = HashMap::new();
        for (_, real) in &pairs {
            let resp = self.get(real, &[], Some(REQUEST_TIMEOUT)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                debug!("metad has no value under {}", real);
                continue;
            }
            if !resp.status().is_success() {
                return Err(BackendError::InvalidResponse(format!("GET {} answered {}", real, resp.status())).into());
            }
            let body: serde_json::Value = resp.json().await.map_err(Error::from)?;
            let mut flat = HashMap::new();
            flatten_json(real, &body, &mut flat);
            for (k, v) in flat {
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
            r = self.watch_loop(&real_prefix, &real_keys, cursor) => r,
        }
    }

    fn watch_enabled(&self) -> bool {
        true
    }

    async fn close(&self) {
        // reqwest pools connections internally and releases them on drop
        debug!("metad client closed");
    }
}

/// Flattens a JSON tree rooted at `base` into `/a/b` → value pairs.
///
/// Scalars are stringified, arrays are indexed, nulls are skipped.
pub(crate) fn flatten_json(
    base: &str,
    value: &serde_json::Value,
    out: &mut HashMap<String, String>,
) {
    use serde_json::Value;
    let child = |name: &str| {
        if base.ends_with('/') {
            format!("{base}{name}")
        } else {
            format!("{base}/{name}")
        }
    };
    match value {
        Value::Null => {}
        Value::String(s) => {
            out.insert(base.to_string(), s.clone());
        }
        Value::Bool(b) => {
            out.insert(base.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(base.to_string(), n.to_string());
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_json(&child(&i.to_string()), item, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                flatten_json(&child(k), v, out);
            }
        }
    }
}
