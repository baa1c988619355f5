use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use crate::constants::INITIAL_CURSOR;
use crate::BackendClient;
use crate::BackendError;
use crate::Result;

/// In-process backend with revisioned writes and working watches.
///
/// Records every key list passed to `get_values` so tests can assert on
/// what the processor asked for.
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, String>>,
    /// (key, revision) of every write or delete
    events: Mutex<Vec<(String, u64)>>,
    revision: watch::Sender<u64>,
    /// Revision each key was last fetched at
    fetched_at: Mutex<HashMap<String, u64>>,
    watch_supported: bool,
    fail_gets: AtomicBool,
    pub get_calls: Mutex<Vec<Vec<String>>>,
    pub watch_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(INITIAL_CURSOR);
        Self {
            data: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            revision,
            fetched_at: Mutex::new(HashMap::new()),
            watch_supported: true,
            fail_gets: AtomicBool::new(false),
            get_calls: Mutex::new(Vec::new()),
            watch_calls: AtomicUsize::new(0),
        }
    }

    pub fn without_watch() -> Self {
        Self {
            watch_supported: false,
            ..Self::new()
        }
    }

    pub fn with_values(values: &[(&str, &str)]) -> Self {
        let backend = Self::new();
        for (k, v) in values {
            backend.put(k, v);
        }
        backend
    }

    pub fn put(
        &self,
        key: &str,
        value: &str,
    ) {
        self.data.lock().insert(key.to_string(), value.to_string());
        self.bump(key);
    }

    pub fn delete(
        &self,
        key: &str,
    ) {
        self.data.lock().remove(key);
        self.bump(key);
    }

    pub fn fail_gets(
        &self,
        fail: bool,
    ) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Number of `get_values` calls that asked for `key`
    pub fn gets_of(
        &self,
        key: &str,
    ) -> usize {
        self.get_calls.lock().iter().filter(|keys| keys.iter().any(|k| k == key)).count()
    }

    fn bump(
        &self,
        key: &str,
    ) {
        let mut events = self.events.lock();
        let rev = *self.revision.borrow() + 1;
        events.push((key.to_string(), rev));
        self.revision.send_replace(rev);
    }

    fn changed_since(
        &self,
        prefix: &str,
        keys: &[String],
        since: u64,
    ) -> Option<u64> {
        self.events
            .lock()
            .iter()
            .filter(|(k, rev)| *rev > since && k.starts_with(prefix))
            .filter(|(k, _)| keys.iter().any(|watched| k.starts_with(watched.as_str())))
            .map(|(_, rev)| *rev)
            .max()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        self.get_calls.lock().push(keys.to_vec());
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(BackendError::InvalidResponse("injected failure".into()).into());
        }
        let data = self.data.lock();
        let revision = *self.revision.borrow();
        let mut fetched_at = self.fetched_at.lock();
        for key in keys {
            fetched_at.insert(key.clone(), revision);
        }
        Ok(data
            .iter()
            .filter(|(k, _)| keys.iter().any(|key| k.starts_with(key.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        keys: &[String],
        cursor: u64,
        stop: CancellationToken,
    ) -> Result<u64> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if cursor == 0 {
            return Ok(INITIAL_CURSOR);
        }
        let mut rx = self.revision.subscribe();
        let since = if cursor <= INITIAL_CURSOR {
            // changes made after the last fetch must not be lost
            let fetched_at = self.fetched_at.lock();
            keys.iter()
                .filter_map(|k| fetched_at.get(k).copied())
                .min()
                .unwrap_or_else(|| *rx.borrow())
        } else {
            cursor
        };
        loop {
            if let Some(rev) = self.changed_since(prefix, keys, since) {
                return Ok(rev);
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(cursor),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(BackendError::WatchCanceled("backend dropped".into()).into());
                    }
                }
            }
        }
    }

    fn watch_enabled(&self) -> bool {
        self.watch_supported
    }

    async fn close(&self) {}
}
