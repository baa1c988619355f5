use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use libconfd::constants::INITIAL_CURSOR;
use libconfd::BackendClient;
use libconfd::BackendError;
use libconfd::Config;
use libconfd::Result;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

/// Key/value backend living in the test process.
///
/// Every write bumps a version; watchers wake up on any change made after
/// their last fetch.
pub struct SharedBackend {
    data: Mutex<BTreeMap<String, String>>,
    version: watch::Sender<u64>,
    fetched_at: Mutex<HashMap<String, u64>>,
    watch: bool,
}

impl SharedBackend {
    pub fn new(watch: bool) -> Self {
        let (version, _) = watch::channel(INITIAL_CURSOR);
        Self {
            data: Mutex::new(BTreeMap::new()),
            version,
            fetched_at: Mutex::new(HashMap::new()),
            watch,
        }
    }

    pub fn set(
        &self,
        key: &str,
        value: &str,
    ) {
        self.data.lock().insert(key.to_string(), value.to_string());
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl BackendClient for SharedBackend {
    fn backend_type(&self) -> &'static str {
        "shared"
    }

    async fn get_values(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, String>> {
        let data = self.data.lock();
        let version = *self.version.borrow();
        let mut fetched_at = self.fetched_at.lock();
        for key in keys {
            fetched_at.insert(key.clone(), version);
        }
        Ok(data
            .iter()
            .filter(|(k, _)| keys.iter().any(|p| k.starts_with(p.as_str())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(
        &self,
        _prefix: &str,
        keys: &[String],
        cursor: u64,
        stop: CancellationToken,
    ) -> Result<u64> {
        if cursor == 0 {
            return Ok(INITIAL_CURSOR);
        }
        let mut rx = self.version.subscribe();
        let since = if cursor <= INITIAL_CURSOR {
            let fetched_at = self.fetched_at.lock();
            keys.iter()
                .filter_map(|k| fetched_at.get(k).copied())
                .min()
                .unwrap_or_else(|| *rx.borrow())
        } else {
            cursor
        };
        loop {
            let current = *rx.borrow_and_update();
            if current > since {
                return Ok(current);
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(cursor),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(BackendError::WatchCanceled("backend gone".into()).into());
                    }
                }
            }
        }
    }

    fn watch_enabled(&self) -> bool {
        self.watch
    }

    async fn close(&self) {}
}

/// A confdir on disk with descriptors, templates and an output directory.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["conf.d", "templates", "out"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn out(
        &self,
        name: &str,
    ) -> PathBuf {
        self.root().join("out").join(name)
    }

    /// Adds a resource rendering `templates/{name}.tmpl` into `out/{name}`
    pub fn add_resource(
        &self,
        name: &str,
        prefix: &str,
        keys: &[&str],
        template: &str,
        extra: &str,
    ) {
        fs::write(self.root().join("templates").join(format!("{name}.tmpl")), template).unwrap();
        let keys = keys.iter().map(|k| format!("{k:?}")).collect::<Vec<_>>().join(", ");
        let descriptor = format!(
            "[template]\nsrc = \"{name}.tmpl\"\ndest = \"${{RUNTIME_CONFDIR}}/out/{name}\"\n\
             prefix = \"{prefix}\"\nkeys = [{keys}]\nmode = \"0644\"\n{extra}\n"
        );
        fs::write(self.root().join("conf.d").join(format!("{name}.toml")), descriptor).unwrap();
    }

    pub fn config(&self) -> Config {
        Config {
            confdir: self.root().to_path_buf(),
            onetime: true,
            ..Default::default()
        }
    }

    pub fn read(
        &self,
        name: &str,
    ) -> String {
        fs::read_to_string(self.out(name)).unwrap_or_default()
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until(
    timeout: Duration,
    check: impl Fn() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
